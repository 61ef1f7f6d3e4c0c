//! Stale-while-revalidate page serving.
//!
//! Pages are served from a persistent per-route cache. Fresh entries are
//! served directly, expired entries are served while a bounded pool of
//! background workers re-renders them, and absent entries are rendered
//! inline and stored.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
