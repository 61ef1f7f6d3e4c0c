//! Regenerating page cache.
//!
//! - **Entry store**: one durable record per route, keyed by the SHA-256 of
//!   the route string.
//! - **Regeneration queue**: bounded, deduplicating, priority-aware
//!   background re-rendering of stale routes.
//! - **Coordinator**: serves HIT / STALE / MISS and handles manual
//!   revalidation.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! directory = ".isr-cache"
//! max_workers = 2
//! purge_interval_seconds = 60
//! default_ttl_seconds = 300
//!
//! [[cache.routes]]
//! prefix = "/events"
//! ttl_seconds = 120
//! category = "events"
//! ```

mod config;
mod coordinator;
mod entry;
mod keys;
mod lock;
mod policy;
mod queue;
mod render;
mod store;
mod sweeper;

pub use config::CacheConfig;
pub use coordinator::{Coordinator, Freshness, RevalidationAck, ServedPage, StoreRegenerator};
pub use entry::{CacheEntry, MAX_TTL, MIN_TTL, RenderOutput, normalize_ttl};
pub use keys::{CacheKey, normalize_route};
pub use policy::{RouteRule, RouteTtlTable, TtlPolicy, UniformTtl};
pub use queue::{
    Priority, QueueConfig, QueueEvent, QueueSnapshot, RegenerationError, RevalidationJob,
    RegenerationQueue, RegenerationTask,
};
pub use render::{RenderError, Renderer};
pub use store::{EntryStore, PurgeReport, StoreError};
pub use sweeper::spawn_purge_loop;
