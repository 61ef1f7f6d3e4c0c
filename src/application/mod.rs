//! Application-level error taxonomy shared by the binary and the HTTP layer.

pub mod error;
