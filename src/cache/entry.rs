//! Cached page records.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;

/// Smallest TTL an entry may carry; anything shorter is raised to this.
pub const MIN_TTL: Duration = Duration::from_secs(1);
/// Largest TTL an entry may carry (one year).
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Result of rendering a route: the HTML plus caller-defined context.
///
/// The cache stores both verbatim and never looks inside them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderOutput {
    pub rendering: String,
    #[serde(default)]
    pub metadata: Value,
}

impl RenderOutput {
    pub fn new(rendering: impl Into<String>, metadata: Value) -> Self {
        Self {
            rendering: rendering.into(),
            metadata,
        }
    }

    /// Rendering without any metadata.
    pub fn html(rendering: impl Into<String>) -> Self {
        Self::new(rendering, Value::Null)
    }
}

/// One persisted rendering of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub route: String,
    pub rendering: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub ttl_ms: u64,
    /// Fixed at construction; staleness checks never re-derive it from `ttl_ms`.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl CacheEntry {
    pub fn new(
        route: impl Into<String>,
        output: RenderOutput,
        ttl: Duration,
        created_at: OffsetDateTime,
    ) -> Self {
        let route = route.into();
        let ttl = normalize_ttl(&route, ttl);
        let expires_at = created_at + ttl;

        Self {
            route,
            rendering: output.rendering,
            metadata: output.metadata,
            created_at,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            expires_at,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Time elapsed since the entry was rendered; zero if `now` precedes it.
    pub fn age_at(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(now - self.created_at).unwrap_or(Duration::ZERO)
    }

    pub fn is_stale_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Records read back from disk are checked before use; a record that
    /// violates the timing invariant is treated like a corrupt one.
    pub(crate) fn is_well_formed(&self) -> bool {
        self.expires_at > self.created_at && self.ttl_ms > 0
    }
}

/// Clamp `ttl` into `[MIN_TTL, MAX_TTL]`.
///
/// `ttl_ms` is persisted at millisecond precision, so a sub-second TTL
/// could otherwise round to zero and fail the well-formedness check.
pub fn normalize_ttl(route: &str, ttl: Duration) -> Duration {
    if ttl < MIN_TTL {
        warn!(
            route,
            requested_ttl_us = ttl.as_micros() as u64,
            min_ttl_ms = MIN_TTL.as_millis() as u64,
            "TTL below minimum raised"
        );
    }
    ttl.clamp(MIN_TTL, MAX_TTL)
}
