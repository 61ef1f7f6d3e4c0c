//! Route → TTL policy.

use std::time::Duration;

use serde::Deserialize;

/// Decides how long a freshly rendered route stays fresh.
pub trait TtlPolicy: Send + Sync + 'static {
    fn ttl_for(&self, route: &str) -> Duration;

    /// Label attached to render and regeneration logs for `route`.
    fn category_for(&self, _route: &str) -> Option<&str> {
        None
    }
}

/// One row of the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteRule {
    /// Route prefix, or an exact route when `exact` is set.
    pub prefix: String,
    pub ttl_seconds: u64,
    /// Free-form label (e.g. `articles`, `events`) surfaced in logs.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub exact: bool,
}

/// Table-driven policy: an exact rule beats any prefix rule, the longest
/// matching prefix beats shorter ones, and unmatched routes get the default.
#[derive(Debug, Clone)]
pub struct RouteTtlTable {
    rules: Vec<RouteRule>,
    default_ttl: Duration,
}

impl RouteTtlTable {
    pub fn new(rules: Vec<RouteRule>, default_ttl: Duration) -> Self {
        Self { rules, default_ttl }
    }

    /// The rule that governs `route`, if any.
    fn rule_for(&self, route: &str) -> Option<&RouteRule> {
        let path = route.split_once('?').map_or(route, |(path, _)| path);

        if let Some(rule) = self
            .rules
            .iter()
            .find(|rule| rule.exact && rule.prefix == path)
        {
            return Some(rule);
        }

        self.rules
            .iter()
            .filter(|rule| !rule.exact && prefix_matches(&rule.prefix, path))
            .max_by_key(|rule| rule.prefix.len())
    }
}

impl TtlPolicy for RouteTtlTable {
    fn ttl_for(&self, route: &str) -> Duration {
        self.rule_for(route)
            .map(|rule| Duration::from_secs(rule.ttl_seconds))
            .unwrap_or(self.default_ttl)
    }

    fn category_for(&self, route: &str) -> Option<&str> {
        self.rule_for(route)
            .and_then(|rule| rule.category.as_deref())
    }
}

/// `/events` matches `/events` and `/events/x` but not `/eventsx`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// Fixed TTL for every route.
#[derive(Debug, Clone, Copy)]
pub struct UniformTtl(pub Duration);

impl TtlPolicy for UniformTtl {
    fn ttl_for(&self, _route: &str) -> Duration {
        self.0
    }
}
