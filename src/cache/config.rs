//! Runtime cache configuration.
//!
//! Built from the layered [`crate::config::CacheSettings`] in the binary, or
//! constructed directly when the cache is embedded as a library.

use std::{path::PathBuf, time::Duration};

use super::policy::{RouteRule, RouteTtlTable};
use super::queue::QueueConfig;

const DEFAULT_DIRECTORY: &str = ".isr-cache";
const DEFAULT_MAX_WORKERS: usize = 2;
const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory owned by the entry store.
    pub directory: PathBuf,
    /// Upper bound on concurrent regenerations.
    pub max_workers: usize,
    /// Cadence of the expired-record sweep.
    pub purge_interval: Duration,
    /// TTL for routes no rule matches.
    pub default_ttl: Duration,
    pub routes: Vec<RouteRule>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            max_workers: DEFAULT_MAX_WORKERS,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            default_ttl: DEFAULT_TTL,
            routes: Vec::new(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            directory: settings.directory.clone(),
            max_workers: settings.max_workers.get(),
            purge_interval: settings.purge_interval,
            default_ttl: settings.default_ttl,
            routes: settings.routes.clone(),
        }
    }
}

impl CacheConfig {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::with_max_workers(self.max_workers)
    }

    pub fn ttl_table(&self) -> RouteTtlTable {
        RouteTtlTable::new(self.routes.clone(), self.default_ttl)
    }
}
