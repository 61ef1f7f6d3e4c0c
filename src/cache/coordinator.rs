//! Request coordinator: the HIT / STALE / MISS decision for one route.
//!
//! * HIT: a fresh entry is served as is.
//! * STALE: the expired entry is served immediately and a normal-priority
//!   regeneration is scheduled.
//! * MISS: the page is rendered inline, written with the route's TTL, and
//!   served. A failed write is logged and the rendered page is still served.
//!
//! Caching never turns a renderable page into an error; only the renderer
//! itself can fail a request.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::entry::CacheEntry;
use super::policy::TtlPolicy;
use super::queue::{
    Priority, QueueConfig, RegenerationError, RegenerationQueue, RegenerationTask,
};
use super::render::{RenderError, Renderer};
use super::store::EntryStore;

const METRIC_REQUESTS: &str = "isr_requests_total";
const METRIC_RENDER_FAILED: &str = "isr_render_failed_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Freshness {
    Hit,
    Stale,
    Miss,
}

impl Freshness {
    pub fn as_str(self) -> &'static str {
        match self {
            Freshness::Hit => "HIT",
            Freshness::Stale => "STALE",
            Freshness::Miss => "MISS",
        }
    }

    fn metric_label(self) -> &'static str {
        match self {
            Freshness::Hit => "hit",
            Freshness::Stale => "stale",
            Freshness::Miss => "miss",
        }
    }
}

/// What the front door sends back for a route.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedPage {
    pub rendering: String,
    pub metadata: Value,
    pub freshness: Freshness,
    /// Time since the served rendering was produced; zero on a miss.
    pub age: Duration,
}

impl ServedPage {
    fn from_entry(entry: CacheEntry, freshness: Freshness, now: OffsetDateTime) -> Self {
        let age = entry.age_at(now);
        Self {
            rendering: entry.rendering,
            metadata: entry.metadata,
            freshness,
            age,
        }
    }

    pub fn age_seconds(&self) -> u64 {
        self.age.as_secs()
    }
}

/// Acknowledgement of a manual revalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevalidationAck {
    pub route: String,
    /// Whether a cached entry was deleted.
    pub removed: bool,
    /// `false` when a regeneration for the route was already tracked.
    pub scheduled: bool,
}

/// Regeneration as the queue runs it: render, then persist with the
/// route's TTL.
pub struct StoreRegenerator {
    store: Arc<EntryStore>,
    renderer: Arc<dyn Renderer>,
    policy: Arc<dyn TtlPolicy>,
}

impl StoreRegenerator {
    pub fn new(
        store: Arc<EntryStore>,
        renderer: Arc<dyn Renderer>,
        policy: Arc<dyn TtlPolicy>,
    ) -> Self {
        Self {
            store,
            renderer,
            policy,
        }
    }
}

#[async_trait]
impl RegenerationTask for StoreRegenerator {
    async fn regenerate(&self, route: &str) -> Result<(), RegenerationError> {
        let output = self.renderer.render(route).await?;
        let ttl = self.policy.ttl_for(route);
        let entry = self
            .store
            .set(route, output, ttl)
            .await
            .map_err(|err| RegenerationError::Store {
                route: route.to_string(),
                message: err.to_string(),
            })?;
        debug!(
            route,
            category = self.policy.category_for(route),
            ttl_ms = entry.ttl_ms,
            "regenerated entry stored"
        );
        Ok(())
    }
}

pub struct Coordinator {
    store: Arc<EntryStore>,
    renderer: Arc<dyn Renderer>,
    policy: Arc<dyn TtlPolicy>,
    queue: RegenerationQueue,
}

impl Coordinator {
    /// Wire a coordinator whose queue regenerates into `store`.
    pub fn new(
        store: Arc<EntryStore>,
        renderer: Arc<dyn Renderer>,
        policy: Arc<dyn TtlPolicy>,
        queue_config: QueueConfig,
    ) -> Self {
        let regenerator = StoreRegenerator::new(
            Arc::clone(&store),
            Arc::clone(&renderer),
            Arc::clone(&policy),
        );
        let queue = RegenerationQueue::new(queue_config, Arc::new(regenerator));
        Self::with_queue(store, renderer, policy, queue)
    }

    /// Use an existing queue, e.g. one shared with other coordinators.
    pub fn with_queue(
        store: Arc<EntryStore>,
        renderer: Arc<dyn Renderer>,
        policy: Arc<dyn TtlPolicy>,
        queue: RegenerationQueue,
    ) -> Self {
        Self {
            store,
            renderer,
            policy,
            queue,
        }
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn queue(&self) -> &RegenerationQueue {
        &self.queue
    }

    /// Serve `route` from the cache, rendering inline on a miss.
    pub async fn handle(&self, route: &str) -> Result<ServedPage, RenderError> {
        let page = match self.store.get(route).await {
            Some(entry) if !EntryStore::is_stale(Some(&entry)) => {
                ServedPage::from_entry(entry, Freshness::Hit, OffsetDateTime::now_utc())
            }
            Some(entry) => {
                let scheduled = self.queue.enqueue(route, Priority::Normal);
                debug!(route, scheduled, "serving stale entry");
                ServedPage::from_entry(entry, Freshness::Stale, OffsetDateTime::now_utc())
            }
            None => self.render_miss(route).await?,
        };

        counter!(METRIC_REQUESTS, "outcome" => page.freshness.metric_label()).increment(1);
        Ok(page)
    }

    async fn render_miss(&self, route: &str) -> Result<ServedPage, RenderError> {
        let category = self.policy.category_for(route);
        let output = self.renderer.render(route).await.inspect_err(|err| {
            counter!(METRIC_RENDER_FAILED).increment(1);
            warn!(route, category, error = %err, "render failed on cache miss");
        })?;

        let ttl = self.policy.ttl_for(route);
        match self.store.set(route, output.clone(), ttl).await {
            Ok(entry) => debug!(route, category, ttl_ms = entry.ttl_ms, "rendered and cached on miss"),
            Err(err) => error!(
                route,
                category,
                error = %err,
                "failed to cache rendered page; serving it uncached"
            ),
        }

        Ok(ServedPage {
            rendering: output.rendering,
            metadata: output.metadata,
            freshness: Freshness::Miss,
            age: Duration::ZERO,
        })
    }

    /// Drop the cached entry and schedule a high-priority regeneration.
    ///
    /// Returns as soon as the job is queued.
    pub async fn revalidate(&self, route: &str) -> RevalidationAck {
        let removed = match self.store.delete(route).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(route, error = %err, "failed to delete entry during revalidation");
                false
            }
        };
        let scheduled = self.queue.enqueue(route, Priority::High);

        info!(route, removed, scheduled, "revalidation requested");
        RevalidationAck {
            route: route.to_string(),
            removed,
            scheduled,
        }
    }
}
