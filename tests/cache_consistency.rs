use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use isr_cache::cache::{
    CacheEntry, Coordinator, EntryStore, Freshness, QueueConfig, RegenerationError,
    RegenerationQueue, RegenerationTask, RenderError, RenderOutput, Renderer, StoreRegenerator,
    UniformTtl,
};
use serde_json::json;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};

/// Renders `<p>{route} v{n}</p>`, counting calls per route and tracking how
/// many renders overlap.
#[derive(Default)]
struct VersionedRenderer {
    calls: Mutex<HashMap<String, usize>>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl VersionedRenderer {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn calls_for(&self, route: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(route)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Renderer for VersionedRenderer {
    async fn render(&self, route: &str) -> Result<RenderOutput, RenderError> {
        let version = {
            let mut calls = self.calls.lock().expect("calls lock");
            let entry = calls.entry(route.to_string()).or_default();
            *entry += 1;
            *entry
        };

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        Ok(RenderOutput::new(
            format!("<p>{route} v{version}</p>"),
            json!({ "version": version }),
        ))
    }
}

/// Stands in for the regeneration work so tests can see and hold enqueued
/// jobs.
struct GatedRecorder {
    gate: Arc<Semaphore>,
    started: Mutex<Vec<String>>,
}

#[async_trait]
impl RegenerationTask for GatedRecorder {
    async fn regenerate(&self, route: &str) -> Result<(), RegenerationError> {
        self.started
            .lock()
            .expect("started lock")
            .push(route.to_string());
        self.gate.acquire().await.expect("gate open").forget();
        Ok(())
    }
}

async fn temp_store() -> (TempDir, Arc<EntryStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(EntryStore::new(dir.path().join("isr")));
    store.init().await.expect("init store");
    (dir, store)
}

/// Rewrite the route's record so it expired long ago.
async fn age_entry(store: &EntryStore, route: &str) {
    let current = store.get(route).await.expect("entry to age");
    let aged = CacheEntry::new(
        route,
        RenderOutput::new(current.rendering, current.metadata),
        Duration::from_secs(1),
        OffsetDateTime::now_utc() - time::Duration::hours(1),
    );
    store.put(&aged).await.expect("write aged entry");
}

#[tokio::test]
async fn miss_hit_stale_lifecycle() {
    let (_dir, store) = temp_store().await;
    let renderer = Arc::new(VersionedRenderer::default());
    let gate = Arc::new(Semaphore::new(0));
    let recorder = Arc::new(GatedRecorder {
        gate: Arc::clone(&gate),
        started: Mutex::new(Vec::new()),
    });
    let queue = RegenerationQueue::new(QueueConfig::with_max_workers(1), recorder.clone());
    let coordinator = Coordinator::with_queue(
        Arc::clone(&store),
        renderer.clone(),
        Arc::new(UniformTtl(Duration::from_secs(60))),
        queue.clone(),
    );

    let miss = coordinator.handle("/x").await.expect("miss");
    assert_eq!(miss.freshness, Freshness::Miss);
    assert_eq!(renderer.calls_for("/x"), 1);
    let stored = store.get("/x").await.expect("persisted on miss");
    assert_eq!(stored.rendering, miss.rendering);
    assert_eq!(
        stored.expires_at - stored.created_at,
        time::Duration::seconds(60)
    );

    let hit = coordinator.handle("/x").await.expect("hit");
    assert_eq!(hit.freshness, Freshness::Hit);
    assert_eq!(hit.rendering, miss.rendering);
    assert_eq!(renderer.calls_for("/x"), 1);

    age_entry(&store, "/x").await;

    let stale = coordinator.handle("/x").await.expect("stale");
    assert_eq!(stale.freshness, Freshness::Stale);
    assert_eq!(stale.rendering, miss.rendering);
    assert!(stale.age_seconds() >= 3600);

    // More stale reads while the job is tracked do not schedule again.
    for _ in 0..3 {
        let again = coordinator.handle("/x").await.expect("stale again");
        assert_eq!(again.freshness, Freshness::Stale);
    }
    assert!(queue.is_tracked("/x"));

    gate.add_permits(1);
    timeout(Duration::from_secs(5), queue.wait_idle())
        .await
        .expect("queue drained");

    assert_eq!(
        recorder.started.lock().expect("started lock").as_slice(),
        ["/x".to_string()]
    );
    assert_eq!(renderer.calls_for("/x"), 1);
}

#[tokio::test]
async fn regeneration_replaces_stale_entry() {
    let (_dir, store) = temp_store().await;
    let renderer = Arc::new(VersionedRenderer::default());
    let coordinator = Coordinator::new(
        Arc::clone(&store),
        renderer.clone(),
        Arc::new(UniformTtl(Duration::from_secs(60))),
        QueueConfig::default(),
    );

    coordinator.handle("/news").await.expect("miss");
    age_entry(&store, "/news").await;

    let stale = coordinator.handle("/news").await.expect("stale");
    assert_eq!(stale.rendering, "<p>/news v1</p>");

    timeout(Duration::from_secs(5), coordinator.queue().wait_idle())
        .await
        .expect("queue drained");

    let fresh = coordinator.handle("/news").await.expect("hit after regeneration");
    assert_eq!(fresh.freshness, Freshness::Hit);
    assert_eq!(fresh.rendering, "<p>/news v2</p>");
    assert_eq!(fresh.metadata, json!({ "version": 2 }));
}

#[tokio::test]
async fn corrupt_record_behaves_as_miss() {
    let (_dir, store) = temp_store().await;
    let renderer = Arc::new(VersionedRenderer::default());
    let coordinator = Coordinator::new(
        Arc::clone(&store),
        renderer.clone(),
        Arc::new(UniformTtl(Duration::from_secs(60))),
        QueueConfig::default(),
    );

    tokio::fs::write(store.path_for("/c"), b"\x00not json at all{")
        .await
        .expect("write garbage");

    let page = coordinator.handle("/c").await.expect("served");
    assert_eq!(page.freshness, Freshness::Miss);
    assert_eq!(renderer.calls_for("/c"), 1);

    let entry = store.get("/c").await.expect("fresh entry written");
    assert_eq!(entry.rendering, "<p>/c v1</p>");
    assert!(!EntryStore::is_stale(Some(&entry)));
}

#[tokio::test]
async fn write_failure_does_not_block_response() {
    let dir = tempfile::tempdir().expect("tempdir");
    // A regular file where the cache directory should be.
    let blocked = dir.path().join("blocked");
    tokio::fs::write(&blocked, b"not a directory")
        .await
        .expect("create blocker");
    let store = Arc::new(EntryStore::new(&blocked));
    let renderer = Arc::new(VersionedRenderer::default());
    let coordinator = Coordinator::new(
        Arc::clone(&store),
        renderer.clone(),
        Arc::new(UniformTtl(Duration::from_secs(60))),
        QueueConfig::default(),
    );

    let first = coordinator.handle("/w").await.expect("served despite write failure");
    assert_eq!(first.freshness, Freshness::Miss);
    assert_eq!(first.rendering, "<p>/w v1</p>");

    // Nothing was cached, so the next request renders again.
    let second = coordinator.handle("/w").await.expect("served again");
    assert_eq!(second.freshness, Freshness::Miss);
    assert_eq!(renderer.calls_for("/w"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_stale_routes_regenerate_two_at_a_time() {
    let (_dir, store) = temp_store().await;
    let renderer = Arc::new(VersionedRenderer::with_delay(Duration::from_millis(40)));
    let coordinator = Coordinator::new(
        Arc::clone(&store),
        renderer.clone(),
        Arc::new(UniformTtl(Duration::from_secs(60))),
        QueueConfig::with_max_workers(2),
    );

    let routes = ["/a", "/b", "/c", "/d", "/e"];
    for route in routes {
        coordinator.handle(route).await.expect("prime");
        age_entry(&store, route).await;
    }
    renderer.peak.store(0, Ordering::SeqCst);

    for route in routes {
        let page = coordinator.handle(route).await.expect("stale");
        assert_eq!(page.freshness, Freshness::Stale);
        assert!(coordinator.queue().executing() <= 2);
    }

    timeout(Duration::from_secs(10), coordinator.queue().wait_idle())
        .await
        .expect("all regenerations finished");

    assert!(renderer.peak.load(Ordering::SeqCst) <= 2);
    for route in routes {
        assert_eq!(renderer.calls_for(route), 2, "{route}");
        let entry = store.get(route).await.expect("regenerated");
        assert!(!EntryStore::is_stale(Some(&entry)));
    }
}

#[tokio::test]
async fn manual_revalidation_runs_ahead_of_background_work() {
    let (_dir, store) = temp_store().await;
    let renderer = Arc::new(VersionedRenderer::default());
    let gate = Arc::new(Semaphore::new(0));
    let recorder = Arc::new(GatedRecorder {
        gate: Arc::clone(&gate),
        started: Mutex::new(Vec::new()),
    });
    let queue = RegenerationQueue::new(QueueConfig::with_max_workers(1), recorder.clone());
    let coordinator = Coordinator::with_queue(
        Arc::clone(&store),
        renderer,
        Arc::new(UniformTtl(Duration::from_secs(60))),
        queue.clone(),
    );

    for route in ["/busy", "/a", "/c"] {
        coordinator.handle(route).await.expect("prime");
        age_entry(&store, route).await;
    }
    coordinator.handle("/busy").await.expect("stale busy");
    coordinator.handle("/a").await.expect("stale a");

    let ack = coordinator.revalidate("/b").await;
    assert!(ack.scheduled);
    assert!(!ack.removed);
    coordinator.handle("/c").await.expect("stale c");

    gate.add_permits(4);
    timeout(Duration::from_secs(5), queue.wait_idle())
        .await
        .expect("queue drained");

    assert_eq!(
        recorder.started.lock().expect("started lock").as_slice(),
        ["/busy", "/b", "/a", "/c"].map(String::from)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn purge_never_removes_concurrently_refreshed_entries() {
    let (_dir, store) = temp_store().await;
    let regenerator = Arc::new(StoreRegenerator::new(
        Arc::clone(&store),
        Arc::new(VersionedRenderer::default()),
        Arc::new(UniformTtl(Duration::from_secs(600))),
    ));

    let routes: Vec<String> = (0..20).map(|i| format!("/p/{i}")).collect();
    for route in &routes {
        store
            .put(&CacheEntry::new(
                route.as_str(),
                RenderOutput::html("old"),
                Duration::from_secs(1),
                OffsetDateTime::now_utc() - time::Duration::hours(1),
            ))
            .await
            .expect("seed expired");
    }

    let refresh = {
        let regenerator = Arc::clone(&regenerator);
        let routes = routes.clone();
        tokio::spawn(async move {
            for route in &routes {
                regenerator.regenerate(route).await.expect("regenerate");
            }
        })
    };
    let purge = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.purge_expired().await.expect("purge") })
    };

    refresh.await.expect("refresh task");
    purge.await.expect("purge task");

    // Every route was refreshed after seeding; whatever the interleaving,
    // the refreshed record survives and is readable.
    for route in &routes {
        let entry = store.get(route).await.expect("refreshed entry survives");
        assert!(entry.rendering.starts_with("<p>/p/"));
    }
}
