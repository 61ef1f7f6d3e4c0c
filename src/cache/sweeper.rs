//! Periodic removal of expired records, independent of request traffic.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::EntryStore;

/// Run [`EntryStore::purge_expired`] every `interval` until the handle is
/// aborted. The first sweep happens one full interval after spawning.
pub fn spawn_purge_loop(store: Arc<EntryStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip the first immediate tick
        loop {
            ticker.tick().await;
            sweep_once(&store).await;
        }
    })
}

async fn sweep_once(store: &EntryStore) {
    match store.purge_expired().await {
        Ok(report) if report.removed > 0 || report.orphans > 0 || report.failed > 0 => info!(
            scanned = report.scanned,
            removed = report.removed,
            corrupt = report.corrupt,
            orphans = report.orphans,
            failed = report.failed,
            "cache purge completed"
        ),
        Ok(report) => debug!(scanned = report.scanned, "cache purge found nothing to remove"),
        Err(err) => warn!(error = %err, "cache purge failed"),
    }
}
