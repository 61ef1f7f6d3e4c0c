//! Persistent entry store.
//!
//! One JSON record per route, named after the route's [`CacheKey`], inside a
//! directory owned by the store instance. Writes land in a temporary file and
//! are renamed into place, so a reader sees either the previous record or the
//! new one, never a partial file. Mutations of the same key are serialized by
//! a per-key async lock shared with the purge sweep. Temp files orphaned by a
//! crash mid-write are swept once they outlive the store's temp grace period.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entry::{CacheEntry, RenderOutput};
use super::keys::CacheKey;

const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";
const DEFAULT_TEMP_GRACE: Duration = Duration::from_secs(10 * 60);
const METRIC_WRITE_FAILED: &str = "isr_store_write_failed_total";
const METRIC_CORRUPT: &str = "isr_store_corrupt_total";
const METRIC_PURGED: &str = "isr_store_purged_total";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store i/o failed on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode cache entry for `{route}`: {source}")]
    Encode {
        route: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of one [`EntryStore::purge_expired`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub scanned: usize,
    pub removed: usize,
    pub corrupt: usize,
    /// Abandoned temp files removed.
    pub orphans: usize,
    pub failed: usize,
}

enum PurgeOutcome {
    Kept,
    Gone,
    Expired,
    Corrupt,
}

pub struct EntryStore {
    root: PathBuf,
    key_locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    temp_grace: Duration,
}

impl EntryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_locks: DashMap::new(),
            temp_grace: DEFAULT_TEMP_GRACE,
        }
    }

    /// Minimum age before [`purge_expired`](Self::purge_expired) treats a
    /// temp file as abandoned. Must exceed the longest in-flight write.
    pub fn with_temp_grace(mut self, grace: Duration) -> Self {
        self.temp_grace = grace;
        self
    }

    /// Ensure the backing directory exists.
    pub async fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StoreError::io(&self.root, err))?;
        info!(cache_dir = %self.root.display(), "entry store initialized");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the record for `route`, whether or not it exists.
    pub fn path_for(&self, route: &str) -> PathBuf {
        self.record_path(&CacheKey::for_route(route))
    }

    /// Look up the entry for `route`.
    ///
    /// Missing, unreadable and undecodable records all come back as `None`.
    /// Undecodable records are removed on the way out.
    pub async fn get(&self, route: &str) -> Option<CacheEntry> {
        let key = CacheKey::for_route(route);
        let path = self.record_path(&key);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(route, key = %key, error = %err, "failed to read cache record");
                return None;
            }
        };

        match decode(&bytes) {
            Some(entry) if entry.route == route => Some(entry),
            Some(entry) => {
                warn!(
                    route,
                    stored_route = %entry.route,
                    key = %key,
                    "cache record belongs to a different route; ignoring"
                );
                None
            }
            None => {
                self.discard_corrupt(&key, &path).await;
                None
            }
        }
    }

    /// Render-time write: stamp `output` with the current time and persist it.
    pub async fn set(
        &self,
        route: &str,
        output: RenderOutput,
        ttl: Duration,
    ) -> Result<CacheEntry, StoreError> {
        let entry = CacheEntry::new(route, output, ttl, OffsetDateTime::now_utc());
        self.put(&entry).await?;
        Ok(entry)
    }

    /// Persist a fully-formed entry, replacing whatever the route had.
    pub async fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(entry).map_err(|source| StoreError::Encode {
            route: entry.route.clone(),
            source,
        })?;

        let key = CacheKey::for_route(&entry.route);
        let path = self.record_path(&key);
        let tmp = self
            .root
            .join(format!("{key}.{}.{TEMP_EXTENSION}", Uuid::new_v4()));

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        if let Err(err) = fs::write(&tmp, &payload).await {
            let _ = fs::remove_file(&tmp).await;
            counter!(METRIC_WRITE_FAILED).increment(1);
            return Err(StoreError::io(&tmp, err));
        }
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            counter!(METRIC_WRITE_FAILED).increment(1);
            return Err(StoreError::io(&path, err));
        }

        debug!(
            route = %entry.route,
            key = %key,
            bytes = payload.len(),
            expires_at = %entry.expires_at,
            "cache record written"
        );
        Ok(())
    }

    /// Remove the entry for `route`, reporting whether one existed.
    pub async fn delete(&self, route: &str) -> Result<bool, StoreError> {
        let key = CacheKey::for_route(route);
        let path = self.record_path(&key);

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(route, key = %key, "cache record deleted");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    /// An absent entry is stale; a present one is stale once its expiry passes.
    pub fn is_stale(entry: Option<&CacheEntry>) -> bool {
        let now = OffsetDateTime::now_utc();
        entry.is_none_or(|entry| entry.is_stale_at(now))
    }

    /// Remove every expired or undecodable record, plus temp files older
    /// than the temp grace period.
    ///
    /// Individual record failures are counted and skipped; only failing to
    /// list the directory aborts the sweep.
    pub async fn purge_expired(&self) -> Result<PurgeReport, StoreError> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|err| StoreError::io(&self.root, err))?;
        let mut report = PurgeReport::default();

        loop {
            let item = match dir.next_entry().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(err) => {
                    warn!(cache_dir = %self.root.display(), error = %err, "purge scan interrupted");
                    report.failed += 1;
                    break;
                }
            };

            let path = item.path();
            if is_temp_file(&path) {
                match self.purge_orphan(&path).await {
                    Ok(true) => report.orphans += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to remove orphaned temp file");
                        report.failed += 1;
                    }
                }
                continue;
            }
            let Some(key) = record_key(&path) else {
                continue;
            };
            report.scanned += 1;

            match self.purge_one(&key, &path).await {
                Ok(PurgeOutcome::Kept | PurgeOutcome::Gone) => {}
                Ok(PurgeOutcome::Expired) => report.removed += 1,
                Ok(PurgeOutcome::Corrupt) => report.corrupt += 1,
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to purge cache record");
                    report.failed += 1;
                }
            }
        }

        self.key_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        counter!(METRIC_PURGED)
            .increment((report.removed + report.corrupt + report.orphans) as u64);
        Ok(report)
    }

    /// Number of record files currently on disk.
    pub async fn count_records(&self) -> Result<usize, StoreError> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|err| StoreError::io(&self.root, err))?;
        let mut count = 0;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|err| StoreError::io(&self.root, err))?
        {
            if record_key(&item.path()).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_one(&self, key: &CacheKey, path: &Path) -> std::io::Result<PurgeOutcome> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(PurgeOutcome::Gone),
            Err(err) => return Err(err),
        };

        let outcome = match decode(&bytes) {
            Some(entry) if !entry.is_stale_at(OffsetDateTime::now_utc()) => {
                return Ok(PurgeOutcome::Kept);
            }
            Some(_) => PurgeOutcome::Expired,
            None => {
                counter!(METRIC_CORRUPT).increment(1);
                PurgeOutcome::Corrupt
            }
        };

        match fs::remove_file(path).await {
            Ok(()) => Ok(outcome),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(PurgeOutcome::Gone),
            Err(err) => Err(err),
        }
    }

    /// Delete `path` if it was last modified before the temp grace period.
    async fn purge_orphan(&self, path: &Path) -> std::io::Result<bool> {
        let modified = match fs::metadata(path).await {
            Ok(meta) => meta.modified()?,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age < self.temp_grace {
            return Ok(false);
        }

        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), age_secs = age.as_secs(), "removed orphaned temp file");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove a record that failed to decode, unless a writer replaced it
    /// with a valid one in the meantime.
    async fn discard_corrupt(&self, key: &CacheKey, path: &Path) {
        counter!(METRIC_CORRUPT).increment(1);

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let still_corrupt = match fs::read(path).await {
            Ok(bytes) => decode(&bytes).is_none(),
            Err(_) => false,
        };
        if !still_corrupt {
            return;
        }

        match fs::remove_file(path).await {
            Ok(()) => warn!(key = %key, "removed corrupt cache record"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(key = %key, error = %err, "failed to remove corrupt cache record"),
        }
    }

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{key}.{RECORD_EXTENSION}"))
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.key_locks.entry(key.clone()).or_default().clone()
    }
}

fn decode(bytes: &[u8]) -> Option<CacheEntry> {
    serde_json::from_slice::<CacheEntry>(bytes)
        .ok()
        .filter(CacheEntry::is_well_formed)
}

fn is_temp_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(TEMP_EXTENSION)
}

fn record_key(path: &Path) -> Option<CacheKey> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(CacheKey::from_file_stem)
}
