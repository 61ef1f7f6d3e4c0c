//! Background regeneration queue.
//!
//! Stale routes are re-rendered here, off the request path, by at most
//! `max_workers` concurrent workers. A route is tracked from the moment it is
//! enqueued until its worker finishes, and a second enqueue while tracked is
//! absorbed. High-priority jobs (manual revalidation) run ahead of every
//! pending normal job; within a priority band jobs run in arrival order.
//!
//! Each job runs in its own spawned task, awaited by a supervisor task. A
//! panic in the render therefore surfaces as a failed job instead of tearing
//! down the queue's bookkeeping.

use std::{
    any::Any,
    collections::{HashSet, VecDeque},
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Notify, broadcast};
use tracing::{Instrument, debug, info, info_span, warn};

use super::lock::mutex_lock;
use super::render::RenderError;

const SOURCE: &str = "cache::queue";
const DEFAULT_MAX_WORKERS: usize = 2;
const DEFAULT_EVENT_CAPACITY: usize = 256;
const METRIC_ENQUEUED: &str = "isr_queue_enqueued_total";
const METRIC_DEDUPLICATED: &str = "isr_queue_deduplicated_total";
const METRIC_PENDING: &str = "isr_queue_pending";
const METRIC_REGENERATION: &str = "isr_regeneration_total";
const METRIC_REGENERATION_MS: &str = "isr_regeneration_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RevalidationJob {
    pub route: String,
    pub priority: Priority,
    pub enqueued_at: OffsetDateTime,
}

/// Notifications published when a worker finishes.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Revalidated {
        route: String,
        timestamp: OffsetDateTime,
    },
    Failed {
        route: String,
        error: String,
        timestamp: OffsetDateTime,
    },
}

impl QueueEvent {
    pub fn route(&self) -> &str {
        match self {
            QueueEvent::Revalidated { route, .. } | QueueEvent::Failed { route, .. } => route,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RegenerationError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("failed to store regenerated `{route}`: {message}")]
    Store { route: String, message: String },
    #[error("regeneration of `{route}` panicked: {message}")]
    Panicked { route: String, message: String },
    #[error("regeneration of `{route}` was cancelled")]
    Cancelled { route: String },
}

/// The work a worker performs for one route.
#[async_trait]
pub trait RegenerationTask: Send + Sync + 'static {
    async fn regenerate(&self, route: &str) -> Result<(), RegenerationError>;
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub event_capacity: usize,
}

impl QueueConfig {
    pub fn with_max_workers(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Self::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Point-in-time view of the queue, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub executing: usize,
    pub max_workers: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<RevalidationJob>,
    /// Routes that are pending or executing.
    processing: HashSet<String>,
    executing: usize,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.executing == 0
    }
}

struct QueueInner {
    max_workers: usize,
    task: Arc<dyn RegenerationTask>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    idle: Notify,
}

/// Cloneable handle; all clones share one queue.
///
/// `enqueue` spawns workers and must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct RegenerationQueue {
    inner: Arc<QueueInner>,
}

impl RegenerationQueue {
    pub fn new(config: QueueConfig, task: Arc<dyn RegenerationTask>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(QueueInner {
                max_workers: config.max_workers.max(1),
                task,
                state: Mutex::new(QueueState::default()),
                events,
                idle: Notify::new(),
            }),
        }
    }

    /// Schedule `route` for regeneration.
    ///
    /// Returns `false` when the route is already pending or executing; the
    /// existing job keeps its place.
    pub fn enqueue(&self, route: &str, priority: Priority) -> bool {
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "enqueue");
            if !state.processing.insert(route.to_string()) {
                counter!(METRIC_DEDUPLICATED).increment(1);
                debug!(route, priority = %priority, "regeneration already tracked; skipping");
                return false;
            }

            let job = RevalidationJob {
                route: route.to_string(),
                priority,
                enqueued_at: OffsetDateTime::now_utc(),
            };
            match priority {
                Priority::Normal => state.pending.push_back(job),
                Priority::High => {
                    let at = state
                        .pending
                        .iter()
                        .position(|queued| queued.priority == Priority::Normal)
                        .unwrap_or(state.pending.len());
                    state.pending.insert(at, job);
                }
            }
            gauge!(METRIC_PENDING).set(state.pending.len() as f64);
        }

        counter!(METRIC_ENQUEUED, "priority" => priority.as_str()).increment(1);
        debug!(route, priority = %priority, "regeneration enqueued");
        self.dispatch();
        true
    }

    /// Pending (not yet executing) jobs.
    pub fn size(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "size").pending.len()
    }

    pub fn executing(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "executing").executing
    }

    /// Whether `route` is pending or executing.
    pub fn is_tracked(&self, route: &str) -> bool {
        mutex_lock(&self.inner.state, SOURCE, "is_tracked")
            .processing
            .contains(route)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = mutex_lock(&self.inner.state, SOURCE, "snapshot");
        QueueSnapshot {
            pending: state.pending.len(),
            executing: state.executing,
            max_workers: self.inner.max_workers,
        }
    }

    /// Drop every pending job and return how many were dropped.
    ///
    /// Executing jobs keep running and stay tracked until they finish.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "clear");
            let dropped: Vec<RevalidationJob> = state.pending.drain(..).collect();
            for job in &dropped {
                state.processing.remove(&job.route);
            }
            gauge!(METRIC_PENDING).set(0.0);
            dropped.len()
        };

        if dropped > 0 {
            info!(dropped, "pending regenerations cleared");
        }
        self.notify_if_idle();
        dropped
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Resolve once nothing is pending or executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if mutex_lock(&self.inner.state, SOURCE, "wait_idle").is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Start workers for pending jobs while slots are free.
    fn dispatch(&self) {
        let started: Vec<RevalidationJob> = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "dispatch");
            let mut started = Vec::new();
            while state.executing < self.inner.max_workers {
                let Some(job) = state.pending.pop_front() else {
                    break;
                };
                state.executing += 1;
                started.push(job);
            }
            gauge!(METRIC_PENDING).set(state.pending.len() as f64);
            started
        };

        for job in started {
            self.start_worker(job);
        }
    }

    fn start_worker(&self, job: RevalidationJob) {
        let queue = self.clone();
        let task = Arc::clone(&self.inner.task);
        let span = info_span!("regenerate", route = %job.route, priority = %job.priority);

        tokio::spawn(async move {
            let started_at = Instant::now();
            let route = job.route.clone();
            let worker =
                tokio::spawn(async move { task.regenerate(&route).await }.instrument(span));

            let outcome = match worker.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => Err(RegenerationError::Panicked {
                    route: job.route.clone(),
                    message: panic_message(err.into_panic()),
                }),
                Err(_) => Err(RegenerationError::Cancelled {
                    route: job.route.clone(),
                }),
            };

            queue.complete(job, outcome, started_at.elapsed());
        });
    }

    fn complete(
        &self,
        job: RevalidationJob,
        outcome: Result<(), RegenerationError>,
        elapsed: Duration,
    ) {
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "complete");
            state.executing = state.executing.saturating_sub(1);
            state.processing.remove(&job.route);
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let timestamp = OffsetDateTime::now_utc();
        let event = match outcome {
            Ok(()) => {
                info!(route = %job.route, elapsed_ms, "route regenerated");
                counter!(METRIC_REGENERATION, "outcome" => "success").increment(1);
                histogram!(METRIC_REGENERATION_MS, "outcome" => "success").record(elapsed_ms);
                QueueEvent::Revalidated {
                    route: job.route,
                    timestamp,
                }
            }
            Err(err) => {
                warn!(route = %job.route, elapsed_ms, error = %err, "route regeneration failed");
                counter!(METRIC_REGENERATION, "outcome" => "failure").increment(1);
                histogram!(METRIC_REGENERATION_MS, "outcome" => "failure").record(elapsed_ms);
                QueueEvent::Failed {
                    route: job.route,
                    error: err.to_string(),
                    timestamp,
                }
            }
        };
        // No subscribers is fine.
        let _ = self.inner.events.send(event);

        self.dispatch();
        self.notify_if_idle();
    }

    fn notify_if_idle(&self) {
        if mutex_lock(&self.inner.state, SOURCE, "notify_if_idle").is_idle() {
            self.inner.idle.notify_waiters();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
