use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with the installed recorder (idempotent).
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "isr_requests_total",
            Unit::Count,
            "Pages served, labelled by cache outcome (hit, stale, miss)."
        );
        describe_counter!(
            "isr_render_failed_total",
            Unit::Count,
            "Inline renders on a cache miss that failed."
        );
        describe_counter!(
            "isr_store_write_failed_total",
            Unit::Count,
            "Cache record writes that failed."
        );
        describe_counter!(
            "isr_store_corrupt_total",
            Unit::Count,
            "Unreadable cache records discarded."
        );
        describe_counter!(
            "isr_store_purged_total",
            Unit::Count,
            "Expired cache records removed by the purge sweep."
        );
        describe_counter!(
            "isr_queue_enqueued_total",
            Unit::Count,
            "Regeneration jobs accepted, labelled by priority."
        );
        describe_counter!(
            "isr_queue_deduplicated_total",
            Unit::Count,
            "Regeneration requests absorbed because the route was already tracked."
        );
        describe_counter!(
            "isr_regeneration_total",
            Unit::Count,
            "Finished regenerations, labelled by outcome."
        );
        describe_gauge!(
            "isr_queue_pending",
            Unit::Count,
            "Regeneration jobs waiting for a worker."
        );
        describe_histogram!(
            "isr_regeneration_ms",
            Unit::Milliseconds,
            "Regeneration latency in milliseconds."
        );
    });
}
