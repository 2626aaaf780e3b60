use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "refolo_queue_enqueued_total",
            Unit::Count,
            "Total number of messages enqueued across all consumer groups."
        );
        describe_counter!(
            "refolo_queue_received_total",
            Unit::Count,
            "Total number of message deliveries leased by workers."
        );
        describe_counter!(
            "refolo_queue_acknowledged_total",
            Unit::Count,
            "Total number of deliveries acknowledged after processing."
        );
        describe_counter!(
            "refolo_queue_dead_lettered_total",
            Unit::Count,
            "Total number of messages moved aside after exhausting redelivery."
        );
        describe_counter!(
            "refolo_batch_failed_items_total",
            Unit::Count,
            "Total number of per-item failures reported back to the queue."
        );
        describe_counter!(
            "refolo_regen_success_total",
            Unit::Count,
            "Total number of successfully regenerated artifacts."
        );
        describe_counter!(
            "refolo_regen_failure_total",
            Unit::Count,
            "Total number of failed regeneration attempts."
        );
        describe_counter!(
            "refolo_purge_submitted_total",
            Unit::Count,
            "Total number of CDN invalidation batches submitted."
        );
        describe_counter!(
            "refolo_purge_paths_total",
            Unit::Count,
            "Total number of CDN path variants submitted for purge."
        );
        describe_counter!(
            "refolo_purge_noop_total",
            Unit::Count,
            "Total number of purge batches that resolved to a no-op."
        );
        describe_histogram!(
            "refolo_regen_batch_ms",
            Unit::Milliseconds,
            "Regeneration batch latency in milliseconds."
        );
        describe_histogram!(
            "refolo_purge_batch_ms",
            Unit::Milliseconds,
            "CDN purge batch latency in milliseconds."
        );
    });
}
