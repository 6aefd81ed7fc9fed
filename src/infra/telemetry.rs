use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::{
    METRIC_CACHE_READ_TOTAL, METRIC_MUTATION_ABANDONED_TOTAL, METRIC_MUTATION_COMMITTED_TOTAL,
    METRIC_MUTATION_ROLLBACK_SKIPPED_TOTAL, METRIC_MUTATION_ROLLED_BACK_TOTAL,
    METRIC_MUTATION_TRANSFORM_FAILED_TOTAL, METRIC_REFETCH_BATCH_MS, METRIC_REFETCH_DROPPED_TOTAL,
    METRIC_REFETCH_QUEUE_LEN, METRIC_REMOTE_WRITE_MS,
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

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_MUTATION_COMMITTED_TOTAL,
            Unit::Count,
            "Mutations whose remote write succeeded."
        );
        describe_counter!(
            METRIC_MUTATION_ROLLED_BACK_TOTAL,
            Unit::Count,
            "Failed mutations whose snapshot was restored."
        );
        describe_counter!(
            METRIC_MUTATION_ROLLBACK_SKIPPED_TOTAL,
            Unit::Count,
            "Failed mutations whose rollback was skipped because a newer write landed."
        );
        describe_counter!(
            METRIC_MUTATION_TRANSFORM_FAILED_TOTAL,
            Unit::Count,
            "Mutations rejected by their optimistic transform."
        );
        describe_counter!(
            METRIC_MUTATION_ABANDONED_TOTAL,
            Unit::Count,
            "Mutations dropped before the remote write resolved."
        );
        describe_counter!(
            METRIC_CACHE_READ_TOTAL,
            Unit::Count,
            "Cache reads, labelled by freshness."
        );
        describe_gauge!(
            METRIC_REFETCH_QUEUE_LEN,
            Unit::Count,
            "Current number of pending refetch requests."
        );
        describe_counter!(
            METRIC_REFETCH_DROPPED_TOTAL,
            Unit::Count,
            "Refetch requests dropped due to queue overflow."
        );
        describe_histogram!(
            METRIC_REMOTE_WRITE_MS,
            Unit::Milliseconds,
            "Remote write latency in milliseconds."
        );
        describe_histogram!(
            METRIC_REFETCH_BATCH_MS,
            Unit::Milliseconds,
            "Refetch batch consumption latency in milliseconds."
        );
    });
}
