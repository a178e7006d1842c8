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

/// Register units and help text for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "kessel_cache_hit_total",
            Unit::Count,
            "Total number of cache reads answered from a backend."
        );
        describe_counter!(
            "kessel_cache_miss_total",
            Unit::Count,
            "Total number of cache reads that found nothing or an expired entry."
        );
        describe_counter!(
            "kessel_cache_store_total",
            Unit::Count,
            "Total number of successful cache writes."
        );
        describe_counter!(
            "kessel_cache_evict_total",
            Unit::Count,
            "Total number of entries evicted under quota pressure or cleanup."
        );
        describe_counter!(
            "kessel_cache_sri_failure_total",
            Unit::Count,
            "Total number of reads whose bytes failed integrity verification."
        );
        describe_gauge!(
            "kessel_invalidation_queue_len",
            Unit::Count,
            "Current number of deletions waiting in the invalidation queue."
        );
        describe_counter!(
            "kessel_invalidation_dropped_total",
            Unit::Count,
            "Total number of queued deletions discarded because the queue was full."
        );
        describe_histogram!(
            "kessel_invalidation_batch_ms",
            Unit::Milliseconds,
            "Invalidation batch processing latency in milliseconds."
        );
        describe_counter!(
            "kessel_warming_request_total",
            Unit::Count,
            "Total number of warming fetches, labelled by outcome."
        );
        describe_counter!(
            "kessel_http_not_modified_total",
            Unit::Count,
            "Total number of requests answered with 304 Not Modified."
        );
        describe_counter!(
            "kessel_http_precondition_failed_total",
            Unit::Count,
            "Total number of requests answered with 412 Precondition Failed."
        );
    });
}
