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

/// Register descriptions for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_gauge!(
            "nucache_event_queue_len",
            Unit::Count,
            "Change events waiting to be consumed."
        );
        describe_histogram!(
            "nucache_refresh_ms",
            Unit::Milliseconds,
            "Incremental refresh batch latency in milliseconds."
        );
        describe_counter!(
            "nucache_refresh_deferred_total",
            Unit::Count,
            "Refresh steps skipped because the content store could not serve fresh data."
        );
        describe_histogram!(
            "nucache_rebuild_ms",
            Unit::Milliseconds,
            "Full rebuild latency in milliseconds."
        );
        describe_counter!(
            "nucache_rebuild_total",
            Unit::Count,
            "Completed full rebuilds."
        );
        describe_gauge!(
            "nucache_graph_nodes",
            Unit::Count,
            "Nodes in the current graph generation."
        );
        describe_gauge!(
            "nucache_live_snapshots",
            Unit::Count,
            "Snapshots currently held by readers."
        );
    });
}
