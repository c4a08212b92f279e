use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_ACTIVATE_DELETE_FAILED, METRIC_ACTIVATE_DELETED, METRIC_FETCH_HIT, METRIC_FETCH_MISS,
    METRIC_INSTALL_FAILED, METRIC_INSTALL_MS,
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
            METRIC_FETCH_HIT,
            Unit::Count,
            "Total number of fetches served from the active generation."
        );
        describe_counter!(
            METRIC_FETCH_MISS,
            Unit::Count,
            "Total number of fetches that fell back to the network."
        );
        describe_counter!(
            METRIC_INSTALL_FAILED,
            Unit::Count,
            "Total number of failed generation installs."
        );
        describe_histogram!(
            METRIC_INSTALL_MS,
            Unit::Milliseconds,
            "Generation install latency in milliseconds."
        );
        describe_counter!(
            METRIC_ACTIVATE_DELETED,
            Unit::Count,
            "Total number of stale generations deleted on activation."
        );
        describe_counter!(
            METRIC_ACTIVATE_DELETE_FAILED,
            Unit::Count,
            "Total number of stale generations whose deletion failed."
        );
    });
}
