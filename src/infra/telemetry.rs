use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing::level_filters::LevelFilter;
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
        .with_default_directive(LevelFilter::from(logging.level).into())
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
            "cartella_cache_hit_total",
            Unit::Count,
            "Reads served from a fresh cache entry without a fetch."
        );
        describe_counter!(
            "cartella_cache_miss_total",
            Unit::Count,
            "Reads that dispatched a fetch (absent, stale, or errored entry)."
        );
        describe_counter!(
            "cartella_cache_dedup_total",
            Unit::Count,
            "Reads that attached to an already in-flight fetch."
        );
        describe_counter!(
            "cartella_cache_evict_total",
            Unit::Count,
            "Entries evicted after their retention window with no subscribers."
        );
        describe_counter!(
            "cartella_cache_discarded_completion_total",
            Unit::Count,
            "Fetch completions dropped because their generation was superseded."
        );
        describe_counter!(
            "cartella_cache_refetch_total",
            Unit::Count,
            "Background refetches dispatched by invalidation or interval."
        );
        describe_counter!(
            "cartella_session_unauthorized_total",
            Unit::Count,
            "Forced session transitions caused by an unauthorized response."
        );
    });
}
