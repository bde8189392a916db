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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "feedline_post_cache_hit_total",
            Unit::Count,
            "Post cache reads served from the cache store."
        );
        describe_counter!(
            "feedline_post_cache_miss_total",
            Unit::Count,
            "Post cache reads populated from the canonical store."
        );
        describe_counter!(
            "feedline_post_cache_decode_failure_total",
            Unit::Count,
            "Cached post records that could not be decoded and were treated as misses."
        );
        describe_counter!(
            "feedline_feed_trimmed_total",
            Unit::Count,
            "Feed entries evicted by the per-user size bound."
        );
        describe_counter!(
            "feedline_fanout_entries_total",
            Unit::Count,
            "Feed entries written by publish fan-out."
        );
        describe_counter!(
            "feedline_event_applied_total",
            Unit::Count,
            "Engagement events processed, labelled by kind and outcome."
        );
        describe_histogram!(
            "feedline_event_apply_ms",
            Unit::Milliseconds,
            "End-to-end latency of applying one engagement event."
        );
        describe_counter!(
            "feedline_heating_posts_total",
            Unit::Count,
            "Post records written by cache heating."
        );
        describe_counter!(
            "feedline_heating_failure_total",
            Unit::Count,
            "Posts skipped by cache heating after a batch or announcement failure."
        );
        describe_counter!(
            "feedline_heating_rejected_total",
            Unit::Count,
            "Heating triggers rejected because a run was active."
        );
        describe_histogram!(
            "feedline_heating_run_ms",
            Unit::Milliseconds,
            "Duration of one heating run."
        );
        describe_counter!(
            "feedline_cache_expired_total",
            Unit::Count,
            "Expired keys removed by the in-process sweeper."
        );
        describe_gauge!(
            "feedline_cache_keys",
            Unit::Count,
            "Keys held by the in-process cache store after the last sweep."
        );
    });
}
