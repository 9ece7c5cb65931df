//! Gateway metrics
//!
//! Recorded through the `metrics` facade; nothing is emitted unless the host
//! process installs a recorder.
//!
//! - `gateway_calls_total` (counter): label `outcome`
//! - `gateway_call_duration_seconds` (histogram): label `outcome`
//! - `gateway_attempts_total` (counter): labels `provider`, `classification`
//! - `gateway_rotations_total` (counter): label `provider`
//! - `gateway_fallbacks_total` (counter): label `provider`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const CALL_DURATION: &str = "gateway_call_duration_seconds";

/// Buckets from 50ms to 10 minutes: a call may sit through several backoffs.
const CALL_DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(CALL_DURATION.to_string()), CALL_DURATION_BUCKETS)
}

/// Install the Prometheus recorder globally and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a finished `send` call. `outcome` is `success` or a classification label.
pub fn record_call(outcome: &str, duration_secs: f64) {
    metrics::counter!("gateway_calls_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!(CALL_DURATION, "outcome" => outcome.to_string()).record(duration_secs);
}

/// Record one upstream attempt. `classification` is `success` for a completion.
pub fn record_attempt(provider: &str, classification: &str) {
    metrics::counter!(
        "gateway_attempts_total",
        "provider" => provider.to_string(),
        "classification" => classification.to_string()
    )
    .increment(1);
}

pub fn record_rotation(provider: &str) {
    metrics::counter!("gateway_rotations_total", "provider" => provider.to_string()).increment(1);
}

pub fn record_fallback(provider: &str) {
    metrics::counter!("gateway_fallbacks_total", "provider" => provider.to_string()).increment(1);
}
