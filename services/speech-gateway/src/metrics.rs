//! Prometheus metrics exposition
//!
//! Gateway-level metrics:
//!
//! - `speech_requests_total` (counter): label `status`
//! - `speech_request_duration_seconds` (histogram): label `status`
//!
//! The pool and orchestrator emit their own counters through the same
//! recorder (`speech_attempts_total`, `speech_key_deactivated_total`,
//! `speech_pool_fallback_total`, `speech_pool_exhausted_total`).

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `speech_request_duration_seconds` with explicit buckets so it
/// renders as a Prometheus histogram rather than the default summary.
/// Boundaries cover the range from fast rejections to a full retry cycle
/// with backoff against a slow upstream.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "speech_request_duration_seconds".to_string(),
            ),
            &[
                0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed gateway request with its response status.
pub fn record_request(status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("speech_requests_total", "status" => status_str.clone()).increment(1);
    metrics::histogram!("speech_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}
