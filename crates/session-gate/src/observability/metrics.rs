//! Metrics definitions for Session Gate.
//!
//! All metrics follow Prometheus naming conventions:
//! - `gate_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `outcome`: allowed, denied
//! - `reason`: bounded by `DenyReason` variants
//! - `result`: hit, miss, invalidated, swept
//! - `status`: changed, unchanged, rate_limited, error
//! - `endpoint`: known paths, everything else is `/other`
//!
//! Token contents and subjects never appear in labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to
/// serve `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Verification is pure CPU on cached keys; sub-millisecond buckets
        .set_buckets_for_metric(
            Matcher::Prefix("gate_token_verification".to_string()),
            &[
                0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.010, 0.050, 0.100, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set token verification buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("gate_http_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.200, 0.500, 1.000, 2.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// Authorization Metrics
// ============================================================================

/// Record an authorization decision.
///
/// Metric: `gate_auth_decisions_total`
/// Labels: `outcome`, `reason`
pub fn record_auth_decision(outcome: &'static str, reason: &'static str) {
    counter!("gate_auth_decisions_total",
        "outcome" => outcome,
        "reason" => reason
    )
    .increment(1);
}

/// Record a token verification.
///
/// Metric: `gate_token_verification_duration_seconds`
/// Labels: `result`
pub fn record_token_verification(duration: Duration, result: &'static str) {
    histogram!("gate_token_verification_duration_seconds",
        "result" => result
    )
    .record(duration.as_secs_f64());
}

// ============================================================================
// Cache Metrics
// ============================================================================

/// Record a session cache event.
///
/// Metric: `gate_session_cache_total`
/// Labels: `result`
pub fn record_session_cache(result: &'static str) {
    counter!("gate_session_cache_total", "result" => result).increment(1);
}

/// Record entries removed by the periodic sweep.
///
/// Metric: `gate_session_cache_swept_total`, `gate_session_cache_entries`
#[allow(clippy::cast_precision_loss)]
pub fn record_cache_sweep(removed: usize, remaining: usize) {
    counter!("gate_session_cache_swept_total").increment(removed as u64);
    gauge!("gate_session_cache_entries").set(remaining as f64);
}

// ============================================================================
// Key Source Metrics
// ============================================================================

/// Record a key-set refresh attempt.
///
/// Metric: `gate_key_refresh_total`
/// Labels: `status`
pub fn record_key_refresh(status: &'static str) {
    counter!("gate_key_refresh_total", "status" => status).increment(1);
}

/// Set the number of active signing keys.
///
/// Metric: `gate_active_signing_keys`
#[allow(clippy::cast_precision_loss)]
pub fn set_active_keys(count: usize) {
    gauge!("gate_active_signing_keys").set(count as f64);
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion.
///
/// Metric: `gate_http_requests_total`, `gate_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status`
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("gate_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("gate_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

/// Categorize HTTP status code into success/unauthorized/timeout/error
fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        401 => "unauthorized",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Normalize endpoint path to bound label cardinality.
fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/v1/health" => "/v1/health",
        "/v1/me" => "/v1/me",
        "/metrics" => "/metrics",
        _ => "/other",
    }
}
