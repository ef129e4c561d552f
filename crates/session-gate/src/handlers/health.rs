//! Health check handler.

use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

/// Response for `/v1/health`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    /// "healthy" once signing keys are loaded, "degraded" before that.
    pub status: &'static str,

    /// Current key-set version (0 until the first successful fetch).
    pub key_set_version: u64,

    /// Number of active signing keys.
    pub signing_keys: usize,

    /// Number of cached verification results.
    pub cache_entries: usize,
}

/// Handler for GET /v1/health
///
/// Always returns 200 so orchestrators can read the body; `status` is
/// "degraded" while no signing keys are loaded.
///
/// ## Example Response
///
/// ```json
/// {
///   "status": "healthy",
///   "key_set_version": 3,
///   "signing_keys": 2,
///   "cache_entries": 118
/// }
/// ```
#[instrument(skip_all, name = "gate.health.check")]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let key_set = state.gate.key_source().snapshot();

    Json(HealthResponse {
        status: if key_set.is_empty() { "degraded" } else { "healthy" },
        key_set_version: key_set.version(),
        signing_keys: key_set.len(),
        cache_entries: state.gate.cache().len(),
    })
}
