//! HTTP routes for Session Gate.
//!
//! Defines the Axum router and application state.

use crate::auth::{AuthGate, KeySource, SessionCache, TokenVerifier};
use crate::config::Config;
use crate::handlers;
use crate::middleware::{http_metrics_middleware, require_auth, AuthState};
use axum::{middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Authorization gate for protected routes.
    pub gate: Arc<AuthGate>,
}

impl AppState {
    /// Wire key source, verifier, cache and gate from configuration.
    ///
    /// The key source starts empty; callers prime it with `refresh()`.
    pub fn from_config(config: Config) -> Self {
        let key_source = KeySource::from_url(config.jwks_url.clone(), config.key_source_config());
        let verifier = Arc::new(TokenVerifier::new(
            key_source.clone(),
            config.verifier_config(),
        ));
        let cache = Arc::new(SessionCache::new(config.session_cache_config()));
        let gate = Arc::new(AuthGate::new(
            key_source,
            verifier,
            cache,
            config.audience.clone(),
            config.cache_invalidation,
        ));

        Self { config, gate }
    }
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/v1/health` - Key-set readiness - public
/// - `/metrics` - Prometheus metrics - public
/// - `/v1/me` - Verified caller claims - requires a bearer token
/// - TraceLayer for request logging
/// - HTTP metrics middleware
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let auth_state = Arc::new(AuthState {
        gate: Arc::clone(&state.gate),
    });

    let public_routes = Router::new()
        .route("/v1/health", get(handlers::health_check))
        .with_state(state.clone());

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    let protected_routes = Router::new()
        .route("/v1/me", get(handlers::get_me))
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth))
        .with_state(state);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    // 3. http_metrics_middleware - Record ALL responses (outermost)
    public_routes
        .merge(metrics_routes)
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(middleware::from_fn(http_metrics_middleware))
}
