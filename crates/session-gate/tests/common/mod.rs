//! Shared harness for session-gate integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use metrics_exporter_prometheus::PrometheusBuilder;
use session_gate::config::Config;
use session_gate::routes::{build_routes, AppState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const ISSUER: &str = "https://issuer.test";
pub const AUDIENCE: &str = "app";

/// Configuration variables pointing at a mock key-set endpoint.
pub fn test_vars(jwks_url: &str) -> HashMap<String, String> {
    HashMap::from([
        ("GATE_ISSUER".to_string(), ISSUER.to_string()),
        ("GATE_AUDIENCE".to_string(), AUDIENCE.to_string()),
        ("GATE_JWKS_URL".to_string(), jwks_url.to_string()),
        ("GATE_ALLOW_INSECURE_JWKS".to_string(), "true".to_string()),
        ("GATE_MIN_KEY_REFRESH_SECONDS".to_string(), "1".to_string()),
        ("GATE_KEY_MAX_AGE_SECONDS".to_string(), "300".to_string()),
    ])
}

/// A session-gate HTTP server on an ephemeral port.
pub struct TestGateServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    handle: JoinHandle<()>,
}

impl TestGateServer {
    /// Spawn a server with the given configuration variables.
    ///
    /// The key set is not primed; the first request loads it.
    pub async fn spawn(vars: HashMap<String, String>) -> Result<Self, anyhow::Error> {
        let config = Config::from_vars(&vars)?;
        let state = Arc::new(AppState::from_config(config));

        // Not installed globally so tests do not fight over the recorder
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();
        let app = build_routes(Arc::clone(&state), metrics_handle);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server failed");
        });

        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }
}

impl Drop for TestGateServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
