//! Session Gate
//!
//! Verifies identity-provider bearer tokens in front of protected routes.

use session_gate::config::Config;
use session_gate::observability::metrics::init_metrics_recorder;
use session_gate::routes::{self, AppState};
use session_gate::tasks::{start_cache_sweep, start_key_refresh};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Session Gate");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        issuer = %config.issuer,
        audience = %config.audience,
        jwks_url = %config.jwks_url,
        clock_skew_seconds = config.clock_skew.as_secs(),
        max_cache_entries = config.max_cache_entries,
        "Configuration loaded successfully"
    );

    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics: {}", e);
        e
    })?;

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;
    let key_max_age = config.key_max_age;
    let cache_sweep_interval = config.cache_sweep_interval;

    let state = Arc::new(AppState::from_config(config));
    let key_source = state.gate.key_source().clone();

    // Requests are denied until keys arrive; lookups on the request path retry the fetch
    match key_source.refresh().await {
        Ok(key_set) => info!(signing_keys = key_set.len(), "Initial key set loaded"),
        Err(e) => warn!(error = %e, "Initial key-set fetch failed, starting without keys"),
    }

    let cancel_token = CancellationToken::new();
    let key_refresh_handle = tokio::spawn(start_key_refresh(
        key_source,
        key_max_age,
        cancel_token.clone(),
    ));
    let cache_sweep_handle = tokio::spawn(start_cache_sweep(
        Arc::clone(state.gate.cache()),
        cache_sweep_interval,
        cancel_token.clone(),
    ));

    let app = routes::build_routes(state, metrics_handle);

    info!("Session Gate listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel_token.cancel();
    let tasks = [
        ("key_refresh", key_refresh_handle),
        ("cache_sweep", cache_sweep_handle),
    ];
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    info!("Session Gate shutdown complete");

    Ok(())
}

/// `RUST_LOG` controls filtering; `LOG_FORMAT=json` selects JSON output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "session_gate=info,tower_http=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
