//! Periodic session cache sweep.
//!
//! Lookups already drop expired entries lazily; the sweep bounds memory
//! held by entries that are never looked up again.

use crate::auth::SessionCache;
use crate::observability::metrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Start the cache sweep background task.
#[instrument(skip_all, name = "gate.task.cache_sweep")]
pub async fn start_cache_sweep(
    cache: Arc<SessionCache>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "gate.task.cache_sweep",
        period_seconds = period.as_secs(),
        "Starting cache sweep task"
    );

    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_sweep(&cache);
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "gate.task.cache_sweep",
                    "Cache sweep task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "gate.task.cache_sweep", "Cache sweep task stopped");
}

/// Run a single sweep. Returns the number of entries removed.
pub(crate) fn run_sweep(cache: &SessionCache) -> usize {
    let removed = cache.sweep(Utc::now());
    let remaining = cache.len();
    if removed > 0 {
        debug!(
            target: "gate.task.cache_sweep",
            removed = removed,
            remaining = remaining,
            "Swept expired session cache entries"
        );
    }
    metrics::record_cache_sweep(removed, remaining);
    removed
}
