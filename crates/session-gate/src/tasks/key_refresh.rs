//! Scheduled key-set refresh.
//!
//! Keeps the key set fresh so request-path lookups rarely have to fetch.
//! Exits when the cancellation token is triggered.

use crate::auth::key_source::instant_after;
use crate::auth::KeySource;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Start the key refresh background task.
///
/// The first refresh happens one `period` after start; the caller is
/// expected to have primed the key source already.
#[instrument(skip_all, name = "gate.task.key_refresh")]
pub async fn start_key_refresh(
    key_source: KeySource,
    period: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "gate.task.key_refresh",
        period_seconds = period.as_secs(),
        "Starting key refresh task"
    );

    let mut interval = interval_at(instant_after(Instant::now(), period), period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = key_source.refresh().await {
                    warn!(
                        target: "gate.task.key_refresh",
                        error = %e,
                        "Scheduled key refresh failed, keeping previous keys"
                    );
                }
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "gate.task.key_refresh",
                    "Key refresh task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "gate.task.key_refresh", "Key refresh task stopped");
}
