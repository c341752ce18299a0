//! Room view cleanup.
//!
//! Sessions that die without disconnecting leave room views open. Views
//! open longer than [`IDLE_THRESHOLD`] are closed with an assumed duration
//! of [`ASSUMED_DURATION`].

use crate::errors::LiveError;
use crate::repositories::Repository;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Views open longer than this are considered abandoned.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(6 * 3600);

/// End of an abandoned view, relative to its start.
pub const ASSUMED_DURATION: Duration = Duration::from_secs(3600);

/// Close abandoned room views. Returns how many were closed.
///
/// # Errors
///
/// Returns a repository error.
pub async fn cleanup_room_views(
    repository: &dyn Repository,
    now: DateTime<Utc>,
) -> Result<usize, LiveError> {
    repository
        .close_stale_room_views(now, IDLE_THRESHOLD, ASSUMED_DURATION)
        .await
}

/// Run the cleanup until `cancel_token` is cancelled.
pub async fn start_room_view_cleanup(
    repository: Arc<dyn Repository>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "live.task.room_view_cleanup",
        interval_seconds = interval.as_secs(),
        "Starting room view cleanup"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!(
                    target: "live.task.room_view_cleanup",
                    "Room view cleanup received shutdown signal, exiting"
                );
                break;
            }
            _ = ticker.tick() => {
                match cleanup_room_views(repository.as_ref(), Utc::now()).await {
                    Ok(0) => {}
                    Ok(closed) => {
                        info!(
                            target: "live.task.room_view_cleanup",
                            closed,
                            "Closed abandoned room views"
                        );
                    }
                    Err(e) => {
                        error!(
                            target: "live.task.room_view_cleanup",
                            error = %e,
                            "Room view cleanup failed"
                        );
                    }
                }
            }
        }
    }

    info!(target: "live.task.room_view_cleanup", "Room view cleanup stopped");
}
