//! BBB cost refresher.
//!
//! Every interval, each active BBB server is asked for its running
//! meetings and its cost is recomputed. A server that cannot be reached
//! keeps its previous cost.

use crate::conferencing::{meetings_cost, BbbClient};
use crate::errors::LiveError;
use crate::models::ServerKind;
use crate::observability::metrics;
use crate::repositories::Repository;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub updated: usize,
    pub failed: usize,
}

/// Refresh the cost of every active BBB server once.
///
/// # Errors
///
/// Returns an error only if the server list cannot be read; per-server
/// failures are logged and counted.
pub async fn refresh_bbb_costs(
    repository: &dyn Repository,
    client: &BbbClient,
) -> Result<RefreshSummary, LiveError> {
    let servers = repository.list_servers(ServerKind::Bbb).await?;
    let mut summary = RefreshSummary::default();

    for server in servers.iter().filter(|s| s.active) {
        let cost = match client.get_meetings(server).await {
            Ok(meetings) => meetings_cost(&meetings),
            Err(e) => {
                warn!(
                    target: "live.task.bbb_cost",
                    server_id = %server.id,
                    error = %e,
                    previous_cost = server.cost,
                    "Telemetry unavailable, keeping previous cost"
                );
                metrics::record_bbb_cost_refresh(false);
                summary.failed += 1;
                continue;
            }
        };

        if let Err(e) = repository.update_server_cost(server.id, cost).await {
            warn!(
                target: "live.task.bbb_cost",
                server_id = %server.id,
                error = %e,
                "Failed to store server cost"
            );
            metrics::record_bbb_cost_refresh(false);
            summary.failed += 1;
            continue;
        }

        debug!(
            target: "live.task.bbb_cost",
            server_id = %server.id,
            cost,
            "Server cost refreshed"
        );
        metrics::record_bbb_cost_refresh(true);
        summary.updated += 1;
    }

    Ok(summary)
}

/// Run the refresher until `cancel_token` is cancelled.
pub async fn start_bbb_cost_refresher(
    repository: Arc<dyn Repository>,
    client: BbbClient,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "live.task.bbb_cost",
        interval_seconds = interval.as_secs(),
        "Starting BBB cost refresher"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!(
                    target: "live.task.bbb_cost",
                    "BBB cost refresher received shutdown signal, exiting"
                );
                break;
            }
            _ = ticker.tick() => {
                match refresh_bbb_costs(repository.as_ref(), &client).await {
                    Ok(summary) if summary.failed > 0 => {
                        warn!(
                            target: "live.task.bbb_cost",
                            updated = summary.updated,
                            failed = summary.failed,
                            "BBB cost refresh incomplete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            target: "live.task.bbb_cost",
                            error = %e,
                            "Failed to list BBB servers"
                        );
                    }
                }
            }
        }
    }

    info!(target: "live.task.bbb_cost", "BBB cost refresher stopped");
}
