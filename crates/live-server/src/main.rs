//! Live Server
//!
//! WebSocket control plane for real-time conference rooms.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Connect the shared store shards
//! 4. Load the repository (optionally seeded from `LIVE_SEED_FILE`)
//! 5. Build the application state and start the channel listener
//! 6. Spawn background tasks (BBB cost refresher, room view cleanup)
//! 7. Bind the HTTP server (WebSocket, health, metrics) and mark ready
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;
use std::time::Duration;

use live_server::config::Config;
use live_server::repositories::{InMemoryRepository, Repository, Seed};
use live_server::routes::build_routes;
use live_server::state::AppState;
use live_server::store::connect_shards;
use live_server::tasks::{start_bbb_cost_refresher, start_room_view_cleanup};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to connections and tasks to wind down after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first: it carries the log filter
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.observability.log_filter.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting Live Server");
    info!(
        bind_address = %config.bind_address,
        label = %config.connection_label(),
        store_shards = config.store.shard_count(),
        group_expiry_seconds = config.group_expiry_seconds,
        external_timeout_seconds = config.external_timeout_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;
    info!("Prometheus metrics recorder initialized");

    info!("Connecting to shared store...");
    let shards = connect_shards(&config.store).await.map_err(|e| {
        error!(error = %e, "Failed to connect to shared store");
        e
    })?;
    info!(shards = shards.len(), "Shared store connected");

    let repository: Arc<dyn Repository> = match &config.seed_file {
        Some(path) => {
            let seed = Seed::from_file(path).map_err(|e| {
                error!(error = %e, path = %path, "Failed to load seed file");
                e
            })?;
            Arc::new(InMemoryRepository::from_seed(seed))
        }
        None => Arc::new(InMemoryRepository::new()),
    };

    let bbb_cost_interval = Duration::from_secs(config.bbb_cost_interval_seconds);
    let cleanup_interval = Duration::from_secs(config.room_view_cleanup_interval_seconds);
    let bind_address = config.bind_address.clone();

    let state = Arc::new(AppState::new(config, repository, shards).map_err(|e| {
        error!(error = %e, "Failed to build application state");
        e
    })?);

    let shutdown_token = CancellationToken::new();

    let listener_handle = state
        .layer
        .start_listener(shutdown_token.child_token())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start channel listener");
            e
        })?;

    tokio::spawn(start_bbb_cost_refresher(
        Arc::clone(&state.repository),
        state.conferencing.bbb().clone(),
        bbb_cost_interval,
        shutdown_token.child_token(),
    ));
    tokio::spawn(start_room_view_cleanup(
        Arc::clone(&state.repository),
        cleanup_interval,
        shutdown_token.child_token(),
    ));
    info!("Background tasks started");

    let app = build_routes(
        Arc::clone(&state),
        prometheus_handle,
        shutdown_token.child_token(),
    );

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %bind_address, "Failed to bind HTTP server");
            format!("Failed to bind HTTP server to {bind_address}: {e}")
        })?;
    info!(addr = %bind_address, "HTTP server bound successfully");

    let server_shutdown_token = shutdown_token.child_token();
    let server_handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown_token.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    state.health.set_ready();
    info!("Live Server running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so the load balancer stops sending traffic
    state.health.set_not_ready();

    shutdown_token.cancel();

    // Give connections time to unregister
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    if let Err(e) = server_handle.await {
        error!(error = %e, "HTTP server task failed");
    }
    if let Err(e) = listener_handle.await {
        error!(error = %e, "Channel listener task failed");
    }

    info!("Live Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
