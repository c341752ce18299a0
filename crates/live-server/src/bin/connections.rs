//! `live-connections`: inspect and steer live connections across
//! deployments.
//!
//! Reads the same environment as the server (`REDIS_URL`,
//! `LIVE_CHANNEL_PREFIX`, ...).
//!
//! ```text
//! live-connections list
//! live-connections drop 'abc123.*' --interval 50
//! live-connections force_reload --interval 100
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use live_server::admin::{list_connections, send_control, ControlAction};
use live_server::channels::ChannelLayer;
use live_server::config::Config;
use live_server::registry::ConnectionRegistry;
use live_server::store::connect_shards;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "live-connections", about = "Manage live connections per deployment")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connection counts per deployment label.
    List,
    /// Close every connection of the matching labels.
    Drop {
        /// Label globs; all labels when omitted.
        patterns: Vec<String>,
        /// Pause between connections in milliseconds.
        #[arg(long, default_value_t = 0)]
        interval: u64,
    },
    /// Ask every client of the matching labels to reload.
    #[command(name = "force_reload")]
    ForceReload {
        /// Label globs; all labels when omitted.
        patterns: Vec<String>,
        /// Pause between connections in milliseconds.
        #[arg(long, default_value_t = 0)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_server=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;
    let shards = connect_shards(&config.store)
        .await
        .context("failed to connect to the shared store")?;
    let registry_store = shards
        .first()
        .cloned()
        .context("no store shards configured")?;
    let registry = ConnectionRegistry::new(registry_store, config.connection_label());

    match cli.command {
        Command::List => {
            for (label, count) in list_connections(&registry).await? {
                println!("{label}: {count}");
            }
        }
        Command::Drop { patterns, interval } => {
            let layer = ChannelLayer::new(shards, config.channel_prefix.clone(), config.group_expiry())?;
            let sent = send_control(
                &registry,
                &layer,
                &patterns,
                ControlAction::Drop,
                Duration::from_millis(interval),
            )
            .await?;
            println!("Dropped {sent} connections");
        }
        Command::ForceReload { patterns, interval } => {
            let layer = ChannelLayer::new(shards, config.channel_prefix.clone(), config.group_expiry())?;
            let sent = send_control(
                &registry,
                &layer,
                &patterns,
                ControlAction::Reload,
                Duration::from_millis(interval),
            )
            .await?;
            println!("Asked {sent} connections to reload");
        }
    }
    Ok(())
}
