//! MPS Daemon
//!
//! Accepts APF tunnels from managed devices over TCP or WebSocket,
//! authenticates them against the device directory and keeps track of
//! which devices are reachable.

mod config;
#[cfg(test)]
mod config_tests;
mod metrics;
mod server;

use anyhow::Result;
use clap::Parser;
use mps_engine::{BroadcastBus, EngineContext};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use config::MpsConfig;

/// MPS Daemon - APF management presence server
#[derive(Parser, Debug)]
#[command(name = "mpsd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mps.toml")]
    config: String,

    /// Additional configuration merged over the first
    #[arg(long)]
    overlay: Option<String>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("MPS Daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = MpsConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);
    if let Some(overlay) = &args.overlay {
        config.load_merge(overlay).await?;
        info!("Merged configuration from {}", overlay);
    }

    let directory = Arc::new(config.build_directory());
    info!("{} device groups configured", config.groups.len());

    let events = Arc::new(BroadcastBus::default());
    let ctx = EngineContext::new(config.engine_config(), directory, events);
    let limit = Arc::new(Semaphore::new(config.server.max_connections));

    // Start metrics server
    let metrics_handle = metrics::start_server(&config.monitoring);

    let ws_handle = config.server.ws_bind.map(|bind| {
        let ctx = Arc::clone(&ctx);
        let limit = Arc::clone(&limit);
        tokio::spawn(async move {
            if let Err(e) = server::run_ws(bind, ctx, limit).await {
                error!("WebSocket listener failed: {}", e);
            }
        })
    });

    tokio::select! {
        result = server::run_tcp(config.server.bind, ctx, limit) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    // Cleanup
    if let Some(handle) = ws_handle {
        handle.abort();
    }
    metrics_handle.abort();

    Ok(())
}
