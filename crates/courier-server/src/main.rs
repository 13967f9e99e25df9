//! # Courier Server
//!
//! Realtime publish/subscribe gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with environment variables
//! COURIER_PORT=8000 COURIER_HOST=0.0.0.0 courier
//! ```
//!
//! A `courier.toml` in the working directory, `/etc/courier/` or
//! `~/.config/courier/` is picked up automatically.

mod audit;
mod config;
mod convert;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use courier_core::{MemoryStore, Node, Shard, ShardRing};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;
    config.validate()?;

    info!("Starting Courier server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    let node = Arc::new(build_node(&config)?);
    node.run().await.context("Failed to start node")?;

    let shutdown = {
        let node = Arc::clone(&node);
        let timeout = config.shutdown_timeout();
        async move {
            shutdown_signal().await;
            info!("Gracefully shutting down...");
            node.shutdown(timeout).await;
        }
    };
    handlers::run_server(config, Arc::clone(&node), shutdown).await?;

    info!("Server was shut down successfully");
    Ok(())
}

/// One in-process store per configured shard.
fn build_node(config: &config::Config) -> Result<Node> {
    let meta_ttl = Duration::from_secs(config.history.meta_ttl_secs);
    let shards = config
        .shards
        .names
        .iter()
        .map(|name| {
            let store = Arc::new(MemoryStore::new(meta_ttl));
            Shard::with_backoff(name.clone(), store, config.backoff())
        })
        .collect();
    let ring = ShardRing::new(shards).context("Failed to build shard ring")?;
    Ok(Node::with_handler(
        config.node_config(),
        ring,
        Arc::new(audit::AuditHandler),
    ))
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
