//! foldexd - keeps the folder index locks of a foldex database healthy
//!
//! Releases locks whose lease expired because their worker died. Takes the
//! path of a JSON configuration file as its only argument, or from
//! `FOLDEX_CONFIG`; without one the defaults apply.

use anyhow::Context;
use foldex_core::{FolderIndexCoordinator, FoldexConfig, SqliteStore};
use foldex_scheduler::LeaseSweeper;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn load_config() -> anyhow::Result<FoldexConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FOLDEX_CONFIG").ok());

    match path {
        Some(path) => FoldexConfig::load(&path)
            .with_context(|| format!("failed to load configuration from {}", path)),
        None => Ok(FoldexConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("foldex=debug".parse()?))
        .init();

    let config = load_config()?;
    tracing::info!("Starting foldexd");

    let store = Arc::new(SqliteStore::open(&config).await?);
    let coordinator = Arc::new(FolderIndexCoordinator::from_config(store.clone(), &config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = LeaseSweeper::new(
        coordinator,
        config.lock_lease_ttl(),
        config.sweep_interval(),
        shutdown_rx,
    );
    let sweeper = tokio::spawn(sweeper.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    shutdown_tx.send(true)?;
    sweeper.await?;
    store.close().await;

    tracing::info!("foldexd stopped");
    Ok(())
}
