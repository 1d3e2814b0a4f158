//! trackeco-worker - Disposal Verification Worker
//!
//! Consumes analyze jobs produced by the upload collaborator, verifies the
//! uploaded media with the inference provider and applies the result to the
//! gamification ledger. Also drains the decoupled point-award and
//! search-sync tasks.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use trackeco_common::config::Config;
use trackeco_worker::{queue::runner, WorkerContext};

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting trackeco-worker");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    if config.gemini.api_keys.is_empty() {
        warn!("No inference credentials configured; analyze jobs will retry until exhaustion");
    }
    info!(
        "Media root: {}, credentials: {}",
        config.media_root.display(),
        config.gemini.api_keys.len()
    );

    let db = trackeco_common::db::init_database(&config.database_path).await?;
    info!("Database connection established");

    std::fs::create_dir_all(config.media_root.join("incoming"))?;

    let ctx = WorkerContext::new(db, config);
    let shutdown = CancellationToken::new();

    let runner_handle = {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner::run(ctx, shutdown).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers");
    shutdown.cancel();
    runner_handle.await?;

    Ok(())
}
