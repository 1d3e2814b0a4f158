//! trackeco-worker library interface
//!
//! Exposes the pipeline and queue internals for integration testing.

pub mod pipeline;
pub mod queue;
pub mod services;

use sqlx::SqlitePool;
use std::sync::Arc;
use trackeco_common::config::Config;

/// Shared worker context handed to every task handler
#[derive(Clone)]
pub struct WorkerContext {
    pub db: SqlitePool,
    pub config: Arc<Config>,
    pub http: reqwest::Client,
}

impl WorkerContext {
    pub fn new(db: SqlitePool, config: Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.gemini.request_timeout_secs,
            ))
            .build()
            .unwrap_or_default();
        Self {
            db,
            config: Arc::new(config),
            http,
        }
    }
}
