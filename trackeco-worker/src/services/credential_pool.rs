//! Credential pool and rotation coordinator
//!
//! N ordered provider keys share one rotation cursor in the settings table.
//! A job reads the cursor, tries keys from there wrapping modulo N, and the
//! cursor is advanced only to an index that fully succeeded, so traffic
//! sticks to the last known-good key. The cursor has no locking
//! beyond the store's own atomicity; two jobs racing to the same preferred
//! key is acceptable, fallback covers it.

use crate::services::gemini_client::InferenceError;
use sqlx::SqlitePool;
use std::future::Future;
use thiserror::Error;
use tracing::{info, warn};

const CURSOR_KEY: &str = "gemini_key_cursor";

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("No inference credentials configured")]
    NoCredentials,

    #[error("All {count} credentials failed, last error: {last}")]
    AllFailed { count: usize, last: InferenceError },

    #[error("Cursor store error: {0}")]
    Store(#[from] trackeco_common::Error),
}

/// Shared credential pool
pub struct CredentialPool {
    db: SqlitePool,
    keys: Vec<String>,
}

impl CredentialPool {
    pub fn new(db: SqlitePool, keys: Vec<String>) -> Self {
        Self { db, keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Read the shared cursor, clamped into range
    pub async fn cursor(&self) -> Result<usize, RotationError> {
        if self.keys.is_empty() {
            return Err(RotationError::NoCredentials);
        }
        let raw = trackeco_common::db::get_setting(&self.db, CURSOR_KEY).await?;
        let index = raw
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        Ok(index % self.keys.len())
    }

    async fn commit_cursor(&self, index: usize) -> Result<(), RotationError> {
        trackeco_common::db::set_setting(&self.db, CURSOR_KEY, &index.to_string()).await?;
        Ok(())
    }

    /// Try `op` with each credential starting at the shared cursor, wrapping
    /// modulo N within this one job. The closure must clean up its own
    /// partial remote state before returning an error.
    pub async fn run_with_rotation<T, F, Fut>(&self, mut op: F) -> Result<T, RotationError>
    where
        F: FnMut(usize, String) -> Fut,
        Fut: Future<Output = Result<T, InferenceError>>,
    {
        let start = self.cursor().await?;
        let count = self.keys.len();
        let mut last_error: Option<InferenceError> = None;

        for attempt in 0..count {
            let index = (start + attempt) % count;
            let key = self.keys[index].clone();
            info!(index, "Trying inference credential");

            match op(index, key).await {
                Ok(value) => {
                    // Only a fully successful index becomes the new cursor
                    self.commit_cursor(index).await?;
                    info!(index, "Inference credential succeeded, cursor updated");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(index, "Inference credential failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(RotationError::AllFailed {
            count,
            last: last_error.unwrap_or(InferenceError::Processing(
                "no credential attempted".to_string(),
            )),
        })
    }
}
