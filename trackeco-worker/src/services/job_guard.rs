//! Job claim and duplicate-delivery guard
//!
//! The queue is at-least-once, so the same analyze task can arrive more than
//! once. The claim is a single conditional UPDATE: only a job still in
//! PENDING_ANALYSIS can be taken, every other state makes the delivery a
//! benign no-op. Terminal states are final; a replayed terminal job causes
//! no further work and no record change.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use trackeco_common::db::models::{JobStatus, UploadJob};
use trackeco_common::Result;
use tracing::{info, warn};

/// Result of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Job moved PENDING_ANALYSIS → PROCESSING; this delivery owns it
    Claimed,
    /// Job was not pending (duplicate delivery or already settled)
    Skipped,
}

/// Atomically claim a pending job
pub async fn claim(db: &SqlitePool, job_id: &str, now: DateTime<Utc>) -> Result<ClaimOutcome> {
    let result = sqlx::query(
        "UPDATE upload_jobs
         SET status = ?, processed_at = ?
         WHERE job_id = ? AND status = ?",
    )
    .bind(JobStatus::Processing.as_str())
    .bind(now.to_rfc3339())
    .bind(job_id)
    .bind(JobStatus::PendingAnalysis.as_str())
    .execute(db)
    .await?;

    if result.rows_affected() == 1 {
        info!(job_id, "Claimed job for processing");
        Ok(ClaimOutcome::Claimed)
    } else {
        warn!(job_id, "Job not pending, skipping duplicate delivery");
        Ok(ClaimOutcome::Skipped)
    }
}

/// Release a claim after a retryable failure so a later delivery can pass
/// the guard. Only PROCESSING jobs are released; terminal states stay final.
pub async fn release(db: &SqlitePool, job_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE upload_jobs SET status = ? WHERE job_id = ? AND status = ?",
    )
    .bind(JobStatus::PendingAnalysis.as_str())
    .bind(job_id)
    .bind(JobStatus::Processing.as_str())
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Mark a job FAILED with an error message. Terminal states are left alone.
pub async fn mark_failed(db: &SqlitePool, job_id: &str, error: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE upload_jobs
         SET status = ?, error_message = ?
         WHERE job_id = ? AND status NOT IN (?, ?)",
    )
    .bind(JobStatus::Failed.as_str())
    .bind(error)
    .bind(job_id)
    .bind(JobStatus::Completed.as_str())
    .bind(JobStatus::Failed.as_str())
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Load a job row, if present
pub async fn load_job(db: &SqlitePool, job_id: &str) -> Result<Option<UploadJob>> {
    let row: Option<(
        String,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    )> = sqlx::query_as(
        "SELECT job_id, user_id, source_path, status, processed_at,
                ai_result, error_message, fcm_token, created_at
         FROM upload_jobs WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_optional(db)
    .await?;

    Ok(row.map(
        |(job_id, user_id, source_path, status, processed_at, ai_result, error_message, fcm_token, created_at)| {
            UploadJob {
                job_id,
                user_id,
                source_path,
                status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
                processed_at: processed_at.and_then(parse_timestamp),
                ai_result,
                error_message,
                fcm_token,
                created_at: created_at.and_then(parse_timestamp),
            }
        },
    ))
}

fn parse_timestamp(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
