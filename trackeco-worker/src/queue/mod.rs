//! DB-backed task queue
//!
//! An at-least-once queue over a single SQLite table. Claims are atomic
//! UPDATE..RETURNING statements, so any number of worker tasks can poll the
//! same table; a claimed task holds a lease, and tasks whose lease expired
//! are handed out again. Consumers must therefore tolerate duplicate
//! delivery (the analyze pipeline short-circuits duplicates at the job
//! claim guard).

pub mod runner;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use trackeco_common::Result;

/// Task kinds consumed by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Verify and score one uploaded media item
    AnalyzeUpload,
    /// Decoupled ledger increment (referral rewards, team payouts)
    AwardPoints,
    /// Fire-and-forget search reindex for one user
    SyncSearch,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::AnalyzeUpload => "analyze_upload",
            TaskKind::AwardPoints => "award_points",
            TaskKind::SyncSearch => "sync_search",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "analyze_upload" => Some(TaskKind::AnalyzeUpload),
            "award_points" => Some(TaskKind::AwardPoints),
            "sync_search" => Some(TaskKind::SyncSearch),
            _ => None,
        }
    }
}

/// Payload of an analyze task, produced by the upload-completion collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeUploadTask {
    pub job_id: String,
    pub source_path: String,
    pub owner_user_id: String,
}

/// Independent point award: {userId, amount, reason}
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardPointsTask {
    pub user_id: String,
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSearchTask {
    pub user_id: String,
}

/// A claimed task as handed to a consumer
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: i64,
    pub kind: TaskKind,
    pub payload: String,
    pub attempts: i64,
    pub max_attempts: i64,
}

impl ClaimedTask {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// How a task handler failed
#[derive(Debug, Error)]
pub enum TaskError {
    /// Worth another delivery after a delay
    #[error("retryable: {0}")]
    Retryable(String),
    /// Retrying cannot help; dead-letter immediately
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Enqueue a task, runnable immediately
pub async fn enqueue<T: Serialize>(
    db: &SqlitePool,
    kind: TaskKind,
    payload: &T,
    max_attempts: i64,
) -> Result<i64> {
    enqueue_after(db, kind, payload, max_attempts, Utc::now()).await
}

/// Enqueue a task that becomes runnable at `run_after`
pub async fn enqueue_after<T: Serialize>(
    db: &SqlitePool,
    kind: TaskKind,
    payload: &T,
    max_attempts: i64,
    run_after: DateTime<Utc>,
) -> Result<i64> {
    let payload_json = serde_json::to_string(payload)?;
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO task_queue (kind, payload, max_attempts, run_after)
         VALUES (?, ?, ?, ?)
         RETURNING task_id",
    )
    .bind(kind.as_str())
    .bind(&payload_json)
    .bind(max_attempts)
    .bind(run_after.to_rfc3339())
    .fetch_one(db)
    .await?;
    Ok(row.0)
}

/// Atomically claim the oldest runnable task, if any
pub async fn claim_next(db: &SqlitePool, lease_secs: i64) -> Result<Option<ClaimedTask>> {
    let now = Utc::now();
    let lease_expires = now + Duration::seconds(lease_secs);
    let row: Option<(i64, String, String, i64, i64)> = sqlx::query_as(
        "UPDATE task_queue
         SET status = 'RUNNING', attempts = attempts + 1, lease_expires_at = ?
         WHERE task_id = (
             SELECT task_id FROM task_queue
             WHERE status = 'QUEUED' AND run_after <= ? AND attempts < max_attempts
             ORDER BY task_id
             LIMIT 1
         )
         RETURNING task_id, kind, payload, attempts, max_attempts",
    )
    .bind(lease_expires.to_rfc3339())
    .bind(now.to_rfc3339())
    .fetch_optional(db)
    .await?;

    Ok(row.and_then(|(task_id, kind, payload, attempts, max_attempts)| {
        let kind = match TaskKind::parse(&kind) {
            Some(kind) => kind,
            None => {
                tracing::error!(task_id, kind, "Unknown task kind, leaving RUNNING to expire");
                return None;
            }
        };
        Some(ClaimedTask {
            task_id,
            kind,
            payload,
            attempts,
            max_attempts,
        })
    }))
}

/// Return expired RUNNING tasks to QUEUED (at-least-once redelivery).
/// A lease that expires on the final allowed attempt dead-letters instead,
/// so a worker crashing mid-run cannot redeliver a task forever.
pub async fn reclaim_expired(db: &SqlitePool) -> Result<u64> {
    let now = Utc::now().to_rfc3339();

    let dead = sqlx::query(
        "UPDATE task_queue
         SET status = 'DEAD', lease_expires_at = NULL,
             last_error = 'lease expired on final attempt'
         WHERE status = 'RUNNING' AND lease_expires_at < ? AND attempts >= max_attempts",
    )
    .bind(&now)
    .execute(db)
    .await?;
    if dead.rows_affected() > 0 {
        tracing::warn!(
            count = dead.rows_affected(),
            "Dead-lettered expired tasks past their attempt bound"
        );
    }

    let result = sqlx::query(
        "UPDATE task_queue
         SET status = 'QUEUED', lease_expires_at = NULL
         WHERE status = 'RUNNING' AND lease_expires_at < ?",
    )
    .bind(&now)
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}

/// Mark a task done
pub async fn complete(db: &SqlitePool, task_id: i64) -> Result<()> {
    sqlx::query("UPDATE task_queue SET status = 'DONE', lease_expires_at = NULL WHERE task_id = ?")
        .bind(task_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Requeue a failed task with a backoff delay, persisting the attempt bound
/// the handler was run under so redelivery honors the same limit
pub async fn retry_later(
    db: &SqlitePool,
    task_id: i64,
    delay_secs: i64,
    error: &str,
    max_attempts: i64,
) -> Result<()> {
    let run_after = Utc::now() + Duration::seconds(delay_secs);
    sqlx::query(
        "UPDATE task_queue
         SET status = 'QUEUED', lease_expires_at = NULL, run_after = ?,
             last_error = ?, max_attempts = ?
         WHERE task_id = ?",
    )
    .bind(run_after.to_rfc3339())
    .bind(error)
    .bind(max_attempts)
    .bind(task_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Dead-letter a task that ran out of attempts or failed fatally
pub async fn dead_letter(db: &SqlitePool, task_id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE task_queue
         SET status = 'DEAD', lease_expires_at = NULL, last_error = ?
         WHERE task_id = ?",
    )
    .bind(error)
    .bind(task_id)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackeco_common::db::create_schema;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn claim_returns_oldest_runnable() {
        let pool = test_pool().await;
        let first = enqueue(
            &pool,
            TaskKind::SyncSearch,
            &SyncSearchTask { user_id: "u1".into() },
            3,
        )
        .await
        .unwrap();
        enqueue(
            &pool,
            TaskKind::SyncSearch,
            &SyncSearchTask { user_id: "u2".into() },
            3,
        )
        .await
        .unwrap();

        let claimed = claim_next(&pool, 60).await.unwrap().unwrap();
        assert_eq!(claimed.task_id, first);
        assert_eq!(claimed.kind, TaskKind::SyncSearch);
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn claimed_task_not_claimable_again() {
        let pool = test_pool().await;
        enqueue(
            &pool,
            TaskKind::SyncSearch,
            &SyncSearchTask { user_id: "u1".into() },
            3,
        )
        .await
        .unwrap();

        assert!(claim_next(&pool, 60).await.unwrap().is_some());
        assert!(claim_next(&pool, 60).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn future_tasks_wait_for_run_after() {
        let pool = test_pool().await;
        enqueue_after(
            &pool,
            TaskKind::SyncSearch,
            &SyncSearchTask { user_id: "u1".into() },
            3,
            Utc::now() + Duration::seconds(3600),
        )
        .await
        .unwrap();

        assert!(claim_next(&pool, 60).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_redelivers() {
        let pool = test_pool().await;
        enqueue(
            &pool,
            TaskKind::SyncSearch,
            &SyncSearchTask { user_id: "u1".into() },
            3,
        )
        .await
        .unwrap();

        // Zero-length lease expires immediately
        let claimed = claim_next(&pool, -1).await.unwrap().unwrap();
        assert!(claim_next(&pool, 60).await.unwrap().is_none());

        assert_eq!(reclaim_expired(&pool).await.unwrap(), 1);
        let redelivered = claim_next(&pool, 60).await.unwrap().unwrap();
        assert_eq!(redelivered.task_id, claimed.task_id);
        assert_eq!(redelivered.attempts, 2);
    }

    #[tokio::test]
    async fn lease_expiry_on_final_attempt_dead_letters() {
        let pool = test_pool().await;
        let task_id = enqueue(
            &pool,
            TaskKind::SyncSearch,
            &SyncSearchTask { user_id: "u1".into() },
            1,
        )
        .await
        .unwrap();

        // The only allowed attempt is spent by a worker that never settles
        claim_next(&pool, -1).await.unwrap().unwrap();
        assert_eq!(reclaim_expired(&pool).await.unwrap(), 0);

        assert!(claim_next(&pool, 60).await.unwrap().is_none());
        let (status, last_error): (String, Option<String>) =
            sqlx::query_as("SELECT status, last_error FROM task_queue WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "DEAD");
        assert!(last_error.unwrap().contains("lease expired"));
    }

    #[tokio::test]
    async fn retry_then_exhaustion() {
        let pool = test_pool().await;
        enqueue(
            &pool,
            TaskKind::SyncSearch,
            &SyncSearchTask { user_id: "u1".into() },
            2,
        )
        .await
        .unwrap();

        let t1 = claim_next(&pool, 60).await.unwrap().unwrap();
        assert!(t1.attempts < t1.max_attempts);
        retry_later(&pool, t1.task_id, 0, "boom", t1.max_attempts)
            .await
            .unwrap();

        let t2 = claim_next(&pool, 60).await.unwrap().unwrap();
        assert_eq!(t2.attempts, 2);
        assert_eq!(t2.attempts, t2.max_attempts);
        dead_letter(&pool, t2.task_id, "boom").await.unwrap();

        assert!(claim_next(&pool, 60).await.unwrap().is_none());
        let (status,): (String,) =
            sqlx::query_as("SELECT status FROM task_queue WHERE task_id = ?")
                .bind(t2.task_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "DEAD");
    }
}
