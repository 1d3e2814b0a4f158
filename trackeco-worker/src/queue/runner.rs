//! Task-queue runner harness
//!
//! A pool of worker tasks polls the queue and dispatches claimed tasks to
//! their handlers. Jobs for different uploads run fully in parallel; the
//! runner imposes no ordering of its own.
//!
//! Failure policy per claimed task:
//! - handler Ok            → DONE
//! - Retryable, attempts left → back to QUEUED after a growing delay
//! - Retryable, exhausted  → task-kind failure hook, then DEAD
//! - Fatal                 → failure hook, then DEAD

use crate::queue::{self, ClaimedTask, TaskError, TaskKind};
use crate::services::{points, search};
use crate::{pipeline, WorkerContext};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Spawn the worker pool and block until cancellation
pub async fn run(ctx: WorkerContext, shutdown: CancellationToken) {
    let concurrency = ctx.config.worker.concurrency;
    info!(concurrency, "Starting queue runner");

    let mut workers = Vec::with_capacity(concurrency);
    for worker_id in 0..concurrency {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(worker_loop(worker_id, ctx, shutdown)));
    }

    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker task panicked: {}", e);
        }
    }
    info!("Queue runner stopped");
}

async fn worker_loop(worker_id: usize, ctx: WorkerContext, shutdown: CancellationToken) {
    let idle_sleep = Duration::from_millis(ctx.config.worker.idle_poll_ms);

    while !shutdown.is_cancelled() {
        // Worker 0 doubles as the lease sweeper
        if worker_id == 0 {
            match queue::reclaim_expired(&ctx.db).await {
                Ok(0) => {}
                Ok(n) => warn!(reclaimed = n, "Redelivering tasks with expired leases"),
                Err(e) => error!("Lease reclaim failed: {}", e),
            }
        }

        let claimed = match queue::claim_next(&ctx.db, ctx.config.worker.lease_secs).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!("Queue claim failed: {}", e);
                None
            }
        };

        match claimed {
            Some(task) => execute(&ctx, task).await,
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle_sleep) => {}
                }
            }
        }
    }
}

/// Run one claimed task through its handler and settle the queue row
async fn execute(ctx: &WorkerContext, task: ClaimedTask) {
    let task_id = task.task_id;
    let kind = task.kind;
    info!(task_id, kind = kind.as_str(), attempt = task.attempts, "Task start");

    let outcome = dispatch(ctx, &task).await;
    let max_attempts = effective_max_attempts(ctx, &task);

    let settle = match outcome {
        Ok(()) => {
            info!(task_id, kind = kind.as_str(), "Task done");
            queue::complete(&ctx.db, task_id).await
        }
        Err(TaskError::Retryable(reason)) if task.attempts < max_attempts => {
            let delay = ctx.config.worker.retry_delay_secs * task.attempts;
            warn!(task_id, kind = kind.as_str(), delay, "Task failed, will retry: {}", reason);
            queue::retry_later(&ctx.db, task_id, delay, &reason, max_attempts).await
        }
        Err(err) => {
            let reason = err.to_string();
            error!(task_id, kind = kind.as_str(), "Task failed permanently: {}", reason);
            on_permanent_failure(ctx, &task, &reason).await;
            queue::dead_letter(&ctx.db, task_id, &reason).await
        }
    };

    if let Err(e) = settle {
        // The lease will expire and the task will be delivered again
        error!(task_id, "Failed to settle task state: {}", e);
    }
}

/// Attempt bound for a claimed task. Analyze tasks are enqueued by the
/// upload collaborator, so their bound is this worker's configuration, not
/// whatever the producer put on the row; other kinds keep the row's bound.
fn effective_max_attempts(ctx: &WorkerContext, task: &ClaimedTask) -> i64 {
    match task.kind {
        TaskKind::AnalyzeUpload => ctx.config.worker.analyze_max_attempts,
        _ => task.max_attempts,
    }
}

async fn dispatch(ctx: &WorkerContext, task: &ClaimedTask) -> Result<(), TaskError> {
    match task.kind {
        TaskKind::AnalyzeUpload => {
            let payload = task
                .payload_as()
                .map_err(|e| TaskError::Fatal(format!("Bad analyze payload: {}", e)))?;
            pipeline::run_analysis(ctx, &payload).await
        }
        TaskKind::AwardPoints => {
            let payload = task
                .payload_as()
                .map_err(|e| TaskError::Fatal(format!("Bad award payload: {}", e)))?;
            points::handle(ctx, &payload).await
        }
        TaskKind::SyncSearch => {
            let payload = task
                .payload_as()
                .map_err(|e| TaskError::Fatal(format!("Bad sync payload: {}", e)))?;
            search::handle(ctx, &payload).await
        }
    }
}

/// Task-kind-specific cleanup once no further attempts will happen
async fn on_permanent_failure(ctx: &WorkerContext, task: &ClaimedTask, reason: &str) {
    if task.kind != TaskKind::AnalyzeUpload {
        return;
    }
    match task.payload_as::<queue::AnalyzeUploadTask>() {
        Ok(payload) => pipeline::fail_job_terminal(ctx, &payload, reason).await,
        Err(e) => error!(task_id = task.task_id, "Cannot parse payload for cleanup: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::AnalyzeUploadTask;
    use sqlx::SqlitePool;
    use trackeco_common::config::Config;
    use trackeco_common::db::create_schema;

    async fn context(media_root: &std::path::Path, analyze_max_attempts: i64) -> WorkerContext {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let mut config = Config::default();
        config.media_root = media_root.to_path_buf();
        config.worker.analyze_max_attempts = analyze_max_attempts;
        WorkerContext::new(pool, config)
    }

    async fn seed_analyze_job(ctx: &WorkerContext, media_root: &std::path::Path, row_max: i64) {
        sqlx::query(
            "INSERT INTO upload_jobs (job_id, user_id, source_path, status)
             VALUES ('j1', 'u1', 'incoming/clip.mp4', 'PENDING_ANALYSIS')",
        )
        .execute(&ctx.db)
        .await
        .unwrap();
        let incoming = media_root.join("incoming");
        tokio::fs::create_dir_all(&incoming).await.unwrap();
        tokio::fs::write(incoming.join("clip.mp4"), b"video bytes").await.unwrap();

        queue::enqueue(
            &ctx.db,
            TaskKind::AnalyzeUpload,
            &AnalyzeUploadTask {
                job_id: "j1".to_string(),
                source_path: "incoming/clip.mp4".to_string(),
                owner_user_id: "u1".to_string(),
            },
            row_max,
        )
        .await
        .unwrap();
    }

    async fn task_row(ctx: &WorkerContext) -> (String, i64) {
        sqlx::query_as("SELECT status, max_attempts FROM task_queue")
            .fetch_one(&ctx.db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn analyze_attempt_bound_comes_from_config_not_row() {
        let dir = tempfile::tempdir().unwrap();
        // Row allows 5 attempts, configuration allows 1
        let ctx = context(dir.path(), 1).await;
        seed_analyze_job(&ctx, dir.path(), 5).await;

        // No credentials configured, so the handler fails retryably; the
        // configured bound is already spent on this first attempt
        let claimed = queue::claim_next(&ctx.db, 60).await.unwrap().unwrap();
        execute(&ctx, claimed).await;

        let (status, _) = task_row(&ctx).await;
        assert_eq!(status, "DEAD");
        let (job_status,): (String,) =
            sqlx::query_as("SELECT status FROM upload_jobs WHERE job_id = 'j1'")
                .fetch_one(&ctx.db)
                .await
                .unwrap();
        assert_eq!(job_status, "FAILED");
    }

    #[tokio::test]
    async fn analyze_retry_refreshes_row_bound_from_config() {
        let dir = tempfile::tempdir().unwrap();
        // Row allows a single attempt, configuration allows 4
        let ctx = context(dir.path(), 4).await;
        seed_analyze_job(&ctx, dir.path(), 1).await;

        let claimed = queue::claim_next(&ctx.db, 60).await.unwrap().unwrap();
        execute(&ctx, claimed).await;

        // Requeued, and the row bound now matches the configuration so the
        // claim filter will hand the task out again
        let (status, max_attempts) = task_row(&ctx).await;
        assert_eq!(status, "QUEUED");
        assert_eq!(max_attempts, 4);
    }
}
