//! Decoupled point-award task handler
//!
//! `AwardPoints {userId, amount, reason}` is the independent ledger
//! increment used for referral rewards and team payouts. It touches a
//! single user row and deliberately knows nothing about the job that
//! produced it.

use crate::queue::{self, AwardPointsTask, SyncSearchTask, TaskError, TaskKind};
use crate::WorkerContext;
use tracing::{info, warn};

const SYNC_TASK_MAX_ATTEMPTS: i64 = 3;

pub async fn handle(ctx: &WorkerContext, task: &AwardPointsTask) -> Result<(), TaskError> {
    let result = sqlx::query("UPDATE users SET total_points = total_points + ? WHERE user_id = ?")
        .bind(task.amount.max(0))
        .bind(&task.user_id)
        .execute(&ctx.db)
        .await
        .map_err(|e| TaskError::Retryable(format!("award update: {}", e)))?;

    if result.rows_affected() == 0 {
        // User deleted since the award was dispatched; nothing to credit
        warn!(user_id = %task.user_id, reason = %task.reason, "Award target no longer exists");
        return Ok(());
    }

    info!(
        user_id = %task.user_id,
        amount = task.amount,
        reason = %task.reason,
        "Awarded bonus points"
    );

    queue::enqueue(
        &ctx.db,
        TaskKind::SyncSearch,
        &SyncSearchTask {
            user_id: task.user_id.clone(),
        },
        SYNC_TASK_MAX_ATTEMPTS,
    )
    .await
    .map_err(|e| TaskError::Retryable(format!("sync enqueue: {}", e)))?;

    Ok(())
}
