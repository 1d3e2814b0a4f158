//! Search reindex task handler
//!
//! Pushes a summary of one user row to the external search index. The
//! trigger is fire-and-forget from the pipeline's perspective; delivery
//! reliability comes from the queue's bounded retries.

use crate::queue::{SyncSearchTask, TaskError};
use crate::WorkerContext;
use tracing::{debug, info};

pub async fn handle(ctx: &WorkerContext, task: &SyncSearchTask) -> Result<(), TaskError> {
    let Some(search_url) = ctx.config.endpoints.search_url.as_deref() else {
        debug!(user_id = %task.user_id, "Search endpoint not configured, skipping reindex");
        return Ok(());
    };

    let row: Option<(i64, i64, i64)> = sqlx::query_as(
        "SELECT total_points, current_streak, max_streak FROM users WHERE user_id = ?",
    )
    .bind(&task.user_id)
    .fetch_optional(&ctx.db)
    .await
    .map_err(|e| TaskError::Retryable(format!("user read: {}", e)))?;

    let Some((total_points, current_streak, max_streak)) = row else {
        debug!(user_id = %task.user_id, "User gone, nothing to reindex");
        return Ok(());
    };

    let payload = serde_json::json!({
        "userId": task.user_id,
        "totalPoints": total_points,
        "currentStreak": current_streak,
        "maxStreak": max_streak,
    });

    let response = ctx
        .http
        .post(search_url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| TaskError::Retryable(format!("search post: {}", e)))?;

    if !response.status().is_success() {
        return Err(TaskError::Retryable(format!(
            "search endpoint returned {}",
            response.status()
        )));
    }

    info!(user_id = %task.user_id, "Synced user to search index");
    Ok(())
}
