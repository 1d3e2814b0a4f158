//! Side-effect dispatcher: push notifications
//!
//! On every terminal job state the owner's device gets a data-only push
//! message carrying the job's full current state flattened into a string
//! map. Delivery is strictly best-effort: failures are logged, never
//! retried, and never fail the job.

use crate::WorkerContext;
use std::collections::HashMap;
use trackeco_common::db::models::UploadJob;
use tracing::{debug, info, warn};

/// Send the terminal-state notification for a job. Never fails.
pub async fn notify_job_state(ctx: &WorkerContext, job: &UploadJob) {
    let Some(push_url) = ctx.config.endpoints.push_url.as_deref() else {
        debug!(job_id = %job.job_id, "Push endpoint not configured, skipping notification");
        return;
    };
    let Some(token) = job.fcm_token.as_deref() else {
        debug!(job_id = %job.job_id, "Job has no device token, skipping notification");
        return;
    };

    let payload = serde_json::json!({
        "message": {
            "token": token,
            "data": flatten_job(job),
            "android": { "priority": "high" }
        }
    });

    match ctx.http.post(push_url).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {
            info!(job_id = %job.job_id, "Sent push notification");
        }
        Ok(response) => {
            warn!(job_id = %job.job_id, status = %response.status(), "Push notification rejected");
        }
        Err(e) => {
            warn!(job_id = %job.job_id, "Push notification failed: {}", e);
        }
    }
}

/// Flatten the job record into the string map the client expects; unset
/// fields are omitted rather than sent as empty strings
pub fn flatten_job(job: &UploadJob) -> HashMap<String, String> {
    let mut data = HashMap::new();
    data.insert("jobId".to_string(), job.job_id.clone());
    data.insert("userId".to_string(), job.user_id.clone());
    data.insert("sourcePath".to_string(), job.source_path.clone());
    data.insert("status".to_string(), job.status.as_str().to_string());
    if let Some(at) = job.processed_at {
        data.insert("processedAt".to_string(), at.to_rfc3339());
    }
    if let Some(result) = &job.ai_result {
        data.insert("aiResult".to_string(), result.clone());
    }
    if let Some(error) = &job.error_message {
        data.insert("errorMessage".to_string(), error.clone());
    }
    if let Some(at) = job.created_at {
        data.insert("createdAt".to_string(), at.to_rfc3339());
    }
    data
}
