//! Analyze pipeline
//!
//! One claimed job runs strictly sequentially: claim → infer → interpret →
//! ledger → team aggregate → side effects → storage move. Jobs for
//! different uploads run fully in parallel; duplicates of the same upload
//! are short-circuited by the claim guard.
//!
//! Failure routing:
//! - transient infra errors release the claim and surface as retryable, so
//!   the queue re-runs the whole pipeline; on attempt exhaustion the runner
//!   calls [`fail_job_terminal`]
//! - content errors (unparsable response) fail the job immediately and move
//!   the media aside for manual inspection
//! - a crash between claim and ledger commit leaves the job in PROCESSING;
//!   that window is a known gap and is not self-healed here

use crate::queue::{self, AnalyzeUploadTask, AwardPointsTask, SyncSearchTask, TaskError, TaskKind};
use crate::services::{
    gemini_client::mime_type_for, interpreter, job_guard, job_guard::ClaimOutcome, ledger,
    ledger::LedgerInput, notifier, prompt, team_aggregator, CredentialPool, GeminiClient,
    MediaStore,
};
use crate::WorkerContext;
use chrono::Utc;
use tracing::{error, info, warn};

const REFERRAL_BONUS_POINTS: i64 = 50;
const REFERRAL_REASON: &str = "Successful Referral";
const SIDE_TASK_MAX_ATTEMPTS: i64 = 3;

/// Run the full verification pipeline for one queued analyze task
pub async fn run_analysis(ctx: &WorkerContext, task: &AnalyzeUploadTask) -> Result<(), TaskError> {
    let job_id = task.job_id.as_str();
    info!(job_id, user_id = %task.owner_user_id, "Analyze start");

    match job_guard::claim(&ctx.db, job_id, Utc::now())
        .await
        .map_err(|e| TaskError::Retryable(format!("claim: {}", e)))?
    {
        ClaimOutcome::Claimed => {}
        ClaimOutcome::Skipped => return Ok(()),
    }

    // From here on the claim is held: retryable exits must release it so a
    // later delivery can pass the guard again.
    match analyze_claimed(ctx, task).await {
        Ok(()) => Ok(()),
        Err(AnalysisError::Retryable(reason)) => {
            if let Err(e) = job_guard::release(&ctx.db, job_id).await {
                error!(job_id, "Could not release claim: {}", e);
            }
            Err(TaskError::Retryable(reason))
        }
        Err(AnalysisError::Content(reason)) => {
            // Terminal, never retried: fail the job and park the media
            warn!(job_id, "Content error, failing job: {}", reason);
            fail_job_terminal(ctx, task, &reason).await;
            Ok(())
        }
    }
}

/// Internal failure routing for a held claim
enum AnalysisError {
    Retryable(String),
    Content(String),
}

impl From<trackeco_common::Error> for AnalysisError {
    fn from(e: trackeco_common::Error) -> Self {
        AnalysisError::Retryable(e.to_string())
    }
}

async fn analyze_claimed(ctx: &WorkerContext, task: &AnalyzeUploadTask) -> Result<(), AnalysisError> {
    let job_id = task.job_id.as_str();
    let user_id = task.owner_user_id.as_str();
    let store = MediaStore::new(&ctx.config.media_root);

    // Snapshot challenges; already-completed ones stay out of the prompt but
    // remain in the ledger snapshot for duplicate-update filtering
    let active_challenges = ledger::load_active_challenges(&ctx.db).await?;
    let completed_ids = ledger::load_completed_ids(&ctx.db, user_id).await?;
    let prompt_challenges: Vec<_> = active_challenges
        .iter()
        .filter(|c| !completed_ids.contains(&c.challenge_id))
        .cloned()
        .collect();
    let prompt_text = prompt::build_prompt(&prompt_challenges);

    let media = match store.read(&task.source_path).await {
        Ok(bytes) => bytes,
        Err(trackeco_common::Error::NotFound(msg)) => {
            // The object will not appear on retry; fail terminally
            return Err(AnalysisError::Content(msg));
        }
        Err(e) => return Err(e.into()),
    };
    let mime_type = mime_type_for(&task.source_path);

    // Credential failover wraps the whole provider round trip
    let pool = CredentialPool::new(ctx.db.clone(), ctx.config.gemini.api_keys.clone());
    let client = GeminiClient::new(
        ctx.http.clone(),
        ctx.config.gemini.base_url.clone(),
        ctx.config.gemini.model.clone(),
        ctx.config.gemini.poll_interval_secs,
        ctx.config.gemini.poll_budget_secs,
    );
    let response_text = pool
        .run_with_rotation(|_, key| {
            let client = client.clone();
            let media = media.clone();
            let prompt_text = prompt_text.clone();
            async move { client.analyze(&key, media, mime_type, &prompt_text).await }
        })
        .await
        .map_err(|e| AnalysisError::Retryable(e.to_string()))?;

    let interpretation = interpreter::interpret(&response_text)
        .map_err(|e| AnalysisError::Content(e.to_string()))?;

    if interpretation.result.is_zero_effect() {
        // Valid no-action result: store it, complete the job, skip the ledger
        ledger::finalize_zero_effect(&ctx.db, job_id, &interpretation.stored_json).await?;
    } else {
        let outcome = ledger::apply(
            &ctx.db,
            LedgerInput {
                job_id,
                user_id,
                result: &interpretation.result,
                stored_json: &interpretation.stored_json,
                challenges: &active_challenges,
                now: Utc::now(),
                utc_offset_hours: ctx.config.worker.utc_offset_hours,
            },
        )
        .await?;

        // Post-commit follow-ups. The job is already terminal, so failures
        // here are logged and swallowed: a retry could no longer reach them.
        if outcome.user_found {
            dispatch_post_commit(ctx, task, &interpretation.result, &outcome).await;
        }
    }

    finish_terminal(ctx, &store, job_id, &task.source_path, true).await;
    info!(job_id, "Analyze done");
    Ok(())
}

async fn dispatch_post_commit(
    ctx: &WorkerContext,
    task: &AnalyzeUploadTask,
    result: &interpreter::AiResult,
    outcome: &ledger::LedgerOutcome,
) {
    let user_id = task.owner_user_id.clone();

    if let Err(e) = queue::enqueue(
        &ctx.db,
        TaskKind::SyncSearch,
        &SyncSearchTask { user_id: user_id.clone() },
        SIDE_TASK_MAX_ATTEMPTS,
    )
    .await
    {
        error!(job_id = %task.job_id, "Could not enqueue search sync: {}", e);
    }

    if let Some(referrer) = &outcome.referrer_to_reward {
        if let Err(e) = queue::enqueue(
            &ctx.db,
            TaskKind::AwardPoints,
            &AwardPointsTask {
                user_id: referrer.clone(),
                amount: REFERRAL_BONUS_POINTS,
                reason: REFERRAL_REASON.to_string(),
            },
            SIDE_TASK_MAX_ATTEMPTS,
        )
        .await
        {
            error!(job_id = %task.job_id, "Could not enqueue referral award: {}", e);
        } else {
            info!(referrer = %referrer, "Dispatched referral reward for first completed upload");
        }
    }

    if let Err(e) =
        team_aggregator::process(&ctx.db, &user_id, &result.progress_updates()).await
    {
        // Team state is eventually consistent with the personal ledger
        error!(job_id = %task.job_id, "Team aggregation failed: {}", e);
    }
}

/// Terminal cleanup once no further attempts will happen: job FAILED, media
/// parked in the failed area, owner notified. Used for content errors and by
/// the runner when retries are exhausted.
pub async fn fail_job_terminal(ctx: &WorkerContext, task: &AnalyzeUploadTask, reason: &str) {
    match job_guard::mark_failed(&ctx.db, &task.job_id, reason).await {
        Ok(true) => info!(job_id = %task.job_id, "Job marked FAILED"),
        Ok(false) => {
            // Already terminal; leave the record and media alone
            warn!(job_id = %task.job_id, "Job already terminal, skipping failure cleanup");
            return;
        }
        Err(e) => error!(job_id = %task.job_id, "Could not mark job FAILED: {}", e),
    }

    let store = MediaStore::new(&ctx.config.media_root);
    finish_terminal(ctx, &store, &task.job_id, &task.source_path, false).await;
}

/// Shared tail of every terminal transition: notify, then move the media.
/// Both are best-effort; the job's terminal state is already durable.
async fn finish_terminal(
    ctx: &WorkerContext,
    store: &MediaStore,
    job_id: &str,
    source_path: &str,
    success: bool,
) {
    match job_guard::load_job(&ctx.db, job_id).await {
        Ok(Some(job)) => notifier::notify_job_state(ctx, &job).await,
        Ok(None) => warn!(job_id, "Job row vanished before notification"),
        Err(e) => error!(job_id, "Could not load job for notification: {}", e),
    }

    if success {
        if let Err(e) = store.move_to_processed(source_path).await {
            warn!(job_id, "Could not move media to processed area: {}", e);
        }
    } else {
        store.try_move_to_failed(source_path).await;
    }
}
