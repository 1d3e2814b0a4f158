//! Gamification ledger transaction
//!
//! One atomic read-modify-write across the user row and the job row: score,
//! challenge bonuses, streak, first-upload flag and the job's COMPLETED
//! state all commit together. No partially-applied ledger state is ever
//! observable. Referral rewards are deliberately NOT part of the write set:
//! the referrer id is captured here and dispatched as an independent task
//! after commit, so this transaction never touches an unrelated user row.

use crate::services::interpreter::AiResult;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use trackeco_common::db::models::{Challenge, ChallengeKind, JobStatus};
use trackeco_common::time::{classify_day_gap, DayGap};
use trackeco_common::Result;
use tracing::{info, warn};

/// Inputs of one ledger application
pub struct LedgerInput<'a> {
    pub job_id: &'a str,
    pub user_id: &'a str,
    pub result: &'a AiResult,
    /// Canonical JSON stored on the job record
    pub stored_json: &'a str,
    /// Snapshot of all active challenges for this job
    pub challenges: &'a [Challenge],
    pub now: DateTime<Utc>,
    pub utc_offset_hours: i32,
}

/// What the committed transaction changed
#[derive(Debug, Clone, Default)]
pub struct LedgerOutcome {
    /// False when the user no longer exists (job still finalized, audit only)
    pub user_found: bool,
    /// finalScore + challenge bonuses added to totalPoints
    pub points_awarded: i64,
    pub newly_completed: Vec<String>,
    pub new_streak: i64,
    /// Referrer to reward after commit, set only on the first-ever completed job
    pub referrer_to_reward: Option<String>,
}

/// Apply a scorable result and finalize the job, atomically
pub async fn apply(db: &SqlitePool, input: LedgerInput<'_>) -> Result<LedgerOutcome> {
    let mut tx = db.begin().await?;

    let user: Option<(i64, i64, i64, Option<String>, String, String, Option<String>, i64)> =
        sqlx::query_as(
            "SELECT total_points, current_streak, max_streak, last_streak_at,
                    completed_challenge_ids, challenge_progress, referred_by,
                    has_completed_first_upload
             FROM users WHERE user_id = ?",
        )
        .bind(input.user_id)
        .fetch_optional(&mut *tx)
        .await?;

    let Some((
        total_points,
        current_streak,
        max_streak,
        last_streak_at,
        completed_json,
        progress_json,
        referred_by,
        first_upload_flag,
    )) = user
    else {
        // Audit-only finalization: the job completes, the ledger is untouched
        warn!(
            job_id = input.job_id,
            user_id = input.user_id,
            "User no longer exists, finalizing job without ledger mutation"
        );
        finalize_job(&mut tx, input.job_id, input.stored_json).await?;
        tx.commit().await?;
        return Ok(LedgerOutcome::default());
    };

    let mut completed: HashSet<String> =
        serde_json::from_str::<Vec<String>>(&completed_json)?.into_iter().collect();
    let mut progress: HashMap<String, i64> = serde_json::from_str(&progress_json)?;

    let challenge_map: HashMap<&str, &Challenge> = input
        .challenges
        .iter()
        .map(|c| (c.challenge_id.as_str(), c))
        .collect();

    // Challenge credits: simple challenges complete outright, progress
    // challenges accumulate and pay out when the goal is met
    let mut bonus_points = 0i64;
    let mut newly_completed: Vec<String> = Vec::new();
    for update in &input.result.challenge_updates {
        let id = update.challenge_id.as_str();
        if id.is_empty() || completed.contains(id) {
            continue;
        }
        let Some(challenge) = challenge_map.get(id) else {
            continue;
        };

        match (challenge.kind, challenge.progress_goal) {
            (ChallengeKind::Simple, None) if update.is_completed == Some(true) => {
                bonus_points += challenge.bonus_points;
                newly_completed.push(id.to_string());
            }
            (ChallengeKind::Progress, Some(goal)) => {
                let Some(increment) = update.progress else {
                    continue;
                };
                let new_progress = progress.get(id).copied().unwrap_or(0) + increment;
                if new_progress >= goal {
                    bonus_points += challenge.bonus_points;
                    newly_completed.push(id.to_string());
                    progress.remove(id);
                } else {
                    progress.insert(id.to_string(), new_progress);
                }
            }
            _ => {}
        }
    }
    completed.extend(newly_completed.iter().cloned());

    // Streak counts daily activity, not points: every run reaching this step
    // stamps the activity timestamp, zero-score runs included
    let previous = last_streak_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let new_streak = match previous {
        None => 1,
        Some(prev) => match classify_day_gap(prev, input.now, input.utc_offset_hours) {
            DayGap::SameDay => current_streak,
            DayGap::Consecutive => current_streak + 1,
            DayGap::Broken => 1,
        },
    };
    let new_max_streak = max_streak.max(new_streak);

    // totalPoints is monotonic non-negative here; a hostile negative final
    // score must not drain the ledger
    let points_awarded = input.result.final_score.max(0) + bonus_points;

    let is_first_upload = first_upload_flag == 0;
    let referrer_to_reward = if is_first_upload { referred_by } else { None };

    let completed_list: Vec<&String> = {
        let mut list: Vec<&String> = completed.iter().collect();
        list.sort();
        list
    };

    sqlx::query(
        "UPDATE users
         SET total_points = ?, current_streak = ?, max_streak = ?,
             last_streak_at = ?, completed_challenge_ids = ?,
             challenge_progress = ?, has_completed_first_upload = 1
         WHERE user_id = ?",
    )
    .bind(total_points + points_awarded)
    .bind(new_streak)
    .bind(new_max_streak)
    .bind(input.now.to_rfc3339())
    .bind(serde_json::to_string(&completed_list)?)
    .bind(serde_json::to_string(&progress)?)
    .bind(input.user_id)
    .execute(&mut *tx)
    .await?;

    finalize_job(&mut tx, input.job_id, input.stored_json).await?;
    tx.commit().await?;

    info!(
        job_id = input.job_id,
        user_id = input.user_id,
        points = points_awarded,
        streak = new_streak,
        completed = newly_completed.len(),
        "Ledger committed"
    );

    Ok(LedgerOutcome {
        user_found: true,
        points_awarded,
        newly_completed,
        new_streak,
        referrer_to_reward,
    })
}

/// Finalize a zero-effect job (explicit provider error or low-confidence
/// override): the result is stored and the job completes, the user row is
/// never read or written.
pub async fn finalize_zero_effect(db: &SqlitePool, job_id: &str, stored_json: &str) -> Result<()> {
    let mut tx = db.begin().await?;
    finalize_job(&mut tx, job_id, stored_json).await?;
    tx.commit().await?;
    info!(job_id, "Job finalized with zero-effect result");
    Ok(())
}

async fn finalize_job(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    job_id: &str,
    stored_json: &str,
) -> Result<()> {
    sqlx::query("UPDATE upload_jobs SET status = ?, ai_result = ? WHERE job_id = ?")
        .bind(JobStatus::Completed.as_str())
        .bind(stored_json)
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Active challenge snapshot for this job
pub async fn load_active_challenges(db: &SqlitePool) -> Result<Vec<Challenge>> {
    let rows: Vec<(String, String, String, i64, Option<i64>)> = sqlx::query_as(
        "SELECT challenge_id, kind, description, bonus_points, progress_goal
         FROM challenges WHERE is_active = 1",
    )
    .fetch_all(db)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(challenge_id, kind, description, bonus_points, progress_goal)| Challenge {
            challenge_id,
            kind: match kind.as_str() {
                "progress" => ChallengeKind::Progress,
                _ => ChallengeKind::Simple,
            },
            description,
            bonus_points,
            progress_goal,
            is_active: true,
        })
        .collect())
}

/// Challenge ids the user has already completed (excluded from the prompt)
pub async fn load_completed_ids(db: &SqlitePool, user_id: &str) -> Result<HashSet<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT completed_challenge_ids FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(db)
            .await?;
    match row {
        Some((json,)) => {
            let ids: Vec<String> = serde_json::from_str(&json)?;
            Ok(ids.into_iter().collect())
        }
        None => Ok(HashSet::new()),
    }
}
