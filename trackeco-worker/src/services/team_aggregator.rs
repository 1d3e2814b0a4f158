//! Team-challenge aggregator
//!
//! Runs once per job, only after the personal ledger has committed, and
//! deliberately outside that transaction: personal and team state are
//! eventually consistent, not atomically consistent, trading strictness for
//! reduced contention. Evaluation is strictly sequential over the user's
//! active team challenges and stops after the first completion in a pass to
//! bound per-job work.

use crate::queue::{self, AwardPointsTask, TaskKind};
use sqlx::SqlitePool;
use std::collections::HashMap;
use trackeco_common::db::models::{TeamChallenge, TeamMemberState, TeamStatus};
use trackeco_common::Result;
use tracing::{info, warn};

const PAYOUT_TASK_MAX_ATTEMPTS: i64 = 3;

/// Advance the user's team challenges with this job's progress updates
pub async fn process(
    db: &SqlitePool,
    user_id: &str,
    progress_updates: &HashMap<String, i64>,
) -> Result<()> {
    if progress_updates.is_empty() {
        return Ok(());
    }

    let active_team_ids = load_active_team_ids(db, user_id).await?;
    for team_id in active_team_ids {
        let completed = advance_team(db, &team_id, progress_updates).await?;
        if let Some(team) = completed {
            info!(team_id = %team.team_id, "Team challenge completed");
            pay_out(db, &team).await?;
            // Only the first completion in a pass triggers payout
            break;
        }
    }
    Ok(())
}

async fn load_active_team_ids(db: &SqlitePool, user_id: &str) -> Result<Vec<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT active_team_challenges FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(db)
            .await?;
    match row {
        Some((json,)) => Ok(serde_json::from_str(&json)?),
        None => Ok(Vec::new()),
    }
}

/// Independent transaction: re-read the team row, add the increment if its
/// base challenge was progressed by this job, mark completed on goal.
/// Returns the team data only when this call completed it.
async fn advance_team(
    db: &SqlitePool,
    team_id: &str,
    progress_updates: &HashMap<String, i64>,
) -> Result<Option<TeamChallenge>> {
    let mut tx = db.begin().await?;

    let row: Option<(String, String, String, i64, i64, String, i64)> = sqlx::query_as(
        "SELECT original_challenge_id, description, members, current_progress,
                progress_goal, status, bonus_points
         FROM team_challenges WHERE team_id = ?",
    )
    .bind(team_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((original_challenge_id, description, members_json, current_progress, progress_goal, status, bonus_points)) =
        row
    else {
        tx.commit().await?;
        return Ok(None);
    };

    let status = TeamStatus::parse(&status).unwrap_or(TeamStatus::Pending);
    let Some(increment) = progress_updates.get(&original_challenge_id) else {
        tx.commit().await?;
        return Ok(None);
    };
    if status != TeamStatus::Active {
        tx.commit().await?;
        return Ok(None);
    }

    let new_progress = current_progress + increment;
    let completed = new_progress >= progress_goal;
    let new_status = if completed { TeamStatus::Completed } else { status };

    sqlx::query("UPDATE team_challenges SET current_progress = ?, status = ? WHERE team_id = ?")
        .bind(new_progress)
        .bind(new_status.as_str())
        .bind(team_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    if !completed {
        return Ok(None);
    }

    // A malformed members map must surface, not silently forfeit the payout
    let members: HashMap<String, TeamMemberState> = serde_json::from_str(&members_json)?;
    Ok(Some(TeamChallenge {
        team_id: team_id.to_string(),
        original_challenge_id,
        description,
        members,
        current_progress: new_progress,
        progress_goal,
        status: TeamStatus::Completed,
        bonus_points,
    }))
}

/// Split the pooled bonus among accepted members and detach the challenge
/// from their active lists. Integer division; the remainder is forfeited.
async fn pay_out(db: &SqlitePool, team: &TeamChallenge) -> Result<()> {
    let accepted = team.accepted_members();
    if accepted.is_empty() {
        warn!(team_id = %team.team_id, "Completed team challenge has no accepted members");
        return Ok(());
    }

    let share = team.bonus_points / accepted.len() as i64;
    let reason = format!("Team Challenge '{}'", team.description);

    for member_id in &accepted {
        queue::enqueue(
            db,
            TaskKind::AwardPoints,
            &AwardPointsTask {
                user_id: member_id.to_string(),
                amount: share,
                reason: reason.clone(),
            },
            PAYOUT_TASK_MAX_ATTEMPTS,
        )
        .await?;
        remove_from_active_list(db, member_id, &team.team_id).await?;
    }

    info!(
        team_id = %team.team_id,
        members = accepted.len(),
        share,
        "Dispatched team payout"
    );
    Ok(())
}

/// Read-modify-write of one member's JSON active list
async fn remove_from_active_list(db: &SqlitePool, user_id: &str, team_id: &str) -> Result<()> {
    let mut tx = db.begin().await?;
    let row: Option<(String,)> =
        sqlx::query_as("SELECT active_team_challenges FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
    if let Some((json,)) = row {
        let mut ids: Vec<String> = serde_json::from_str(&json)?;
        ids.retain(|id| id != team_id);
        sqlx::query("UPDATE users SET active_team_challenges = ? WHERE user_id = ?")
            .bind(serde_json::to_string(&ids)?)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}
