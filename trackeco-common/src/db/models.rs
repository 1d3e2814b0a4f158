//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upload job lifecycle. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    PendingAnalysis,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::PendingAnalysis => "PENDING_ANALYSIS",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_ANALYSIS" => Some(JobStatus::PendingAnalysis),
            "PROCESSING" => Some(JobStatus::Processing),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One queued verification request for a single uploaded media item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub job_id: String,
    pub user_id: String,
    pub source_path: String,
    pub status: JobStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub ai_result: Option<String>,
    pub error_message: Option<String>,
    pub fcm_token: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Challenge kind: one-shot completion vs. counted progress toward a goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    Simple,
    Progress,
}

/// Read-only challenge definition, snapshotted per job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub challenge_id: String,
    pub kind: ChallengeKind,
    #[serde(default)]
    pub description: String,
    pub bonus_points: i64,
    /// None for simple challenges
    pub progress_goal: Option<i64>,
    #[serde(default)]
    pub is_active: bool,
}

/// Membership state within a team challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamMemberState {
    Pending,
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamStatus {
    Pending,
    Active,
    Completed,
}

impl TeamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamStatus::Pending => "pending",
            TeamStatus::Active => "active",
            TeamStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TeamStatus::Pending),
            "active" => Some(TeamStatus::Active),
            "completed" => Some(TeamStatus::Completed),
            _ => None,
        }
    }
}

/// Shared goal tracked across multiple users with a pooled, split reward
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamChallenge {
    pub team_id: String,
    pub original_challenge_id: String,
    pub description: String,
    pub members: HashMap<String, TeamMemberState>,
    pub current_progress: i64,
    pub progress_goal: i64,
    pub status: TeamStatus,
    pub bonus_points: i64,
}

impl TeamChallenge {
    /// Members who accepted the invite; only these share the payout
    pub fn accepted_members(&self) -> Vec<&str> {
        let mut members: Vec<&str> = self
            .members
            .iter()
            .filter(|(_, state)| **state == TeamMemberState::Accepted)
            .map(|(id, _)| id.as_str())
            .collect();
        members.sort();
        members
    }
}
