//! Response interpreter
//!
//! The provider returns untrusted free text expected to contain exactly one
//! JSON object. Extraction strategies are tried in order, first success
//! wins:
//!   1. direct parse after stripping markdown fences
//!   2. regex extraction of the outermost `{...}` span
//!   3. truncation to first `{` .. last `}`
//! If none succeed the job fails terminally as a content error.
//!
//! A successfully parsed result then passes the low-confidence gate: results
//! whose component scores cannot plausibly support the reported final score
//! are downgraded to a zero-effect "no action" result with an error string.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{info, warn};

/// One challenge update reported by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeUpdate {
    #[serde(default)]
    pub challenge_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
}

/// Normalized classification result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiResult {
    pub base_score: i64,
    pub effort_score: i64,
    pub creativity_score: i64,
    pub penalty_points: i64,
    pub final_score: i64,
    pub suggestion: Option<String>,
    pub challenge_updates: Vec<ChallengeUpdate>,
    pub error: Option<String>,
}

impl AiResult {
    /// An explicit provider-reported error is a valid zero-effect success
    pub fn is_zero_effect(&self) -> bool {
        self.error.is_some()
    }

    /// Map of challengeId → reported increment, for the team aggregator
    pub fn progress_updates(&self) -> std::collections::HashMap<String, i64> {
        self.challenge_updates
            .iter()
            .filter_map(|u| u.progress.map(|p| (u.challenge_id.clone(), p)))
            .collect()
    }
}

/// Unparsable content; terminal, never retried
#[derive(Debug, Error)]
#[error("Could not extract JSON from AI response: {attempts}")]
pub struct ContentError {
    pub attempts: String,
}

/// Which extraction strategy produced the parse (logged, also useful in tests)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Direct,
    RegexSpan,
    BraceTruncation,
}

/// Interpreted response ready for the ledger
#[derive(Debug, Clone)]
pub struct Interpretation {
    pub result: AiResult,
    /// Canonical JSON stored on the job record
    pub stored_json: String,
    pub strategy: ParseStrategy,
    /// True when the low-confidence gate rewrote the result
    pub overridden: bool,
}

/// Parse and normalize one raw provider response
pub fn interpret(raw: &str) -> Result<Interpretation, ContentError> {
    let (mut result, strategy) = extract(raw)?;
    info!(?strategy, final_score = result.final_score, "Parsed AI response");

    let mut overridden = false;
    if result.error.is_none() && is_low_confidence(&result) {
        warn!(
            base = result.base_score,
            effort = result.effort_score,
            creativity = result.creativity_score,
            penalty = result.penalty_points,
            final_score = result.final_score,
            "Overriding low-confidence AI result"
        );
        result = zero_effect_override();
        overridden = true;
    }

    let stored_json = serde_json::to_string(&result)
        .map_err(|e| ContentError { attempts: format!("re-serialization failed: {}", e) })?;

    Ok(Interpretation {
        result,
        stored_json,
        strategy,
        overridden,
    })
}

fn extract(raw: &str) -> Result<(AiResult, ParseStrategy), ContentError> {
    let mut attempts = Vec::new();

    // Strategy 1: direct parse after stripping fence markers
    let stripped = strip_fences(raw);
    match serde_json::from_str::<AiResult>(stripped) {
        Ok(result) => return Ok((result, ParseStrategy::Direct)),
        Err(e) => attempts.push(format!("direct: {}", e)),
    }

    // Strategy 2: outermost {...} span via regex
    if let Some(span) = outer_object_regex().find(raw) {
        match serde_json::from_str::<AiResult>(span.as_str()) {
            Ok(result) => return Ok((result, ParseStrategy::RegexSpan)),
            Err(e) => attempts.push(format!("regex span: {}", e)),
        }
    } else {
        attempts.push("regex span: no object found".to_string());
    }

    // Strategy 3: truncate to first '{' .. last '}'
    if let Some(truncated) = brace_truncate(stripped) {
        match serde_json::from_str::<AiResult>(truncated) {
            Ok(result) => return Ok((result, ParseStrategy::BraceTruncation)),
            Err(e) => attempts.push(format!("brace truncation: {}", e)),
        }
    } else {
        attempts.push("brace truncation: no braces".to_string());
    }

    Err(ContentError {
        attempts: attempts.join("; "),
    })
}

fn outer_object_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[\s\S]*\}").expect("valid regex"))
}

/// Remove leading/trailing ```json / ``` fence markers
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim()
}

fn brace_truncate(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&s[start..=end])
}

/// Scores that cannot plausibly support the reported final score
fn is_low_confidence(result: &AiResult) -> bool {
    let component_sum = result.base_score + result.effort_score + result.creativity_score;
    let near_zero_components = result.base_score <= 1
        && result.effort_score <= 1
        && result.creativity_score <= 1;

    (near_zero_components && result.final_score > 0)
        || (result.penalty_points >= 5 && result.final_score <= 2)
        || ((component_sum - result.final_score).abs() > 5)
        || (result.final_score <= 2 && component_sum >= 10)
}

fn zero_effect_override() -> AiResult {
    AiResult {
        error: Some("No significant eco-friendly action was detected.".to_string()),
        ..AiResult::default()
    }
}
