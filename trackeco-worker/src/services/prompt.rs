//! Fixed evaluation prompt
//!
//! The prompt is a constant template; the only dynamic content is the JSON
//! snapshot of the user's currently-incomplete active challenges, spliced
//! into `{active_challenges_placeholder}`.

use serde::Serialize;
use trackeco_common::db::models::{Challenge, ChallengeKind};

const ANALYSIS_PROMPT: &str = r#"<RoleAndGoal>
You are "Eco," an AI judge for the environmental app TrackEco. Analyze the
user's video, identify what is done to which objects, then score the action
against the rubric. Your entire output must be a single, raw JSON object
matching <OutputSchema>.
</RoleAndGoal>

<CoreDirectives>
1. Detect no action: if the video contains no discernible eco-friendly action,
   return an `error` message and a `finalScore` of 0. Do not invent an action.
2. Detect inauthentic actions: invalidate staged behavior (throwing clean
   trash to pick it up again, unplugging an idle device and replugging it).
   Return an `error` message and a `finalScore` of 0.
3. Base the evaluation only on actions visible in the video.
4. `challengeUpdates` may only contain challenges unambiguously completed or
   progressed; for progress challenges, count every qualifying item.
5. For invalid videos (too dark, off-screen, irrelevant) populate only the
   `error` field and zero everything else.
</CoreDirectives>

<ScoringRubric>
- baseScore (1-30): small/common items 1-5, medium/uncommon 10-20,
  large/rare/e-waste 20-30.
- effortScore (0-20): single simple action 1-5, multiple items or some
  preparation 6-14, significant physical effort 15-20.
- creativityScore (0-20): only for repurposing; 0 for standard disposal.
- penaltyPoints (0-30): carelessness 1-5, improper sorting 10-20, unsafe
  handling 20-30.
- finalScore = baseScore + effortScore + creativityScore - penaltyPoints,
  never below 0. Littering or missing the bin is always 0.
</ScoringRubric>

<InputData>
<ActiveChallenges>
{active_challenges_placeholder}
</ActiveChallenges>
</InputData>

<OutputSchema>
{
  "baseScore": <integer>,
  "effortScore": <integer>,
  "creativityScore": <integer>,
  "penaltyPoints": <integer>,
  "finalScore": <integer>,
  "suggestion": "<string | null>",
  "challengeUpdates": [{"challengeId": "<string>", "progress": <integer>} or
                       {"challengeId": "<string>", "isCompleted": true}],
  "error": "<string | null>"
}
</OutputSchema>"#;

/// Challenge fields exposed to the model
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeSnapshot<'a> {
    challenge_id: &'a str,
    kind: ChallengeKind,
    description: &'a str,
    bonus_points: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress_goal: Option<i64>,
}

/// Render the evaluation prompt with the user's incomplete active challenges
pub fn build_prompt(challenges: &[Challenge]) -> String {
    let snapshots: Vec<ChallengeSnapshot> = challenges
        .iter()
        .map(|c| ChallengeSnapshot {
            challenge_id: &c.challenge_id,
            kind: c.kind,
            description: &c.description,
            bonus_points: c.bonus_points,
            progress_goal: c.progress_goal,
        })
        .collect();
    let serialized = serde_json::to_string(&snapshots).unwrap_or_else(|_| "[]".to_string());
    ANALYSIS_PROMPT.replace("{active_challenges_placeholder}", &serialized)
}
