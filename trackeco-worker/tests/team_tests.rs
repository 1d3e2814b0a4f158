//! Integration tests for the team-challenge aggregator

use sqlx::SqlitePool;
use std::collections::HashMap;
use trackeco_common::db::create_schema;
use trackeco_worker::services::team_aggregator;

async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    create_schema(&pool).await.unwrap();
    pool
}

async fn insert_user(pool: &SqlitePool, user_id: &str, active_teams: &[&str]) {
    sqlx::query("INSERT INTO users (user_id, active_team_challenges) VALUES (?, ?)")
        .bind(user_id)
        .bind(serde_json::to_string(active_teams).unwrap())
        .execute(pool)
        .await
        .unwrap();
}

#[allow(clippy::too_many_arguments)]
async fn insert_team(
    pool: &SqlitePool,
    team_id: &str,
    challenge_id: &str,
    members: &[(&str, &str)],
    progress: i64,
    goal: i64,
    status: &str,
    bonus: i64,
) {
    let members: HashMap<&str, &str> = members.iter().copied().collect();
    sqlx::query(
        "INSERT INTO team_challenges
         (team_id, original_challenge_id, description, members, current_progress,
          progress_goal, status, bonus_points)
         VALUES (?, ?, 'Clean the park', ?, ?, ?, ?, ?)",
    )
    .bind(team_id)
    .bind(challenge_id)
    .bind(serde_json::to_string(&members).unwrap())
    .bind(progress)
    .bind(goal)
    .bind(status)
    .bind(bonus)
    .execute(pool)
    .await
    .unwrap();
}

async fn team_state(pool: &SqlitePool, team_id: &str) -> (i64, String) {
    sqlx::query_as("SELECT current_progress, status FROM team_challenges WHERE team_id = ?")
        .bind(team_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn award_tasks(pool: &SqlitePool) -> Vec<(String, i64)> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT payload FROM task_queue WHERE kind = 'award_points' ORDER BY task_id",
    )
    .fetch_all(pool)
    .await
    .unwrap();
    rows.iter()
        .map(|(payload,)| {
            let value: serde_json::Value = serde_json::from_str(payload).unwrap();
            (
                value["userId"].as_str().unwrap().to_string(),
                value["amount"].as_i64().unwrap(),
            )
        })
        .collect()
}

fn updates(challenge_id: &str, increment: i64) -> HashMap<String, i64> {
    HashMap::from([(challenge_id.to_string(), increment)])
}

#[tokio::test]
async fn below_goal_increments_progress_only() {
    let pool = test_pool().await;
    insert_user(&pool, "u1", &["t1"]).await;
    insert_team(&pool, "t1", "collect-litter", &[("u1", "accepted")], 2, 10, "active", 100).await;

    team_aggregator::process(&pool, "u1", &updates("collect-litter", 3))
        .await
        .unwrap();

    let (progress, status) = team_state(&pool, "t1").await;
    assert_eq!(progress, 5);
    assert_eq!(status, "active");
    assert!(award_tasks(&pool).await.is_empty());
}

#[tokio::test]
async fn payout_splits_evenly_among_accepted_members_only() {
    let pool = test_pool().await;
    insert_user(&pool, "u1", &["t1"]).await;
    insert_user(&pool, "u2", &["t1"]).await;
    insert_user(&pool, "u3", &["t1"]).await;
    insert_user(&pool, "late", &["t1"]).await;
    insert_team(
        &pool,
        "t1",
        "collect-litter",
        &[
            ("u1", "accepted"),
            ("u2", "accepted"),
            ("u3", "accepted"),
            ("late", "pending"),
        ],
        9,
        10,
        "active",
        100,
    )
    .await;

    team_aggregator::process(&pool, "u1", &updates("collect-litter", 1))
        .await
        .unwrap();

    let (_, status) = team_state(&pool, "t1").await;
    assert_eq!(status, "completed");

    // 100 / 3 accepted members = 33 each, remainder forfeited; the pending
    // member receives nothing
    let tasks = award_tasks(&pool).await;
    assert_eq!(tasks.len(), 3);
    for (user, amount) in &tasks {
        assert_eq!(*amount, 33);
        assert_ne!(user, "late");
    }

    // Paid members no longer list the team as active
    for user in ["u1", "u2", "u3"] {
        let (active,): (String,) =
            sqlx::query_as("SELECT active_team_challenges FROM users WHERE user_id = ?")
                .bind(user)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(active, "[]");
    }
}

#[tokio::test]
async fn non_matching_challenge_leaves_team_untouched() {
    let pool = test_pool().await;
    insert_user(&pool, "u1", &["t1"]).await;
    insert_team(&pool, "t1", "collect-litter", &[("u1", "accepted")], 2, 10, "active", 100).await;

    team_aggregator::process(&pool, "u1", &updates("some-other-challenge", 5))
        .await
        .unwrap();

    let (progress, status) = team_state(&pool, "t1").await;
    assert_eq!(progress, 2);
    assert_eq!(status, "active");
}

#[tokio::test]
async fn inactive_team_is_not_progressed() {
    let pool = test_pool().await;
    insert_user(&pool, "u1", &["t1"]).await;
    insert_team(&pool, "t1", "collect-litter", &[("u1", "accepted")], 0, 10, "pending", 100).await;

    team_aggregator::process(&pool, "u1", &updates("collect-litter", 4))
        .await
        .unwrap();

    let (progress, status) = team_state(&pool, "t1").await;
    assert_eq!(progress, 0);
    assert_eq!(status, "pending");
}

#[tokio::test]
async fn only_first_completion_in_a_pass_pays_out() {
    let pool = test_pool().await;
    insert_user(&pool, "u1", &["t1", "t2"]).await;
    insert_team(&pool, "t1", "collect-litter", &[("u1", "accepted")], 9, 10, "active", 50).await;
    insert_team(&pool, "t2", "collect-litter", &[("u1", "accepted")], 9, 10, "active", 80).await;

    team_aggregator::process(&pool, "u1", &updates("collect-litter", 1))
        .await
        .unwrap();

    // First team in list order completes and pays; evaluation stops there
    let (_, first_status) = team_state(&pool, "t1").await;
    assert_eq!(first_status, "completed");
    let (second_progress, second_status) = team_state(&pool, "t2").await;
    assert_eq!(second_progress, 9);
    assert_eq!(second_status, "active");

    let tasks = award_tasks(&pool).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0], ("u1".to_string(), 50));
}

#[tokio::test]
async fn completion_with_no_accepted_members_pays_nobody() {
    let pool = test_pool().await;
    insert_user(&pool, "u1", &["t1"]).await;
    insert_team(&pool, "t1", "collect-litter", &[("u1", "pending")], 9, 10, "active", 100).await;

    team_aggregator::process(&pool, "u1", &updates("collect-litter", 1))
        .await
        .unwrap();

    let (_, status) = team_state(&pool, "t1").await;
    assert_eq!(status, "completed");
    assert!(award_tasks(&pool).await.is_empty());
}

#[tokio::test]
async fn corrupt_members_map_surfaces_as_error() {
    let pool = test_pool().await;
    insert_user(&pool, "u1", &["t1"]).await;
    sqlx::query(
        "INSERT INTO team_challenges
         (team_id, original_challenge_id, description, members, current_progress,
          progress_goal, status, bonus_points)
         VALUES ('t1', 'collect-litter', 'Clean the park', 'not json', 9, 10, 'active', 100)",
    )
    .execute(&pool)
    .await
    .unwrap();

    // The payout must not be silently forfeited over a corrupt members map
    let result = team_aggregator::process(&pool, "u1", &updates("collect-litter", 1)).await;
    assert!(result.is_err());
    assert!(award_tasks(&pool).await.is_empty());
}

#[tokio::test]
async fn empty_updates_are_a_no_op() {
    let pool = test_pool().await;
    insert_user(&pool, "u1", &["t1"]).await;
    insert_team(&pool, "t1", "collect-litter", &[("u1", "accepted")], 2, 10, "active", 100).await;

    team_aggregator::process(&pool, "u1", &HashMap::new())
        .await
        .unwrap();

    let (progress, _) = team_state(&pool, "t1").await;
    assert_eq!(progress, 2);
}
