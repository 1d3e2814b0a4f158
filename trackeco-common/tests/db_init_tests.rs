//! Database initialization tests

use trackeco_common::db::{create_schema, get_setting, init_database, set_setting};

#[tokio::test]
async fn database_is_created_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data").join("trackeco.db");
    assert!(!db_path.exists());

    let pool = init_database(&db_path).await.unwrap();
    assert!(db_path.exists(), "Database file was not created");

    // All tables are present and empty
    for table in ["users", "upload_jobs", "challenges", "team_challenges", "task_queue", "settings"] {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0, "Table {} is not empty", table);
    }
}

#[tokio::test]
async fn existing_database_is_reopened_without_data_loss() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("trackeco.db");

    let pool = init_database(&db_path).await.unwrap();
    sqlx::query("INSERT INTO users (user_id, total_points) VALUES ('u1', 42)")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    // Reopening re-runs the idempotent schema setup
    let pool = init_database(&db_path).await.unwrap();
    let points: i64 = sqlx::query_scalar("SELECT total_points FROM users WHERE user_id = 'u1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(points, 42);
}

#[tokio::test]
async fn schema_creation_is_idempotent() {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    create_schema(&pool).await.unwrap();
    create_schema(&pool).await.unwrap();
}

#[tokio::test]
async fn settings_round_trip_and_upsert() {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    create_schema(&pool).await.unwrap();

    assert_eq!(get_setting(&pool, "cursor").await.unwrap(), None);

    set_setting(&pool, "cursor", "1").await.unwrap();
    assert_eq!(get_setting(&pool, "cursor").await.unwrap(), Some("1".to_string()));

    set_setting(&pool, "cursor", "2").await.unwrap();
    assert_eq!(get_setting(&pool, "cursor").await.unwrap(), Some("2".to_string()));
}
