//! Engine behaviour against the in-memory backend
//!
//! Covers the happy paths: applying, reverting, stepping, resetting and the
//! read-only operations.

#![cfg(feature = "memory")]

mod common;

use common::Fixture;
use elif_migrate::{Dialect, MigrateError, MigrationDirection, VersionRecord, DEFAULT_MIGRATIONS_TABLE};

#[tokio::test]
async fn test_create_users_up_and_down() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add(
        100,
        "create_users",
        "CREATE TABLE users (id BIGINT PRIMARY KEY, email TEXT NOT NULL);",
        "DROP TABLE users;",
    );
    let mut engine = fixture.engine();

    let result = engine.up().await.unwrap();
    assert_eq!(result.version, VersionRecord::clean(100));
    assert_eq!(result.applied_count(), 1);
    assert_eq!(result.steps[0].name, "create_users");
    assert!(result.warnings.is_empty());
    assert!(fixture.driver.has_table("users"));
    assert_eq!(fixture.driver.version_row(DEFAULT_MIGRATIONS_TABLE), Some(VersionRecord::clean(100)));

    let result = engine.down(1).await.unwrap();
    assert_eq!(result.version, VersionRecord::nil());
    assert_eq!(result.rolled_back_count(), 1);
    assert!(!fixture.driver.has_table("users"));
    assert_eq!(fixture.driver.version_row(DEFAULT_MIGRATIONS_TABLE), Some(VersionRecord::nil()));
}

#[tokio::test]
async fn test_dirty_flag_is_written_before_each_script() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users").add_table(200, "posts");
    let mut engine = fixture.engine();

    engine.up().await.unwrap();

    assert_eq!(
        fixture.driver.version_writes(),
        vec![
            VersionRecord::nil(),
            VersionRecord::in_progress(100),
            VersionRecord::clean(100),
            VersionRecord::in_progress(200),
            VersionRecord::clean(200),
        ]
    );
    assert_eq!(fixture.driver.executed_scripts().len(), 2);
}

#[tokio::test]
async fn test_up_converges_to_latest_version() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users").add_table(200, "posts");
    let mut engine = fixture.engine();

    assert_eq!(engine.up().await.unwrap().version, VersionRecord::clean(200));

    // A newer migration shows up later; only it runs
    fixture.add_table(300, "comments");
    let result = engine.up().await.unwrap();
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].version, 300);
    assert_eq!(result.version, VersionRecord::clean(300));
    assert_eq!(fixture.driver.tables(), vec!["comments", "posts", "users"]);
}

#[tokio::test]
async fn test_repeated_up_is_a_noop() {
    let fixture = Fixture::new(Dialect::MySql);
    fixture.add_table(100, "users");
    let mut engine = fixture.engine();

    engine.up().await.unwrap();
    let scripts_after_first = fixture.driver.executed_scripts().len();

    let result = engine.up().await.unwrap();
    assert!(result.is_noop());
    assert_eq!(result.version, VersionRecord::clean(100));
    assert_eq!(fixture.driver.executed_scripts().len(), scripts_after_first);
}

#[tokio::test]
async fn test_down_then_up_restores_version() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users").add_table(200, "posts").add_table(300, "comments");
    let mut engine = fixture.engine();
    engine.up().await.unwrap();

    let result = engine.down(1).await.unwrap();
    assert_eq!(result.version, VersionRecord::clean(200));
    assert!(!fixture.driver.has_table("comments"));

    let result = engine.up().await.unwrap();
    assert_eq!(result.version, VersionRecord::clean(300));
    assert!(fixture.driver.has_table("comments"));
}

#[tokio::test]
async fn test_down_reverts_most_recent_first() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users").add_table(200, "posts").add_table(300, "comments");
    let mut engine = fixture.engine();
    engine.up().await.unwrap();

    let result = engine.down(2).await.unwrap();
    let reverted: Vec<u64> = result.steps.iter().map(|step| step.version).collect();
    assert_eq!(reverted, vec![300, 200]);
    assert!(result.steps.iter().all(|step| step.direction == MigrationDirection::Down));
    assert_eq!(result.version, VersionRecord::clean(100));

    let result = engine.down(-1).await.unwrap();
    assert_eq!(result.rolled_back_count(), 1);
    assert_eq!(result.version, VersionRecord::nil());
    assert!(fixture.driver.tables().is_empty());

    // Nothing left to revert
    assert!(engine.down(-1).await.unwrap().is_noop());
}

#[tokio::test]
async fn test_reset_runs_down_then_up() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users").add_table(200, "posts");
    let mut engine = fixture.engine();
    engine.up().await.unwrap();

    let result = engine.reset().await.unwrap();
    let order: Vec<(u64, MigrationDirection)> = result.steps.iter().map(|step| (step.version, step.direction)).collect();
    assert_eq!(
        order,
        vec![
            (200, MigrationDirection::Down),
            (100, MigrationDirection::Down),
            (100, MigrationDirection::Up),
            (200, MigrationDirection::Up),
        ]
    );
    assert_eq!(result.version, VersionRecord::clean(200));
    assert_eq!(fixture.driver.tables(), vec!["posts", "users"]);

    // Reset is repeatable and lands in the same place
    let again = engine.reset().await.unwrap();
    assert_eq!(again.version, result.version);
    assert_eq!(fixture.driver.tables(), vec!["posts", "users"]);
}

#[tokio::test]
async fn test_reset_on_fresh_database_applies_everything() {
    let fixture = Fixture::new(Dialect::MySql);
    fixture.add_table(100, "users").add_table(200, "posts");
    let mut engine = fixture.engine();

    let result = engine.reset().await.unwrap();
    assert_eq!(result.applied_count(), 2);
    assert_eq!(result.rolled_back_count(), 0);
    assert_eq!(result.version, VersionRecord::clean(200));
}

#[tokio::test]
async fn test_steps_moves_at_most_n_versions() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users").add_table(200, "posts").add_table(300, "comments");
    let mut engine = fixture.engine();

    assert_eq!(engine.steps(2).await.unwrap().version, VersionRecord::clean(200));

    // Asking for more than is pending applies what there is
    let result = engine.steps(5).await.unwrap();
    assert_eq!(result.applied_count(), 1);
    assert_eq!(result.version, VersionRecord::clean(300));

    assert_eq!(engine.steps(-1).await.unwrap().version, VersionRecord::clean(200));

    let result = engine.steps(-10).await.unwrap();
    assert_eq!(result.rolled_back_count(), 2);
    assert_eq!(result.version, VersionRecord::nil());
}

#[tokio::test]
async fn test_invalid_arguments() {
    let fixture = Fixture::new(Dialect::Postgres);
    let mut engine = fixture.engine();

    assert!(matches!(engine.down(0).await, Err(MigrateError::InvalidArgument(_))));
    assert!(matches!(engine.down(-5).await, Err(MigrateError::InvalidArgument(_))));
    assert!(matches!(engine.steps(0).await, Err(MigrateError::InvalidArgument(_))));
    assert!(matches!(engine.force(-2).await, Err(MigrateError::InvalidArgument(_))));
    assert!(fixture.driver.version_writes().is_empty());
}

#[tokio::test]
async fn test_current_does_not_create_control_table() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users");
    let mut engine = fixture.engine();

    assert_eq!(engine.current().await.unwrap(), VersionRecord::nil());
    assert!(fixture.driver.version_writes().is_empty());
    assert_eq!(fixture.driver.held_locks(), 0);
    assert_eq!(fixture.driver.open_connections(), 0);

    engine.up().await.unwrap();
    assert_eq!(engine.current().await.unwrap(), VersionRecord::clean(100));
}

#[tokio::test]
async fn test_status_lists_applied_and_pending() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users").add_table(200, "posts");
    fixture.add_up(300, "seed_data", "INSERT INTO users (id) VALUES (1);");
    let mut engine = fixture.engine();
    engine.steps(1).await.unwrap();

    let status = engine.status().await.unwrap();
    assert_eq!(status.current, VersionRecord::clean(100));

    let applied: Vec<(u64, bool)> = status.entries.iter().map(|entry| (entry.version, entry.applied)).collect();
    assert_eq!(applied, vec![(100, true), (200, false), (300, false)]);
    assert_eq!(status.pending().count(), 2);

    let seed = &status.entries[2];
    assert_eq!(seed.name, "seed_data");
    assert!(seed.has_up && !seed.has_down);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["current"]["version"], 100);
    assert_eq!(json["entries"][1]["name"], "create_posts");
}

#[tokio::test]
async fn test_only_matching_dialect_files_run() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users");
    std::fs::write(
        fixture.dir.path().join("200_create_posts.mysql.up.sql"),
        "CREATE TABLE posts (id BIGINT);",
    )
    .unwrap();
    std::fs::write(fixture.dir.path().join("README.md"), "not a migration").unwrap();
    let mut engine = fixture.engine();

    let result = engine.up().await.unwrap();
    assert_eq!(result.version, VersionRecord::clean(100));
    assert!(!fixture.driver.has_table("posts"));
}

#[tokio::test]
async fn test_custom_migrations_table() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add_table(100, "users");
    let mut engine = fixture.engine().with_migrations_table("app_schema_versions").unwrap();

    engine.up().await.unwrap();
    assert_eq!(fixture.driver.version_row("app_schema_versions"), Some(VersionRecord::clean(100)));
    assert_eq!(fixture.driver.version_row(DEFAULT_MIGRATIONS_TABLE), None);
}

#[tokio::test]
async fn test_comment_only_scripts_succeed() {
    let fixture = Fixture::new(Dialect::Postgres);
    fixture.add(100, "placeholder", "-- nothing to do yet\n", "-- nothing to undo\n");
    let mut engine = fixture.engine();

    assert_eq!(engine.up().await.unwrap().version, VersionRecord::clean(100));
    assert_eq!(engine.down(1).await.unwrap().version, VersionRecord::nil());
}

#[tokio::test]
async fn test_mysql_statements_keep_quoted_literals() {
    let fixture = Fixture::new(Dialect::MySql);
    fixture.add_table(100, "people");
    fixture.add(
        200,
        "seed_people",
        "INSERT INTO people (id, name) VALUES (1, 'O''Brien');\nINSERT INTO people (id, name) VALUES (2, 'it\\'s');\n",
        "DELETE FROM people WHERE name IN ('O''Brien', 'it\\'s');",
    );
    let mut engine = fixture.engine();

    assert_eq!(engine.up().await.unwrap().version, VersionRecord::clean(200));
    engine.down(1).await.unwrap();

    let statements = fixture.driver.executed_statements();
    assert_eq!(
        &statements[1..],
        [
            "INSERT INTO people (id, name) VALUES (1, 'O''Brien')",
            "INSERT INTO people (id, name) VALUES (2, 'it\\'s')",
            "DELETE FROM people WHERE name IN ('O''Brien', 'it\\'s')",
        ]
    );
}
