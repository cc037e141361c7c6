//! Migration runner: seeds on fresh collections, version-keyed upgrade
//! steps, diff-driven DDL, and retained initialization failures.

use serde_json::json;

use vellum::{
    CollectionConfig, Database, FieldDefinition, MigrationState, Schema, SchemaNode, SqlValue,
    VellumError,
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn task_schema() -> Schema {
    Schema::object([
        ("title", SchemaNode::String),
        ("done", SchemaNode::Boolean.optional()),
    ])
}

// ═════════════════════════════════════════════════════════════════════════════
// Seeds
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn seed_runs_once_on_fresh_collection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seeded.db").to_str().unwrap().to_string();

    {
        let db = Database::open(vellum::DatabaseOptions::at_path(&path))
            .await
            .unwrap();
        let col = db
            .collection(CollectionConfig::new("tasks", task_schema()).seed(|ctx| {
                ctx.insert(json!({"title": "first"}))?;
                ctx.insert(json!({"title": "second"}))?;
                Ok(())
            }))
            .await
            .unwrap();
        assert_eq!(col.count().await.unwrap(), 2);
        db.close().await.unwrap();
    }

    // Reopening must not seed again.
    let db = Database::open(vellum::DatabaseOptions::at_path(&path))
        .await
        .unwrap();
    let col = db
        .collection(CollectionConfig::new("tasks", task_schema()).seed(|ctx| {
            ctx.insert(json!({"title": "third"}))?;
            Ok(())
        }))
        .await
        .unwrap();
    assert_eq!(col.count().await.unwrap(), 2);
    db.close().await.unwrap();
}

#[tokio::test]
async fn failed_seed_rolls_back_and_is_retained() {
    let db = Database::open_in_memory().await.unwrap();
    let result = db
        .collection(CollectionConfig::new("tasks", task_schema()).seed(|ctx| {
            ctx.insert(json!({"title": "partial"}))?;
            Err(VellumError::validation("seed exploded"))
        }))
        .await;
    assert!(result.is_err());

    let retained = db.wait_for_initialization("tasks").await;
    assert!(matches!(retained, Err(VellumError::Migration(_))));

    let statuses = db.migration_status();
    assert_eq!(statuses.len(), 1);
    assert!(matches!(statuses[0].state, MigrationState::Failed(_)));
}

// ═════════════════════════════════════════════════════════════════════════════
// Upgrades
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn upgrade_steps_run_for_each_skipped_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upgrade.db").to_str().unwrap().to_string();

    {
        let db = Database::open(vellum::DatabaseOptions::at_path(&path))
            .await
            .unwrap();
        let col = db
            .collection(CollectionConfig::new("tasks", task_schema()))
            .await
            .unwrap();
        col.insert(json!({"title": "legacy"})).await.unwrap();
        db.close().await.unwrap();
    }

    let db = Database::open(vellum::DatabaseOptions::at_path(&path))
        .await
        .unwrap();
    let col = db
        .collection(
            CollectionConfig::new("tasks", task_schema())
                .version(3)
                .upgrade(2, |ctx| {
                    ctx.exec(
                        "UPDATE tasks SET doc = json_set(doc, '$.done', json('false'))",
                        &[],
                    )?;
                    Ok(())
                })
                .upgrade(3, |ctx| {
                    ctx.exec(
                        "UPDATE tasks SET doc = json_set(doc, '$.title', upper(json_extract(doc, '$.title')))",
                        &[],
                    )?;
                    Ok(())
                }),
        )
        .await
        .unwrap();

    let doc = col.query().first().await.unwrap().unwrap();
    assert_eq!(doc["title"], json!("LEGACY"));
    assert_eq!(doc["done"], json!(false));

    let statuses = db.migration_status();
    assert_eq!(statuses[0].from_version, 1);
    assert_eq!(statuses[0].to_version, 3);
    assert_eq!(statuses[0].state, MigrationState::Ready);
    db.close().await.unwrap();
}

#[tokio::test]
async fn conditional_upgrade_skips_when_condition_is_false() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cond.db").to_str().unwrap().to_string();

    {
        let db = Database::open(vellum::DatabaseOptions::at_path(&path))
            .await
            .unwrap();
        db.collection(CollectionConfig::new("tasks", task_schema()))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let db = Database::open(vellum::DatabaseOptions::at_path(&path))
        .await
        .unwrap();
    let col = db
        .collection(
            CollectionConfig::new("tasks", task_schema())
                .version(2)
                .upgrade_if(
                    2,
                    |ctx| {
                        let rows = ctx.query("SELECT COUNT(*) AS n FROM tasks", &[])?;
                        Ok(rows[0].integer("n").unwrap_or(0) > 0)
                    },
                    |ctx| {
                        ctx.insert(json!({"title": "should not appear"}))?;
                        Ok(())
                    },
                ),
        )
        .await
        .unwrap();
    assert_eq!(col.count().await.unwrap(), 0);
    db.close().await.unwrap();
}

#[tokio::test]
async fn downgrade_request_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("down.db").to_str().unwrap().to_string();

    {
        let db = Database::open(vellum::DatabaseOptions::at_path(&path))
            .await
            .unwrap();
        db.collection(CollectionConfig::new("tasks", task_schema()).version(3))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let db = Database::open(vellum::DatabaseOptions::at_path(&path))
        .await
        .unwrap();
    let err = db
        .collection(CollectionConfig::new("tasks", task_schema()).version(2))
        .await
        .unwrap_err();
    assert!(matches!(err, VellumError::Migration(_)));
    db.close().await.unwrap();
}

// ═════════════════════════════════════════════════════════════════════════════
// Diff-driven DDL
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn newly_constrained_field_gets_column_and_backfill() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("diff.db").to_str().unwrap().to_string();

    {
        let db = Database::open(vellum::DatabaseOptions::at_path(&path))
            .await
            .unwrap();
        let col = db
            .collection(CollectionConfig::new("tasks", task_schema()))
            .await
            .unwrap();
        col.insert(json!({"_id": "t1", "title": "existing"}))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let db = Database::open(vellum::DatabaseOptions::at_path(&path))
        .await
        .unwrap();
    db.collection(
        CollectionConfig::new("tasks", task_schema())
            .version(2)
            .field("title", FieldDefinition::text().indexed()),
    )
    .await
    .unwrap();

    let rows = db
        .query(
            "SELECT title FROM tasks WHERE _id = ?",
            &[SqlValue::Text("t1".to_string())],
        )
        .await
        .unwrap();
    assert_eq!(rows[0].text("title"), Some("existing"));

    let indexes = db
        .query(
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'index' AND name = 'idx_tasks_title'",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(indexes[0].integer("n"), Some(1));
    db.close().await.unwrap();
}

#[tokio::test]
async fn schema_version_rows_are_tracked_per_collection() {
    let db = Database::open_in_memory().await.unwrap();
    db.collection(CollectionConfig::new("tasks", task_schema()).version(4))
        .await
        .unwrap();

    let rows = db
        .query(
            "SELECT version FROM _schema_versions WHERE collection = 'tasks'",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows[0].integer("version"), Some(4));
}
