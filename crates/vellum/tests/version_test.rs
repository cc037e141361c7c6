//! Version monotonicity and optimistic concurrency.

use serde_json::json;

use vellum::{
    CollectionConfig, Database, FieldDefinition, Schema, SchemaNode, UpdateOperators, VellumError,
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn counter_schema() -> Schema {
    Schema::object([
        ("name", SchemaNode::String),
        ("count", SchemaNode::Integer),
    ])
}

async fn counters(db: &Database) -> vellum::Collection {
    db.collection(
        CollectionConfig::new("counters", counter_schema())
            .field("count", FieldDefinition::integer()),
    )
    .await
    .unwrap()
}

// ═════════════════════════════════════════════════════════════════════════════
// Version monotonicity across every mutating operation
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn version_increments_across_insert_put_atomic_upsert() {
    let db = Database::open_in_memory().await.unwrap();
    let col = counters(&db).await;

    let stored = col
        .insert(json!({"name": "a", "count": 0}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap().to_string();
    assert_eq!(stored["_version"], json!(1));

    let updated = col.put(&id, json!({"count": 1})).await.unwrap();
    assert_eq!(updated["_version"], json!(2));

    let bumped = col
        .atomic_update(&id, UpdateOperators::default().inc("count", 2))
        .await
        .unwrap();
    assert_eq!(bumped["_version"], json!(3));
    assert_eq!(bumped["count"], json!(3));

    let upserted = col
        .upsert(&id, json!({"name": "a", "count": 3}))
        .await
        .unwrap();
    assert_eq!(upserted["_version"], json!(4));
}

#[tokio::test]
async fn upsert_is_idempotent_on_content_but_bumps_version() {
    let db = Database::open_in_memory().await.unwrap();
    let col = counters(&db).await;

    let doc = json!({"name": "same", "count": 7});
    let first = col.upsert("u1", doc.clone()).await.unwrap();
    assert_eq!(first["_version"], json!(1));

    for expected_version in 2..=4 {
        let again = col.upsert("u1", doc.clone()).await.unwrap();
        assert_eq!(again["_version"], json!(expected_version));
        assert_eq!(again["count"], json!(7));
        assert_eq!(again["name"], json!("same"));
    }
    assert_eq!(col.count().await.unwrap(), 1);
}

// ═════════════════════════════════════════════════════════════════════════════
// Optimistic conflicts
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stale_put_raises_version_mismatch() {
    let db = Database::open_in_memory().await.unwrap();
    let col = counters(&db).await;

    let stored = col
        .insert(json!({"name": "a", "count": 0}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap().to_string();
    col.put(&id, json!({"count": 1})).await.unwrap(); // now v2

    // Writer A lands first.
    let winner = col.put_with_version(&id, json!({"count": 5}), 2).await.unwrap();
    assert_eq!(winner["_version"], json!(3));

    // Writer B still believes v2.
    let err = col
        .put_with_version(&id, json!({"count": 6}), 2)
        .await
        .unwrap_err();
    match err {
        VellumError::VersionMismatch { expected, actual, .. } => {
            assert_eq!(expected, 2);
            assert_eq!(actual, 3);
        }
        other => panic!("expected VersionMismatch, got {other}"),
    }

    let current = col.find_by_id(&id).await.unwrap().unwrap();
    assert_eq!(current["count"], json!(5));
    assert_eq!(current["_version"], json!(3));
}

#[tokio::test]
async fn atomic_update_with_stale_version_classifies_mismatch() {
    let db = Database::open_in_memory().await.unwrap();
    let col = counters(&db).await;

    let stored = col
        .insert(json!({"name": "a", "count": 0}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap().to_string();
    col.atomic_update(&id, UpdateOperators::default().inc("count", 1))
        .await
        .unwrap(); // v2

    let err = col
        .atomic_update_with_version(&id, UpdateOperators::default().inc("count", 1), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VellumError::VersionMismatch { expected: 1, actual: 2, .. }
    ));
}

#[tokio::test]
async fn atomic_update_on_missing_document_is_not_found() {
    let db = Database::open_in_memory().await.unwrap();
    let col = counters(&db).await;

    let err = col
        .atomic_update("ghost", UpdateOperators::default().inc("count", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, VellumError::NotFound { .. }));
}

#[tokio::test]
async fn put_on_missing_document_is_not_found() {
    let db = Database::open_in_memory().await.unwrap();
    let col = counters(&db).await;

    let err = col.put("ghost", json!({"count": 1})).await.unwrap_err();
    assert!(matches!(err, VellumError::NotFound { .. }));
}

#[tokio::test]
async fn inc_rejects_non_numeric_operand() {
    let db = Database::open_in_memory().await.unwrap();
    let col = counters(&db).await;

    let stored = col
        .insert(json!({"name": "a", "count": 0}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap();

    let err = col
        .atomic_update(id, UpdateOperators::default().inc("count", "one"))
        .await
        .unwrap_err();
    assert!(matches!(err, VellumError::Validation(_)));
}
