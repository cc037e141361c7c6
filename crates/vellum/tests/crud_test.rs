//! Document CRUD: id generation, round trips, schema validation,
//! constrained-column coherence, bulk atomicity, constraint mapping.

use serde_json::json;

use vellum::{
    CollectionConfig, Database, FieldDefinition, Schema, SchemaNode, SqlValue, VellumError,
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn product_schema() -> Schema {
    Schema::object([
        ("name", SchemaNode::String),
        ("price", SchemaNode::Number),
        ("active", SchemaNode::Boolean.optional()),
        ("meta", SchemaNode::Any.optional()),
    ])
}

async fn products(db: &Database) -> vellum::Collection {
    db.collection(
        CollectionConfig::new("products", product_schema())
            .field("price", FieldDefinition::real().indexed())
            .field("active", FieldDefinition::integer()),
    )
    .await
    .unwrap()
}

// ═════════════════════════════════════════════════════════════════════════════
// Round trips
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn insert_generates_id_and_version_one() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let stored = col
        .insert(json!({"name": "anvil", "price": 9.5}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap();
    assert!(!id.is_empty());
    assert_eq!(stored["_version"], json!(1));

    let found = col.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(found["name"], json!("anvil"));
    assert_eq!(found["price"], json!(9.5));
    assert_eq!(found["_version"], json!(1));
}

#[tokio::test]
async fn insert_honors_caller_supplied_id() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let stored = col
        .insert(json!({"_id": "p1", "name": "anvil", "price": 1.0}))
        .await
        .unwrap();
    assert_eq!(stored["_id"], json!("p1"));
    assert!(col.find_by_id("p1").await.unwrap().is_some());
}

#[tokio::test]
async fn insert_rejects_existing_id() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    col.insert(json!({"_id": "p1", "name": "a", "price": 1.0}))
        .await
        .unwrap();
    let err = col
        .insert(json!({"_id": "p1", "name": "b", "price": 2.0}))
        .await
        .unwrap_err();
    match err {
        VellumError::UniqueConstraint { field, id } => {
            assert_eq!(field, "_id");
            assert_eq!(id, "p1");
        }
        other => panic!("expected UniqueConstraint, got {other}"),
    }
}

#[tokio::test]
async fn insert_rejects_schema_mismatch() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let err = col
        .insert(json!({"name": "anvil", "price": "not a number"}))
        .await
        .unwrap_err();
    assert!(matches!(err, VellumError::Validation(_)));

    let err = col.insert(json!({"name": "anvil"})).await.unwrap_err();
    assert!(matches!(err, VellumError::Validation(_)));
}

#[tokio::test]
async fn find_by_id_returns_none_for_missing() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;
    assert!(col.find_by_id("nope").await.unwrap().is_none());
}

// ═════════════════════════════════════════════════════════════════════════════
// Constrained-column coherence
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn constrained_column_matches_document_after_insert() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let stored = col
        .insert(json!({"name": "anvil", "price": 9.5}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap();

    let rows = db
        .query(
            "SELECT price, json_extract(doc, '$.price') AS doc_price FROM products WHERE _id = ?",
            &[SqlValue::Text(id.to_string())],
        )
        .await
        .unwrap();
    assert_eq!(rows[0].real("price"), Some(9.5));
    assert_eq!(rows[0].real("doc_price"), Some(9.5));
}

#[tokio::test]
async fn atomic_set_keeps_column_and_document_in_sync() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let stored = col
        .insert(json!({"name": "anvil", "price": 9.5}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap();

    col.atomic_update(id, vellum::UpdateOperators::default().set("price", 12.0))
        .await
        .unwrap();

    let rows = db
        .query(
            "SELECT price, json_extract(doc, '$.price') AS doc_price FROM products WHERE _id = ?",
            &[SqlValue::Text(id.to_string())],
        )
        .await
        .unwrap();
    assert_eq!(rows[0].real("price"), Some(12.0));
    assert_eq!(rows[0].real("doc_price"), Some(12.0));
}

#[tokio::test]
async fn booleans_restore_from_integer_columns() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let stored = col
        .insert(json!({"name": "anvil", "price": 1.0, "active": true}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap();

    let found = col.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(found["active"], json!(true));

    let rows = db
        .query(
            "SELECT active FROM products WHERE _id = ?",
            &[SqlValue::Text(id.to_string())],
        )
        .await
        .unwrap();
    assert_eq!(rows[0].integer("active"), Some(1));
}

// ═════════════════════════════════════════════════════════════════════════════
// Bulk operations
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn empty_bulk_operations_issue_no_sql() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;
    assert!(col.insert_bulk(vec![]).await.unwrap().is_empty());
    assert!(col.put_bulk(vec![]).await.unwrap().is_empty());
    assert_eq!(col.delete_bulk(&[]).await.unwrap(), 0);
}

#[tokio::test]
async fn insert_bulk_stores_all_documents() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let stored = col
        .insert_bulk(vec![
            json!({"name": "a", "price": 1.0}),
            json!({"name": "b", "price": 2.0}),
            json!({"name": "c", "price": 3.0}),
        ])
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|d| d["_version"] == json!(1)));
    assert_eq!(col.count().await.unwrap(), 3);
}

#[tokio::test]
async fn insert_bulk_rolls_back_entirely_on_duplicate() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let existing = col
        .insert(json!({"name": "taken", "price": 1.0}))
        .await
        .unwrap();
    let existing_id = existing["_id"].as_str().unwrap();

    let err = col
        .insert_bulk(vec![
            json!({"name": "fresh", "price": 2.0}),
            json!({"_id": existing_id, "name": "dup", "price": 3.0}),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, VellumError::UniqueConstraint { .. }));

    // Count unchanged: the fresh document must not have landed.
    assert_eq!(col.count().await.unwrap(), 1);
}

#[tokio::test]
async fn delete_removes_document() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let stored = col
        .insert(json!({"name": "anvil", "price": 1.0}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap();

    assert!(col.delete(id).await.unwrap());
    assert!(!col.delete(id).await.unwrap());
    assert!(col.find_by_id(id).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_bulk_counts_existing_rows() {
    let db = Database::open_in_memory().await.unwrap();
    let col = products(&db).await;

    let a = col.insert(json!({"name": "a", "price": 1.0})).await.unwrap();
    let b = col.insert(json!({"name": "b", "price": 2.0})).await.unwrap();
    let ids = vec![
        a["_id"].as_str().unwrap().to_string(),
        b["_id"].as_str().unwrap().to_string(),
        "missing".to_string(),
    ];
    assert_eq!(col.delete_bulk(&ids).await.unwrap(), 2);
    assert_eq!(col.count().await.unwrap(), 0);
}

// ═════════════════════════════════════════════════════════════════════════════
// Constraint mapping
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unique_field_violation_names_the_field() {
    let db = Database::open_in_memory().await.unwrap();
    let col = db
        .collection(
            CollectionConfig::new(
                "accounts",
                Schema::object([("email", SchemaNode::String)]),
            )
            .field("email", FieldDefinition::text().unique()),
        )
        .await
        .unwrap();

    col.insert(json!({"email": "a@example.com"})).await.unwrap();
    let err = col
        .insert(json!({"email": "a@example.com"}))
        .await
        .unwrap_err();
    match err {
        VellumError::UniqueConstraint { field, .. } => assert_eq!(field, "email"),
        other => panic!("expected UniqueConstraint, got {other}"),
    }
}

#[tokio::test]
async fn check_constraint_violation_is_typed() {
    let db = Database::open_in_memory().await.unwrap();
    let col = db
        .collection(
            CollectionConfig::new(
                "stock",
                Schema::object([("qty", SchemaNode::Integer)]),
            )
            .field("qty", FieldDefinition::integer().check("qty >= 0")),
        )
        .await
        .unwrap();

    col.insert(json!({"qty": 5})).await.unwrap();
    let err = col.insert(json!({"qty": -1})).await.unwrap_err();
    assert!(matches!(err, VellumError::CheckConstraint(_)));
}

#[tokio::test]
async fn foreign_key_violation_maps_to_validation() {
    let db = Database::open_in_memory().await.unwrap();
    db.collection(CollectionConfig::new(
        "owners",
        Schema::object([("name", SchemaNode::String)]),
    ))
    .await
    .unwrap();
    let pets = db
        .collection(
            CollectionConfig::new(
                "pets",
                Schema::object([("owner_id", SchemaNode::String)]),
            )
            .field("owner_id", FieldDefinition::text().references("owners", "_id")),
        )
        .await
        .unwrap();

    let err = pets
        .insert(json!({"owner_id": "missing"}))
        .await
        .unwrap_err();
    assert!(matches!(err, VellumError::Validation(_)));
}

// ═════════════════════════════════════════════════════════════════════════════
// Nested constrained paths
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn nested_path_synthesizes_flattened_column() {
    let db = Database::open_in_memory().await.unwrap();
    let col = db
        .collection(
            CollectionConfig::new(
                "people",
                Schema::object([(
                    "profile",
                    SchemaNode::Object(
                        [("city".to_string(), SchemaNode::String)].into_iter().collect(),
                    ),
                )]),
            )
            .field("profile.city", FieldDefinition::text().indexed()),
        )
        .await
        .unwrap();

    let stored = col
        .insert(json!({"profile": {"city": "lisbon"}}))
        .await
        .unwrap();
    let id = stored["_id"].as_str().unwrap();

    let rows = db
        .query(
            "SELECT profile_city FROM people WHERE _id = ?",
            &[SqlValue::Text(id.to_string())],
        )
        .await
        .unwrap();
    assert_eq!(rows[0].text("profile_city"), Some("lisbon"));

    let found = col.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(found["profile"]["city"], json!("lisbon"));
}
