//! Vector storage and similarity search: dual-storage coherence across
//! insert/update/delete, KNN ordering, dimension validation, rebuild.

use serde_json::json;

use vellum::{
    CollectionConfig, Database, FieldDefinition, Schema, SchemaNode, SqlValue, VectorSearch,
    VellumError,
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn doc_schema() -> Schema {
    Schema::object([
        ("title", SchemaNode::String),
        (
            "embedding",
            SchemaNode::array_of(SchemaNode::Number).nullable().optional(),
        ),
    ])
}

async fn notes(db: &Database) -> vellum::Collection {
    db.collection(
        CollectionConfig::new("notes", doc_schema())
            .field("embedding", FieldDefinition::vector(3)),
    )
    .await
    .unwrap()
}

async fn vec_row_count(db: &Database, id: &str) -> i64 {
    let rows = db
        .query(
            "SELECT COUNT(*) AS n FROM notes_embedding_vec
             WHERE rowid IN (SELECT rowid FROM notes WHERE _id = ?)",
            &[SqlValue::Text(id.to_string())],
        )
        .await
        .unwrap();
    rows[0].integer("n").unwrap()
}

// ═════════════════════════════════════════════════════════════════════════════
// Search
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn knn_returns_nearest_first() {
    let db = Database::open_in_memory().await.unwrap();
    let col = notes(&db).await;

    col.insert_bulk(vec![
        json!({"_id": "n1", "title": "x-axis", "embedding": [1.0, 0.0, 0.0]}),
        json!({"_id": "n2", "title": "y-axis", "embedding": [0.0, 1.0, 0.0]}),
        json!({"_id": "n3", "title": "z-axis", "embedding": [0.0, 0.0, 1.0]}),
    ])
    .await
    .unwrap();

    let matches = col
        .vector_search(VectorSearch::new("embedding", vec![1.0, 0.0, 0.0], 2))
        .await
        .unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].document["_id"], json!("n1"));
    assert!(matches[0].distance.abs() < 1e-6);
    assert!(matches[1].distance > matches[0].distance);
}

#[tokio::test]
async fn search_rejects_wrong_dimensionality() {
    let db = Database::open_in_memory().await.unwrap();
    let col = notes(&db).await;

    let err = col
        .vector_search(VectorSearch::new("embedding", vec![1.0, 0.0], 2))
        .await
        .unwrap_err();
    assert!(matches!(err, VellumError::Validation(_)));

    let err = col
        .vector_search(VectorSearch::new("title", vec![1.0, 0.0, 0.0], 2))
        .await
        .unwrap_err();
    assert!(matches!(err, VellumError::Validation(_)));
}

#[tokio::test]
async fn insert_rejects_wrong_dimensionality() {
    let db = Database::open_in_memory().await.unwrap();
    let col = notes(&db).await;

    let err = col
        .insert(json!({"title": "bad", "embedding": [1.0, 0.0]}))
        .await
        .unwrap_err();
    assert!(matches!(err, VellumError::Validation(_)));
    // The failed insert must leave nothing behind.
    assert_eq!(col.count().await.unwrap(), 0);
}

#[tokio::test]
async fn filtered_search_applies_where_clause() {
    let db = Database::open_in_memory().await.unwrap();
    let col = notes(&db).await;

    col.insert_bulk(vec![
        json!({"_id": "n1", "title": "keep", "embedding": [1.0, 0.0, 0.0]}),
        json!({"_id": "n2", "title": "skip", "embedding": [0.9, 0.1, 0.0]}),
    ])
    .await
    .unwrap();

    let filter = col
        .where_field("title")
        .unwrap()
        .eq(json!("keep"))
        .options()
        .clone();
    let matches = col
        .vector_search(VectorSearch::new("embedding", vec![1.0, 0.0, 0.0], 5).filtered(filter))
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].document["_id"], json!("n1"));
}

// ═════════════════════════════════════════════════════════════════════════════
// Dual-storage coherence
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn vector_rows_follow_document_lifecycle() {
    let db = Database::open_in_memory().await.unwrap();
    let col = notes(&db).await;

    col.insert(json!({"_id": "n1", "title": "a", "embedding": [1.0, 0.0, 0.0]}))
        .await
        .unwrap();
    assert_eq!(vec_row_count(&db, "n1").await, 1);

    // Null value removes the row.
    col.put("n1", json!({"embedding": null})).await.unwrap();
    assert_eq!(vec_row_count(&db, "n1").await, 0);

    // Restoring the value recreates exactly one row.
    col.put("n1", json!({"embedding": [0.0, 1.0, 0.0]}))
        .await
        .unwrap();
    assert_eq!(vec_row_count(&db, "n1").await, 1);

    col.delete("n1").await.unwrap();
    let orphans = db
        .query("SELECT COUNT(*) AS n FROM notes_embedding_vec", &[])
        .await
        .unwrap();
    assert_eq!(orphans[0].integer("n"), Some(0));
}

#[tokio::test]
async fn document_without_embedding_has_no_vector_row() {
    let db = Database::open_in_memory().await.unwrap();
    let col = notes(&db).await;

    col.insert(json!({"_id": "n1", "title": "plain"}))
        .await
        .unwrap();
    assert_eq!(vec_row_count(&db, "n1").await, 0);
}

#[tokio::test]
async fn updated_vector_is_searchable_at_new_position() {
    let db = Database::open_in_memory().await.unwrap();
    let col = notes(&db).await;

    col.insert(json!({"_id": "n1", "title": "a", "embedding": [1.0, 0.0, 0.0]}))
        .await
        .unwrap();
    col.put("n1", json!({"embedding": [0.0, 0.0, 1.0]}))
        .await
        .unwrap();

    let matches = col
        .vector_search(VectorSearch::new("embedding", vec![0.0, 0.0, 1.0], 1))
        .await
        .unwrap();
    assert_eq!(matches[0].document["_id"], json!("n1"));
    assert!(matches[0].distance.abs() < 1e-6);
}

// ═════════════════════════════════════════════════════════════════════════════
// Rebuild
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rebuild_repairs_missing_vector_rows() {
    let db = Database::open_in_memory().await.unwrap();
    let col = notes(&db).await;

    col.insert(json!({"_id": "n1", "title": "a", "embedding": [1.0, 0.0, 0.0]}))
        .await
        .unwrap();
    // Sabotage: drop the vec0 row behind the engine's back.
    db.exec("DELETE FROM notes_embedding_vec", &[]).await.unwrap();
    assert_eq!(vec_row_count(&db, "n1").await, 0);

    let report = col.rebuild_indexes().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.fixed, 1);
    assert!(report.errors.is_empty());
    assert_eq!(vec_row_count(&db, "n1").await, 1);
}

#[tokio::test]
async fn rebuild_repairs_divergent_columns() {
    let db = Database::open_in_memory().await.unwrap();
    let col = db
        .collection(
            CollectionConfig::new(
                "items",
                Schema::object([("price", SchemaNode::Number)]),
            )
            .field("price", FieldDefinition::real()),
        )
        .await
        .unwrap();

    col.insert(json!({"_id": "i1", "price": 10.0})).await.unwrap();
    // Sabotage: set the column directly, then restore the body. The second
    // statement touches only `doc`, so the UPDATE-OF trigger stays quiet
    // and the row ends up divergent.
    db.exec(
        "UPDATE items SET price = 999.0 WHERE _id = 'i1'",
        &[],
    )
    .await
    .unwrap();
    db.exec(
        "UPDATE items SET doc = json_set(doc, '$.price', 10.0) WHERE _id = 'i1'",
        &[],
    )
    .await
    .unwrap();

    let report = col.rebuild_indexes().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.fixed, 1);

    let rows = db
        .query("SELECT price FROM items WHERE _id = 'i1'", &[])
        .await
        .unwrap();
    assert_eq!(rows[0].real("price"), Some(10.0));
}
