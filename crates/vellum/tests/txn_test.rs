//! Transactions: nested SAVEPOINT scopes, rollback discipline, and
//! atomicity of collection operations run inside a transaction.

use serde_json::json;

use vellum::{CollectionConfig, Database, Schema, SchemaNode, VellumError};

// ─── Fixtures ────────────────────────────────────────────────────────────────

async fn items(db: &Database) -> vellum::Collection {
    db.collection(CollectionConfig::new(
        "items",
        Schema::object([("name", SchemaNode::String)]),
    ))
    .await
    .unwrap()
}

// ═════════════════════════════════════════════════════════════════════════════
// Nested scopes
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn inner_scope_rolls_back_without_touching_outer() {
    let db = Database::open_in_memory().await.unwrap();
    let col = items(&db).await;

    db.transaction(|tx| {
        tx.insert("items", json!({"_id": "a", "name": "outer"}))?;
        let inner: Result<(), VellumError> = tx.nested(|inner| {
            inner.insert("items", json!({"_id": "b", "name": "inner"}))?;
            Err(VellumError::validation("inner failure"))
        });
        assert!(inner.is_err());
        Ok(())
    })
    .await
    .unwrap();

    assert!(col.find_by_id("a").await.unwrap().is_some());
    assert!(col.find_by_id("b").await.unwrap().is_none());
}

#[tokio::test]
async fn outer_failure_rolls_back_everything() {
    let db = Database::open_in_memory().await.unwrap();
    let col = items(&db).await;

    let result: Result<(), VellumError> = db
        .transaction(|tx| {
            tx.insert("items", json!({"_id": "a", "name": "doomed"}))?;
            tx.nested(|inner| inner.insert("items", json!({"_id": "b", "name": "also"})))?;
            Err(VellumError::validation("outer failure"))
        })
        .await;
    assert!(result.is_err());
    assert_eq!(col.count().await.unwrap(), 0);
}

#[tokio::test]
async fn nested_success_commits_with_outer() {
    let db = Database::open_in_memory().await.unwrap();
    let col = items(&db).await;

    db.transaction(|tx| {
        tx.insert("items", json!({"_id": "a", "name": "one"}))?;
        tx.nested(|inner| inner.insert("items", json!({"_id": "b", "name": "two"})))?;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(col.count().await.unwrap(), 2);
}

// ═════════════════════════════════════════════════════════════════════════════
// Collection operations inside transactions
// ═════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn scope_put_and_delete_are_transactional() {
    let db = Database::open_in_memory().await.unwrap();
    let col = items(&db).await;
    col.insert(json!({"_id": "a", "name": "before"}))
        .await
        .unwrap();

    let result: Result<(), VellumError> = db
        .transaction(|tx| {
            tx.put("items", "a", json!({"name": "after"}))?;
            tx.delete("items", "a")?;
            Err(VellumError::validation("abort"))
        })
        .await;
    assert!(result.is_err());

    let doc = col.find_by_id("a").await.unwrap().unwrap();
    assert_eq!(doc["name"], json!("before"));
    assert_eq!(doc["_version"], json!(1));
}

#[tokio::test]
async fn scope_reads_see_uncommitted_writes() {
    let db = Database::open_in_memory().await.unwrap();
    items(&db).await;

    db.transaction(|tx| {
        tx.insert("items", json!({"_id": "a", "name": "visible"}))?;
        let seen = tx.find_by_id("items", "a")?.unwrap();
        assert_eq!(seen["name"], json!("visible"));
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn raw_exec_participates_in_rollback() {
    let db = Database::open_in_memory().await.unwrap();
    items(&db).await;

    let result: Result<(), VellumError> = db
        .transaction(|tx| {
            tx.exec(
                "INSERT INTO items (_id, doc) VALUES ('raw', '{\"name\":\"raw\"}')",
                &[],
            )?;
            Err(VellumError::validation("abort"))
        })
        .await;
    assert!(result.is_err());

    let rows = db.query("SELECT COUNT(*) AS n FROM items", &[]).await.unwrap();
    assert_eq!(rows[0].integer("n"), Some(0));
}

#[tokio::test]
async fn unknown_collection_in_scope_is_not_found() {
    let db = Database::open_in_memory().await.unwrap();
    items(&db).await;

    let result: Result<(), VellumError> = db
        .transaction(|tx| {
            tx.insert("ghosts", json!({"name": "boo"}))?;
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(VellumError::NotFound { .. })));
}
