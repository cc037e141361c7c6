//! Write paths: insert, merge-update, atomic operators, upsert, delete.
//!
//! Every operation runs inside a transaction that also covers its vector
//! maintenance, so a failure anywhere leaves no partial effect. `put`
//! upgrades the lock with BEGIN IMMEDIATE to close the window between
//! reading `_version` and the guarded UPDATE.

use rusqlite::Connection;
use serde_json::Value;
use uuid::Uuid;

use vellum_core::codec::{document_cache, encode_document};
use vellum_core::errors::{VellumError, VellumResult};
use vellum_query::translate::{
    build_atomic_update, build_delete, build_insert, build_insert_many, build_update,
    build_upsert, column_params, UpdateOperators,
};
use vellum_storage::driver::exec;
use vellum_storage::txn::{run_in_transaction, TxnBehavior};

use crate::collection::CollectionConfig;

use super::{read, vector};

fn resolve_id(doc: &Value) -> VellumResult<(String, bool)> {
    match doc.get("_id") {
        None | Some(Value::Null) => Ok((Uuid::new_v4().to_string(), true)),
        Some(Value::String(s)) if !s.is_empty() => Ok((s.clone(), false)),
        Some(other) => Err(VellumError::validation(format!(
            "_id must be a non-empty string, got {other}"
        ))),
    }
}

fn require_object(doc: &Value) -> VellumResult<()> {
    if doc.is_object() {
        Ok(())
    } else {
        Err(VellumError::validation("document must be a JSON object"))
    }
}

/// Insert one document; `_version` starts at 1.
pub fn insert(conn: &mut Connection, config: &CollectionConfig, mut doc: Value) -> VellumResult<Value> {
    require_object(&doc)?;
    let (id, _generated) = resolve_id(&doc)?;
    doc["_id"] = Value::String(id.clone());
    config.schema.validate(&doc)?;

    run_in_transaction(conn, TxnBehavior::Deferred, |conn| {
        let doc_text = encode_document(&doc)?;
        let cols = column_params(&doc, &config.fields, &config.schema)?;
        let query = build_insert(&config.name, &config.fields, &id, &doc_text, cols)?;
        exec(conn, &query.sql, &query.params).map_err(|f| f.into_error_for_id(&id))?;
        vector::sync_vectors(conn, config, &id, &doc, false)?;
        Ok(())
    })?;

    doc["_version"] = Value::from(1);
    Ok(doc)
}

/// Insert many documents atomically. Existing ids are rejected before any
/// row is written; the batch is one multi-row INSERT plus vector inserts
/// in a single transaction.
pub fn insert_bulk(
    conn: &mut Connection,
    config: &CollectionConfig,
    docs: Vec<Value>,
) -> VellumResult<Vec<Value>> {
    if docs.is_empty() {
        return Ok(Vec::new());
    }

    let mut prepared = Vec::with_capacity(docs.len());
    for mut doc in docs {
        require_object(&doc)?;
        let (id, _) = resolve_id(&doc)?;
        doc["_id"] = Value::String(id.clone());
        config.schema.validate(&doc)?;
        prepared.push((id, doc));
    }

    let ids: Vec<String> = prepared.iter().map(|(id, _)| id.clone()).collect();
    {
        let mut seen = std::collections::BTreeSet::new();
        for id in &ids {
            if !seen.insert(id) {
                return Err(VellumError::UniqueConstraint {
                    field: "_id".to_string(),
                    id: id.clone(),
                });
            }
        }
    }

    run_in_transaction(conn, TxnBehavior::Deferred, |conn| {
        let existing = read::existing_ids(conn, config, &ids)?;
        if let Some(id) = existing.into_iter().next() {
            return Err(VellumError::UniqueConstraint {
                field: "_id".to_string(),
                id,
            });
        }

        let mut rows = Vec::with_capacity(prepared.len());
        for (id, doc) in &prepared {
            let doc_text = encode_document(doc)?;
            let cols = column_params(doc, &config.fields, &config.schema)?;
            rows.push((id.clone(), doc_text, cols));
        }
        let query = build_insert_many(&config.name, &config.fields, rows)?;
        exec(conn, &query.sql, &query.params).map_err(|f| f.into_error())?;

        for (id, doc) in &prepared {
            vector::sync_vectors(conn, config, id, doc, false)?;
        }
        Ok(())
    })?;

    Ok(prepared
        .into_iter()
        .map(|(_, mut doc)| {
            doc["_version"] = Value::from(1);
            doc
        })
        .collect())
}

/// Merge `partial` over the stored document under optimistic concurrency.
pub fn put(
    conn: &mut Connection,
    config: &CollectionConfig,
    id: &str,
    partial: Value,
    expected_version: Option<i64>,
) -> VellumResult<Value> {
    require_object(&partial)?;

    run_in_transaction(conn, TxnBehavior::Immediate, |conn| {
        let existing = read::find_by_id(conn, config, document_cache(), id)?
            .ok_or_else(|| VellumError::NotFound { id: id.to_string() })?;
        let current = existing
            .get("_version")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let expected = expected_version.unwrap_or(current);

        let mut merged = existing;
        if let (Some(base), Some(patch)) = (merged.as_object_mut(), partial.as_object()) {
            base.remove("_version");
            for (key, value) in patch {
                if key == "_id" || key == "_version" {
                    continue;
                }
                base.insert(key.clone(), value.clone());
            }
        }
        merged["_id"] = Value::String(id.to_string());
        config.schema.validate(&merged)?;

        let doc_text = encode_document(&merged)?;
        let cols = column_params(&merged, &config.fields, &config.schema)?;
        let query = build_update(&config.name, &config.fields, id, &doc_text, cols, Some(expected))?;
        let changed =
            exec(conn, &query.sql, &query.params).map_err(|f| f.into_error_for_id(id))?;
        if changed == 0 {
            let actual = read::current_version(conn, config, id)?
                .ok_or_else(|| VellumError::NotFound { id: id.to_string() })?;
            return Err(VellumError::VersionMismatch {
                id: id.to_string(),
                expected,
                actual,
            });
        }

        vector::sync_vectors(conn, config, id, &merged, true)?;
        merged["_version"] = Value::from(expected + 1);
        Ok(merged)
    })
}

/// Merge-update several documents in one transaction, without per-item
/// version checks.
pub fn put_bulk(
    conn: &mut Connection,
    config: &CollectionConfig,
    updates: Vec<(String, Value)>,
) -> VellumResult<Vec<Value>> {
    run_in_transaction(conn, TxnBehavior::Immediate, |conn| {
        let mut out = Vec::with_capacity(updates.len());
        for (id, partial) in &updates {
            require_object(partial)?;
            let existing = read::find_by_id(conn, config, document_cache(), id)?
                .ok_or_else(|| VellumError::NotFound { id: id.clone() })?;
            let current = existing
                .get("_version")
                .and_then(Value::as_i64)
                .unwrap_or(1);

            let mut merged = existing;
            if let (Some(base), Some(patch)) = (merged.as_object_mut(), partial.as_object()) {
                base.remove("_version");
                for (key, value) in patch {
                    if key == "_id" || key == "_version" {
                        continue;
                    }
                    base.insert(key.clone(), value.clone());
                }
            }
            config.schema.validate(&merged)?;

            let doc_text = encode_document(&merged)?;
            let cols = column_params(&merged, &config.fields, &config.schema)?;
            let query = build_update(&config.name, &config.fields, id, &doc_text, cols, None)?;
            let changed =
                exec(conn, &query.sql, &query.params).map_err(|f| f.into_error_for_id(id))?;
            if changed == 0 {
                return Err(VellumError::NotFound { id: id.clone() });
            }
            vector::sync_vectors(conn, config, id, &merged, true)?;
            merged["_version"] = Value::from(current + 1);
            out.push(merged);
        }
        Ok(out)
    })
}

/// Apply atomic operators in one UPDATE, classifying a zero-row result as
/// NotFound or VersionMismatch. The updated document is reloaded and
/// returned.
pub fn atomic_update(
    conn: &mut Connection,
    config: &CollectionConfig,
    id: &str,
    operators: &UpdateOperators,
    expected_version: Option<i64>,
) -> VellumResult<Value> {
    for path in operators
        .set
        .keys()
        .chain(operators.inc.keys())
        .chain(operators.push.keys())
    {
        if config.schema.resolve_path(path).is_none() {
            return Err(VellumError::validation(format!(
                "unknown field '{path}' in collection '{}'",
                config.name
            )));
        }
    }

    run_in_transaction(conn, TxnBehavior::Deferred, |conn| {
        let query = build_atomic_update(
            &config.name,
            &config.fields,
            &config.schema,
            id,
            operators,
            expected_version,
        )?;
        let changed =
            exec(conn, &query.sql, &query.params).map_err(|f| f.into_error_for_id(id))?;
        if changed == 0 {
            return match read::current_version(conn, config, id)? {
                None => Err(VellumError::NotFound { id: id.to_string() }),
                Some(actual) => Err(VellumError::VersionMismatch {
                    id: id.to_string(),
                    expected: expected_version.unwrap_or(actual),
                    actual,
                }),
            };
        }

        let touches_vector = vector::vector_fields(config).iter().any(|(path, _, _)| {
            operators.set.contains_key(*path)
                || operators.inc.contains_key(*path)
                || operators.push.contains_key(*path)
        });
        let updated = read::find_by_id(conn, config, document_cache(), id)?
            .ok_or_else(|| VellumError::NotFound { id: id.to_string() })?;
        if touches_vector {
            vector::sync_vectors(conn, config, id, &updated, true)?;
        }
        Ok(updated)
    })
}

/// Insert-or-update preserving `_version` monotonicity.
pub fn upsert(
    conn: &mut Connection,
    config: &CollectionConfig,
    id: &str,
    mut doc: Value,
) -> VellumResult<Value> {
    require_object(&doc)?;
    doc["_id"] = Value::String(id.to_string());
    config.schema.validate(&doc)?;

    run_in_transaction(conn, TxnBehavior::Immediate, |conn| {
        let doc_text = encode_document(&doc)?;
        let cols = column_params(&doc, &config.fields, &config.schema)?;
        let query = build_upsert(&config.name, &config.fields, id, &doc_text, cols)?;
        exec(conn, &query.sql, &query.params).map_err(|f| f.into_error_for_id(id))?;
        vector::sync_vectors(conn, config, id, &doc, true)?;
        let version = read::current_version(conn, config, id)?.unwrap_or(1);
        doc["_version"] = Value::from(version);
        Ok(())
    })?;

    Ok(doc)
}

/// Upsert several documents in one transaction.
pub fn upsert_bulk(
    conn: &mut Connection,
    config: &CollectionConfig,
    docs: Vec<(String, Value)>,
) -> VellumResult<Vec<Value>> {
    run_in_transaction(conn, TxnBehavior::Immediate, |conn| {
        let mut out = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            out.push(upsert(conn, config, &id, doc)?);
        }
        Ok(out)
    })
}

/// Delete one document and its vector rows. Returns whether a row existed.
pub fn delete(conn: &mut Connection, config: &CollectionConfig, id: &str) -> VellumResult<bool> {
    run_in_transaction(conn, TxnBehavior::Deferred, |conn| {
        // Vector rows first: the `_id → rowid` mapping disappears with the
        // main row.
        vector::delete_vectors(conn, config, id)?;
        let query = build_delete(&config.name, id)?;
        let changed =
            exec(conn, &query.sql, &query.params).map_err(|f| f.into_error_for_id(id))?;
        Ok(changed > 0)
    })
}

/// Delete several documents in one transaction; returns how many existed.
pub fn delete_bulk(
    conn: &mut Connection,
    config: &CollectionConfig,
    ids: &[String],
) -> VellumResult<usize> {
    run_in_transaction(conn, TxnBehavior::Deferred, |conn| {
        let mut count = 0;
        for id in ids {
            if delete(conn, config, id)? {
                count += 1;
            }
        }
        Ok(count)
    })
}
