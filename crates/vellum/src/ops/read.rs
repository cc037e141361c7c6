//! Read paths: point lookup, query execution, row decoding.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use rusqlite::Connection;
use serde_json::Value;

use vellum_core::codec::{date_value, DocumentCache};
use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::fields::{
    column_name, from_storage, sqlite_type_of, ConstrainedFields, SqlValue,
};
use vellum_core::schema::Schema;
use vellum_query::ir::QueryOptions;
use vellum_query::translate::{build_count, build_select, TableCatalog, TableMeta};
use vellum_storage::driver::{query_rows, SqlRow};

use crate::collection::CollectionConfig;

/// Fetch one document by id. The JSON body is decoded through the parse
/// cache, then synthesized column values (authoritative) are merged back,
/// and `_version` is attached.
pub fn find_by_id(
    conn: &mut Connection,
    config: &CollectionConfig,
    cache: &DocumentCache,
    id: &str,
) -> VellumResult<Option<Value>> {
    let mut sql = String::from("SELECT json(doc) AS doc, _version AS _version");
    for path in config.fields.keys() {
        write!(sql, ", {col} AS {col}", col = column_name(path)).expect("writing to String");
    }
    write!(sql, " FROM {} WHERE _id = ?", config.name).expect("writing to String");

    let rows = query_rows(conn, &sql, &[SqlValue::Text(id.to_string())])
        .map_err(|f| f.into_error())?;
    let Some(row) = rows.into_iter().next() else {
        return Ok(None);
    };

    let doc_text = row
        .text("doc")
        .ok_or_else(|| VellumError::Database("row is missing doc column".to_string()))?;
    let mut doc = cache.parse(doc_text)?;

    merge_columns(&mut doc, &row, &config.fields, &config.schema);
    doc["_id"] = Value::String(id.to_string());
    doc["_version"] = Value::from(row.integer("_version").unwrap_or(1));
    Ok(Some(doc))
}

/// Read the stored version of a document, if it exists.
pub fn current_version(
    conn: &mut Connection,
    config: &CollectionConfig,
    id: &str,
) -> VellumResult<Option<i64>> {
    let sql = format!("SELECT _version FROM {} WHERE _id = ?", config.name);
    let rows = query_rows(conn, &sql, &[SqlValue::Text(id.to_string())])
        .map_err(|f| f.into_error())?;
    Ok(rows.first().and_then(|row| row.integer("_version")))
}

/// Which ids out of `ids` already exist, via one batched query.
pub fn existing_ids(
    conn: &mut Connection,
    config: &CollectionConfig,
    ids: &[String],
) -> VellumResult<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let marks = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT _id FROM {} WHERE _id IN ({marks})", config.name);
    let params: Vec<SqlValue> = ids.iter().map(|id| SqlValue::Text(id.clone())).collect();
    let rows = query_rows(conn, &sql, &params).map_err(|f| f.into_error())?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.text("_id").map(str::to_string))
        .collect())
}

/// Execute a translated SELECT: document queries decode to documents,
/// projections and aggregates decode to plain JSON rows.
pub fn to_array(
    conn: &mut Connection,
    config: &CollectionConfig,
    cache: &DocumentCache,
    options: &QueryOptions,
    catalog: &BTreeMap<String, ConstrainedFields>,
) -> VellumResult<Vec<Value>> {
    let base = TableMeta {
        table: &config.name,
        fields: &config.fields,
    };
    let query = build_select(base, options, catalog as &dyn TableCatalog)?;
    let rows = query_rows(conn, &query.sql, &query.params).map_err(|f| f.into_error())?;

    if options.is_document_query() {
        rows.into_iter()
            .map(|row| decode_document_row(&row, cache))
            .collect()
    } else {
        Ok(rows.into_iter().map(row_to_json).collect())
    }
}

pub fn count(
    conn: &mut Connection,
    config: &CollectionConfig,
    options: &QueryOptions,
    catalog: &BTreeMap<String, ConstrainedFields>,
) -> VellumResult<u64> {
    let base = TableMeta {
        table: &config.name,
        fields: &config.fields,
    };
    let query = build_count(base, options, catalog as &dyn TableCatalog)?;
    let rows = query_rows(conn, &query.sql, &query.params).map_err(|f| f.into_error())?;
    let count = rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(|v| match v {
            SqlValue::Integer(n) => Some(*n),
            _ => None,
        })
        .unwrap_or(0);
    Ok(count.max(0) as u64)
}

/// Decode a `doc/_id/_version` row into a document value.
pub fn decode_document_row(row: &SqlRow, cache: &DocumentCache) -> VellumResult<Value> {
    let doc_text = row
        .text("doc")
        .ok_or_else(|| VellumError::Database("row is missing doc column".to_string()))?;
    let mut doc = cache.parse(doc_text)?;
    if let Some(id) = row.text("_id") {
        doc["_id"] = Value::String(id.to_string());
    }
    if let Some(version) = row.integer("_version") {
        doc["_version"] = Value::from(version);
    }
    Ok(doc)
}

/// Merge synthesized column values over the decoded body, restoring
/// schema-declared booleans and dates from their column encodings.
pub fn merge_columns(
    doc: &mut Value,
    row: &SqlRow,
    fields: &ConstrainedFields,
    schema: &Schema,
) {
    for (path, def) in fields {
        let col = column_name(path);
        let Some(raw) = row.get_named(&col) else {
            continue;
        };
        if matches!(raw, SqlValue::Null) {
            continue;
        }
        let ty = sqlite_type_of(schema.resolve_path(path), def);
        let mut value = from_storage(raw.clone(), ty);
        if let Some(node) = schema.resolve_path(path) {
            if node.is_boolean() {
                if let Some(n) = value.as_i64() {
                    value = Value::Bool(n != 0);
                }
            } else if node.is_date() {
                if let Some(s) = value.as_str() {
                    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                        value = date_value(dt.with_timezone(&chrono::Utc));
                    }
                }
            }
        }
        super::set_path(doc, path, value);
    }
}

/// Convert a projected/aggregated row to a JSON object keyed by the
/// emitted aliases.
fn row_to_json(row: SqlRow) -> Value {
    let columns: Vec<String> = row.columns().to_vec();
    let mut map = serde_json::Map::with_capacity(columns.len());
    for (name, value) in columns.into_iter().zip(row.into_values()) {
        map.insert(name, sql_value_to_json(value));
    }
    Value::Object(map)
}

fn sql_value_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Value::from(f),
        SqlValue::Text(s) => {
            // json_extract renders arrays/objects as JSON text.
            if s.starts_with('[') || s.starts_with('{') {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            } else {
                Value::String(s)
            }
        }
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}
