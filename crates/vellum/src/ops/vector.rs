//! Vector maintenance and similarity search.
//!
//! Dual storage: the JSON body keeps the array, the vec0 virtual table
//! keeps the f32 BLOB keyed by the document's rowid. Every write path
//! keeps the two consistent — a non-null array value has exactly one vec0
//! row, an absent or null value has none.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde_json::Value;

use vellum_core::codec::DocumentCache;
use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::fields::{column_name, lookup_path, ConstrainedFields, VectorSpec};
use vellum_query::translate::{
    build_vector_delete, build_vector_insert, build_vector_search, TableCatalog, TableMeta,
};
use vellum_storage::driver::exec;
use vellum_storage::vector::{buffer_pool, vector_to_blob};

use crate::collection::{CollectionConfig, VectorMatch, VectorSearch};

/// The VECTOR fields of a collection: `(path, column, spec)`.
pub fn vector_fields(config: &CollectionConfig) -> Vec<(&str, String, VectorSpec)> {
    config
        .fields
        .iter()
        .filter_map(|(path, def)| {
            def.vector
                .map(|spec| (path.as_str(), column_name(path), spec))
        })
        .collect()
}

/// Parse a document value into an f32 vector of the declared dimension.
pub fn parse_vector(path: &str, value: &Value, spec: &VectorSpec) -> VellumResult<Vec<f32>> {
    let items = value.as_array().ok_or_else(|| {
        VellumError::validation(format!("vector field '{path}' must be a number array"))
    })?;
    if items.len() != spec.dimensions {
        return Err(VellumError::validation(format!(
            "vector field '{path}' has {} dimensions, expected {}",
            items.len(),
            spec.dimensions
        )));
    }
    let mut buffer = buffer_pool().acquire(spec.dimensions);
    for (i, item) in items.iter().enumerate() {
        buffer[i] = item.as_f64().ok_or_else(|| {
            VellumError::validation(format!(
                "vector field '{path}' contains a non-numeric element"
            ))
        })? as f32;
    }
    // Hand back an owned vector; the scratch buffer returns to the pool.
    let out = buffer.clone();
    buffer_pool().release(buffer);
    Ok(out)
}

/// Reconcile the vec0 rows for one document after a write.
///
/// Updates delete before inserting; inserts on a fresh row skip the
/// delete. A field that is absent or null ends with no vec0 row.
pub fn sync_vectors(
    conn: &mut Connection,
    config: &CollectionConfig,
    id: &str,
    doc: &Value,
    is_update: bool,
) -> VellumResult<()> {
    for (path, col, spec) in vector_fields(config) {
        if is_update {
            let delete = build_vector_delete(&config.name, &col, id)?;
            exec(conn, &delete.sql, &delete.params).map_err(|f| f.into_error_for_id(id))?;
        }
        match lookup_path(doc, path) {
            Some(value) if !value.is_null() => {
                let vector = parse_vector(path, value, &spec)?;
                let blob = vector_to_blob(&vector);
                let insert = build_vector_insert(&config.name, &col, id, blob)?;
                exec(conn, &insert.sql, &insert.params).map_err(|f| f.into_error_for_id(id))?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Remove all vec0 rows for a document (before the main row goes away,
/// while `_id → rowid` can still be resolved).
pub fn delete_vectors(conn: &mut Connection, config: &CollectionConfig, id: &str) -> VellumResult<()> {
    for (_path, col, _spec) in vector_fields(config) {
        let delete = build_vector_delete(&config.name, &col, id)?;
        exec(conn, &delete.sql, &delete.params).map_err(|f| f.into_error_for_id(id))?;
    }
    Ok(())
}

/// KNN search over one VECTOR field, ascending by distance.
pub fn vector_search(
    conn: &mut Connection,
    config: &CollectionConfig,
    cache: &DocumentCache,
    search: &VectorSearch,
    catalog: &BTreeMap<String, ConstrainedFields>,
) -> VellumResult<Vec<VectorMatch>> {
    let def = config.fields.get(&search.field).ok_or_else(|| {
        VellumError::validation(format!(
            "field '{}' is not a vector field of '{}'",
            search.field, config.name
        ))
    })?;
    let spec = def.vector.ok_or_else(|| {
        VellumError::validation(format!(
            "field '{}' is not a vector field of '{}'",
            search.field, config.name
        ))
    })?;
    if search.vector.len() != spec.dimensions {
        return Err(VellumError::validation(format!(
            "query vector has {} dimensions, field '{}' expects {}",
            search.vector.len(),
            search.field,
            spec.dimensions
        )));
    }

    let base = TableMeta {
        table: &config.name,
        fields: &config.fields,
    };
    let blob = vector_to_blob(&search.vector);
    let column = column_name(&search.field);
    let query = build_vector_search(
        base,
        &column,
        blob,
        search.limit,
        search.filter.as_ref(),
        catalog as &dyn TableCatalog,
    )?;

    let rows = vellum_storage::driver::query_rows(conn, &query.sql, &query.params)
        .map_err(|f| f.into_error())?;
    rows.into_iter()
        .map(|row| {
            let distance = row.real("distance").unwrap_or(f64::MAX);
            let document = super::read::decode_document_row(&row, cache)?;
            Ok(VectorMatch { document, distance })
        })
        .collect()
}
