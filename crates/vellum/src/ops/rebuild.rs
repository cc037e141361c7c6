//! Index rebuild: recompute synthesized columns and vector rows from the
//! JSON body, repairing whatever diverged.

use std::fmt::Write as _;

use rusqlite::Connection;

use vellum_core::codec::DocumentCache;
use vellum_core::errors::VellumResult;
use vellum_core::fields::{column_name, lookup_path, sqlite_type_of, to_storage, SqlValue};
use vellum_query::translate::{build_vector_delete, build_vector_insert};
use vellum_storage::driver::{exec, query_iter, query_rows, KEYSET_CHUNK};
use vellum_storage::vector::{blob_to_vector, vector_to_blob};

use crate::collection::{CollectionConfig, RebuildReport};

use super::vector::{parse_vector, vector_fields};

/// Stream all rows in `_id` order, compare each synthesized column against
/// the value recomputed from the document body, and repair divergences.
/// Vector rows are reconciled both ways: missing and stale rows are
/// rewritten, rows for now-absent values are removed.
pub fn rebuild_indexes(
    conn: &mut Connection,
    config: &CollectionConfig,
    cache: &DocumentCache,
) -> VellumResult<RebuildReport> {
    let mut report = RebuildReport::default();
    let mut select = String::from("SELECT _id AS _id, json(doc) AS doc");
    for path in config.fields.keys() {
        write!(select, ", {col} AS {col}", col = column_name(path)).expect("writing to String");
    }
    write!(
        select,
        " FROM {} WHERE _id > ? ORDER BY _id LIMIT {KEYSET_CHUNK}",
        config.name
    )
    .expect("writing to String");

    let mut stream = query_iter(
        select,
        Vec::new(),
        "_id",
        SqlValue::Text(String::new()),
        KEYSET_CHUNK,
    );
    while let Some(row) = stream.next_row(conn).map_err(|f| f.into_error())? {
        let Some(id) = row.text("_id").map(str::to_string) else {
            continue;
        };
        report.scanned += 1;
        if let Err(e) = rebuild_row(conn, config, cache, &row, &id, &mut report) {
            report.errors.push(format!("{id}: {e}"));
        }
    }

    Ok(report)
}

fn rebuild_row(
    conn: &mut Connection,
    config: &CollectionConfig,
    cache: &DocumentCache,
    row: &vellum_storage::driver::SqlRow,
    id: &str,
    report: &mut RebuildReport,
) -> VellumResult<()> {
    let Some(doc_text) = row.text("doc") else {
        return Ok(());
    };
    let doc = cache.parse(doc_text)?;

    for (path, def) in &config.fields {
        if def.vector.is_some() {
            continue;
        }
        let col = column_name(path);
        let ty = sqlite_type_of(config.schema.resolve_path(path), def);
        let expected = match lookup_path(&doc, path) {
            Some(value) => to_storage(value, ty)?,
            None => SqlValue::Null,
        };
        let actual = row.get_named(&col).cloned().unwrap_or(SqlValue::Null);
        if !storage_eq(&expected, &actual) {
            let sql = format!("UPDATE {} SET {col} = ? WHERE _id = ?", config.name);
            exec(conn, &sql, &[expected, SqlValue::Text(id.to_string())])
                .map_err(|f| f.into_error_for_id(id))?;
            report.fixed += 1;
        }
    }

    for (path, col, spec) in vector_fields(config) {
        let expected = match lookup_path(&doc, path) {
            Some(value) if !value.is_null() => Some(parse_vector(path, value, &spec)?),
            _ => None,
        };
        let stored = stored_vector(conn, config, &col, id)?;
        if expected != stored {
            let delete = build_vector_delete(&config.name, &col, id)?;
            exec(conn, &delete.sql, &delete.params).map_err(|f| f.into_error_for_id(id))?;
            if let Some(vector) = expected {
                let insert =
                    build_vector_insert(&config.name, &col, id, vector_to_blob(&vector))?;
                exec(conn, &insert.sql, &insert.params).map_err(|f| f.into_error_for_id(id))?;
            }
            report.fixed += 1;
        }
    }

    Ok(())
}

fn stored_vector(
    conn: &mut Connection,
    config: &CollectionConfig,
    column: &str,
    id: &str,
) -> VellumResult<Option<Vec<f32>>> {
    let sql = format!(
        "SELECT v.{column} AS vec FROM {table}_{column}_vec v WHERE v.rowid = (SELECT rowid FROM {table} WHERE _id = ?)",
        table = config.name
    );
    let rows = query_rows(conn, &sql, &[SqlValue::Text(id.to_string())])
        .map_err(|f| f.into_error())?;
    match rows.first().and_then(|row| row.get_named("vec")) {
        Some(SqlValue::Blob(blob)) => Ok(Some(blob_to_vector(blob)?)),
        _ => Ok(None),
    }
}

/// Compare storage values with float tolerance so a REAL round trip does
/// not register as divergence.
fn storage_eq(a: &SqlValue, b: &SqlValue) -> bool {
    match (a, b) {
        (SqlValue::Real(x), SqlValue::Real(y)) => (x - y).abs() < f64::EPSILON,
        (SqlValue::Real(x), SqlValue::Integer(y)) | (SqlValue::Integer(y), SqlValue::Real(x)) => {
            (*x - *y as f64).abs() < f64::EPSILON
        }
        _ => a == b,
    }
}
