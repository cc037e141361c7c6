//! Vector statement translation: vec0 maintenance and KNN search.
//!
//! The vec0 virtual table keys rows by the main table's rowid, so every
//! statement routes `_id → rowid` through the main table.

use std::fmt::Write as _;

use vellum_core::errors::VellumResult;
use vellum_core::fields::SqlValue;
use vellum_core::ident::{validate_identifier, IdentKind};

use crate::ddl::vector_table_name;
use crate::ir::{GroupKind, QueryOptions};

use super::{render_nodes, QueryContext, SqlQuery, TableCatalog, TableMeta};

/// Insert one vector for a document. The blob must own its bytes — it is
/// bound directly as the vec0 column value.
pub fn build_vector_insert(
    table: &str,
    column: &str,
    id: &str,
    blob: Vec<u8>,
) -> VellumResult<SqlQuery> {
    validate_identifier(table, IdentKind::Table)?;
    validate_identifier(column, IdentKind::Column)?;
    let vec_table = vector_table_name(table, column);
    Ok(SqlQuery {
        sql: format!(
            "INSERT INTO {vec_table} (rowid, {column}) SELECT rowid, ? FROM {table} WHERE _id = ?"
        ),
        params: vec![SqlValue::Blob(blob), SqlValue::Text(id.to_string())],
    })
}

/// Remove a document's vector row, if any.
pub fn build_vector_delete(table: &str, column: &str, id: &str) -> VellumResult<SqlQuery> {
    validate_identifier(table, IdentKind::Table)?;
    validate_identifier(column, IdentKind::Column)?;
    let vec_table = vector_table_name(table, column);
    Ok(SqlQuery {
        sql: format!(
            "DELETE FROM {vec_table} WHERE rowid IN (SELECT rowid FROM {table} WHERE _id = ?)"
        ),
        params: vec![SqlValue::Text(id.to_string())],
    })
}

/// KNN search joined back to the document table, ascending by distance.
pub fn build_vector_search(
    base: TableMeta<'_>,
    column: &str,
    blob: Vec<u8>,
    k: u64,
    filter: Option<&QueryOptions>,
    catalog: &dyn TableCatalog,
) -> VellumResult<SqlQuery> {
    validate_identifier(base.table, IdentKind::Table)?;
    validate_identifier(column, IdentKind::Column)?;
    let t = base.table;
    let vec_table = vector_table_name(t, column);

    let mut sql = format!(
        "SELECT {t}._id AS _id, {t}.doc AS doc, {t}._version AS _version, v.distance AS distance FROM {vec_table} v JOIN {t} ON {t}.rowid = v.rowid WHERE v.{column} MATCH ? AND k = ?"
    );
    let mut params = vec![SqlValue::Blob(blob), SqlValue::Integer(k as i64)];

    if let Some(options) = filter {
        if !options.filters.is_empty() {
            let ctx = QueryContext::single(base);
            let clause =
                render_nodes(&ctx, &options.filters, GroupKind::And, catalog, &mut params)?;
            write!(sql, " AND ({clause})").expect("writing to String");
        }
    }

    sql.push_str(" ORDER BY v.distance ASC");
    Ok(SqlQuery { sql, params })
}
