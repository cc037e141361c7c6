//! INSERT / UPDATE / UPSERT / DELETE / atomic-operator translation.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::Value;

use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::fields::{
    column_name, lookup_path, sqlite_type_of, to_storage, ConstrainedFields, SqlValue,
};
use vellum_core::ident::{validate_identifier, IdentKind};
use vellum_core::schema::Schema;

use super::{value_to_param, SqlQuery};

/// Atomic document operators, folded into a single UPDATE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOperators {
    /// `$set`: path → new value.
    pub set: BTreeMap<String, Value>,
    /// `$inc`: path → numeric delta.
    pub inc: BTreeMap<String, Value>,
    /// `$push`: path → value appended to an array.
    pub push: BTreeMap<String, Value>,
}

impl UpdateOperators {
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(path.into(), value.into());
        self
    }

    pub fn inc(mut self, path: impl Into<String>, delta: impl Into<Value>) -> Self {
        self.inc.insert(path.into(), delta.into());
        self
    }

    pub fn push(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push.insert(path.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty() && self.push.is_empty()
    }
}

/// Coerced column parameters for one document, in field order.
pub fn column_params(
    doc: &Value,
    fields: &ConstrainedFields,
    schema: &Schema,
) -> VellumResult<Vec<SqlValue>> {
    let mut out = Vec::with_capacity(fields.len());
    for (path, def) in fields {
        let ty = sqlite_type_of(schema.resolve_path(path), def);
        match lookup_path(doc, path) {
            Some(value) => out.push(to_storage(value, ty)?),
            None => out.push(SqlValue::Null),
        }
    }
    Ok(out)
}

fn insert_columns(fields: &ConstrainedFields) -> (String, String) {
    let mut cols = String::from("_id, doc");
    let mut marks = String::from("?, ?");
    for path in fields.keys() {
        write!(cols, ", {}", column_name(path)).expect("writing to String");
        marks.push_str(", ?");
    }
    (cols, marks)
}

/// Single-row INSERT. Two-column when there are no constrained fields.
pub fn build_insert(
    table: &str,
    fields: &ConstrainedFields,
    id: &str,
    doc_text: &str,
    col_values: Vec<SqlValue>,
) -> VellumResult<SqlQuery> {
    validate_identifier(table, IdentKind::Table)?;
    let (cols, marks) = insert_columns(fields);
    let sql = format!("INSERT INTO {table} ({cols}) VALUES ({marks})");
    let mut params = Vec::with_capacity(2 + col_values.len());
    params.push(SqlValue::Text(id.to_string()));
    params.push(SqlValue::Text(doc_text.to_string()));
    params.extend(col_values);
    Ok(SqlQuery { sql, params })
}

/// Multi-row INSERT for bulk operations.
pub fn build_insert_many(
    table: &str,
    fields: &ConstrainedFields,
    rows: Vec<(String, String, Vec<SqlValue>)>,
) -> VellumResult<SqlQuery> {
    validate_identifier(table, IdentKind::Table)?;
    if rows.is_empty() {
        return Err(VellumError::validation("bulk insert of zero documents"));
    }
    let (cols, marks) = insert_columns(fields);
    let row_marks = format!("({marks})");
    let all_marks = vec![row_marks.as_str(); rows.len()].join(", ");
    let sql = format!("INSERT INTO {table} ({cols}) VALUES {all_marks}");
    let mut params = Vec::with_capacity(rows.len() * (2 + fields.len()));
    for (id, doc_text, col_values) in rows {
        params.push(SqlValue::Text(id));
        params.push(SqlValue::Text(doc_text));
        params.extend(col_values);
    }
    Ok(SqlQuery { sql, params })
}

/// Full-document UPDATE with version bump and optional optimistic guard.
pub fn build_update(
    table: &str,
    fields: &ConstrainedFields,
    id: &str,
    doc_text: &str,
    col_values: Vec<SqlValue>,
    expected_version: Option<i64>,
) -> VellumResult<SqlQuery> {
    validate_identifier(table, IdentKind::Table)?;
    let mut sql = format!("UPDATE {table} SET doc = ?");
    let mut params = Vec::with_capacity(3 + col_values.len());
    params.push(SqlValue::Text(doc_text.to_string()));
    for path in fields.keys() {
        write!(sql, ", {} = ?", column_name(path)).expect("writing to String");
    }
    params.extend(col_values);
    sql.push_str(", _version = _version + 1 WHERE _id = ?");
    params.push(SqlValue::Text(id.to_string()));
    if let Some(version) = expected_version {
        sql.push_str(" AND _version = ?");
        params.push(SqlValue::Integer(version));
    }
    Ok(SqlQuery { sql, params })
}

/// Version-preserving upsert.
///
/// Never `INSERT OR REPLACE`: REPLACE deletes and re-inserts the row, which
/// would reset `_version` and break version monotonicity.
pub fn build_upsert(
    table: &str,
    fields: &ConstrainedFields,
    id: &str,
    doc_text: &str,
    col_values: Vec<SqlValue>,
) -> VellumResult<SqlQuery> {
    validate_identifier(table, IdentKind::Table)?;
    let (cols, marks) = insert_columns(fields);
    let mut sql = format!(
        "INSERT INTO {table} ({cols}) VALUES ({marks}) ON CONFLICT(_id) DO UPDATE SET doc = excluded.doc, _version = {table}._version + 1"
    );
    for path in fields.keys() {
        let col = column_name(path);
        write!(sql, ", {col} = excluded.{col}").expect("writing to String");
    }
    let mut params = Vec::with_capacity(2 + col_values.len());
    params.push(SqlValue::Text(id.to_string()));
    params.push(SqlValue::Text(doc_text.to_string()));
    params.extend(col_values);
    Ok(SqlQuery { sql, params })
}

pub fn build_delete(table: &str, id: &str) -> VellumResult<SqlQuery> {
    validate_identifier(table, IdentKind::Table)?;
    Ok(SqlQuery {
        sql: format!("DELETE FROM {table} WHERE _id = ?"),
        params: vec![SqlValue::Text(id.to_string())],
    })
}

/// Fold `$set` / `$inc` / `$push` into one UPDATE over the JSON body,
/// mirroring affected top-level constrained columns, always bumping
/// `_version`, with an optional optimistic guard.
///
/// No prior read of the document is required — the expressions evaluate
/// against the stored row.
pub fn build_atomic_update(
    table: &str,
    fields: &ConstrainedFields,
    schema: &Schema,
    id: &str,
    ops: &UpdateOperators,
    expected_version: Option<i64>,
) -> VellumResult<SqlQuery> {
    validate_identifier(table, IdentKind::Table)?;
    if ops.is_empty() {
        return Err(VellumError::validation("atomic update with no operators"));
    }
    for path in ops.set.keys().chain(ops.inc.keys()).chain(ops.push.keys()) {
        vellum_core::ident::validate_field_path(path)?;
    }
    for (path, delta) in &ops.inc {
        if !delta.is_number() {
            return Err(VellumError::validation(format!(
                "$inc on '{path}' requires a numeric operand"
            )));
        }
    }

    let mut params = Vec::new();

    // The folded doc expression: json_set chains evaluated against the old
    // row, set → inc → push in deterministic path order.
    let mut doc_expr = String::from("doc");
    for (path, value) in &ops.set {
        let value_expr = json_value_expr(value, &mut params)?;
        doc_expr = format!("json_set({doc_expr}, '$.{path}', {value_expr})");
    }
    for (path, delta) in &ops.inc {
        params.push(value_to_param(delta)?);
        doc_expr = format!(
            "json_set({doc_expr}, '$.{path}', COALESCE(json_extract(doc, '$.{path}'), 0) + ?)"
        );
    }
    for (path, value) in &ops.push {
        let value_expr = json_value_expr(value, &mut params)?;
        doc_expr = format!(
            "json_set({doc_expr}, '$.{path}', json_insert(COALESCE(json_extract(doc, '$.{path}'), json_array()), '$[#]', {value_expr}))"
        );
    }

    let mut sql = format!("UPDATE {table} SET doc = {doc_expr}");

    // Mirror constrained columns touched by the operators.
    for (path, def) in fields {
        let col = column_name(path);
        if let Some(value) = ops.set.get(path) {
            let ty = sqlite_type_of(schema.resolve_path(path), def);
            write!(sql, ", {col} = ?").expect("writing to String");
            params.push(to_storage(value, ty)?);
        } else if let Some(delta) = ops.inc.get(path) {
            write!(sql, ", {col} = COALESCE({col}, 0) + ?").expect("writing to String");
            params.push(value_to_param(delta)?);
        } else if let Some(value) = ops.push.get(path) {
            let value_expr = json_value_expr(value, &mut params)?;
            write!(
                sql,
                ", {col} = json_insert(COALESCE({col}, json_array()), '$[#]', {value_expr})"
            )
            .expect("writing to String");
        }
    }

    sql.push_str(", _version = _version + 1 WHERE _id = ?");
    params.push(SqlValue::Text(id.to_string()));
    if let Some(version) = expected_version {
        sql.push_str(" AND _version = ?");
        params.push(SqlValue::Integer(version));
    }

    Ok(SqlQuery { sql, params })
}

/// Parameter expression for a JSON value inside `json_set`: scalars bind
/// directly, arrays and objects bind as text wrapped in `json(?)` so they
/// land as structure rather than a quoted string.
fn json_value_expr(value: &Value, params: &mut Vec<SqlValue>) -> VellumResult<String> {
    match value {
        Value::Array(_) | Value::Object(_) => {
            params.push(SqlValue::Text(serde_json::to_string(value)?));
            Ok("json(?)".to_string())
        }
        other => {
            params.push(value_to_param(other)?);
            Ok("?".to_string())
        }
    }
}
