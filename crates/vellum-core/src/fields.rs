//! Constrained-field model: schema paths promoted to dedicated columns.
//!
//! A constrained field maps a dotted document path to a synthesized column
//! so SQL-level uniqueness, foreign keys, checks, and indexes apply. The
//! JSON body stays authoritative for reads; the columns are authoritative
//! for constraints. Coherence between the two is kept by triggers.

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::as_tagged_date;
use crate::errors::{VellumError, VellumResult};
use crate::schema::SchemaNode;

/// Storage class of a synthesized column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqliteType {
    Text,
    Integer,
    Real,
    Blob,
    /// Number array mirrored into a vec0 virtual table; the main-table
    /// column stores the JSON array text.
    Vector,
}

impl SqliteType {
    /// DDL keyword for the main-table column.
    pub fn ddl(self) -> &'static str {
        match self {
            SqliteType::Text | SqliteType::Vector => "TEXT",
            SqliteType::Integer => "INTEGER",
            SqliteType::Real => "REAL",
            SqliteType::Blob => "BLOB",
        }
    }
}

/// Element type of a vector column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VectorElement {
    #[default]
    Float32,
    Int8,
}

impl VectorElement {
    /// vec0 column type keyword.
    pub fn ddl(self) -> &'static str {
        match self {
            VectorElement::Float32 => "FLOAT",
            VectorElement::Int8 => "INT8",
        }
    }
}

/// Dimensions and element type of a VECTOR field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorSpec {
    pub dimensions: usize,
    pub element: VectorElement,
}

/// Referential action for foreign keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefAction {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

impl RefAction {
    pub fn ddl(self) -> &'static str {
        match self {
            RefAction::Cascade => "CASCADE",
            RefAction::SetNull => "SET NULL",
            RefAction::Restrict => "RESTRICT",
            RefAction::NoAction => "NO ACTION",
        }
    }
}

/// Foreign-key target: `table.column` plus referential actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub on_delete: Option<RefAction>,
    pub on_update: Option<RefAction>,
}

/// Definition of one constrained field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Explicit storage class; inferred from the schema when absent.
    pub sqlite_type: Option<SqliteType>,
    pub nullable: bool,
    pub unique: bool,
    pub foreign_key: Option<ForeignKey>,
    /// Raw check expression over field paths; paths are rewritten to
    /// column names when the DDL is emitted.
    pub check: Option<String>,
    pub vector: Option<VectorSpec>,
    pub index: bool,
    /// Optional partial-index WHERE clause (whitelist-validated).
    pub index_where: Option<String>,
}

impl Default for FieldDefinition {
    fn default() -> Self {
        FieldDefinition {
            sqlite_type: None,
            nullable: true,
            unique: false,
            foreign_key: None,
            check: None,
            vector: None,
            index: false,
            index_where: None,
        }
    }
}

impl FieldDefinition {
    pub fn text() -> Self {
        FieldDefinition {
            sqlite_type: Some(SqliteType::Text),
            ..Default::default()
        }
    }

    pub fn integer() -> Self {
        FieldDefinition {
            sqlite_type: Some(SqliteType::Integer),
            ..Default::default()
        }
    }

    pub fn real() -> Self {
        FieldDefinition {
            sqlite_type: Some(SqliteType::Real),
            ..Default::default()
        }
    }

    pub fn blob() -> Self {
        FieldDefinition {
            sqlite_type: Some(SqliteType::Blob),
            ..Default::default()
        }
    }

    pub fn vector(dimensions: usize) -> Self {
        FieldDefinition {
            sqlite_type: Some(SqliteType::Vector),
            vector: Some(VectorSpec {
                dimensions,
                element: VectorElement::Float32,
            }),
            ..Default::default()
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.foreign_key = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
            on_delete: None,
            on_update: None,
        });
        self
    }

    pub fn on_delete(mut self, action: RefAction) -> Self {
        if let Some(fk) = self.foreign_key.as_mut() {
            fk.on_delete = Some(action);
        }
        self
    }

    pub fn check(mut self, expr: impl Into<String>) -> Self {
        self.check = Some(expr.into());
        self
    }

    pub fn index_where(mut self, clause: impl Into<String>) -> Self {
        self.index_where = Some(clause.into());
        self
    }
}

/// Ordered map of constrained fields: dotted path → definition.
pub type ConstrainedFields = BTreeMap<String, FieldDefinition>;

/// Column name for a constrained path: dots become underscores.
pub fn column_name(path: &str) -> String {
    path.replace('.', "_")
}

/// Resolve the storage class for a field: the explicit definition wins,
/// otherwise it is inferred from the schema element type.
pub fn sqlite_type_of(node: Option<&SchemaNode>, def: &FieldDefinition) -> SqliteType {
    if let Some(ty) = def.sqlite_type {
        return ty;
    }
    if def.vector.is_some() {
        return SqliteType::Vector;
    }
    match node.map(SchemaNode::unwrap_wrappers) {
        Some(SchemaNode::String) => SqliteType::Text,
        Some(SchemaNode::Number) => SqliteType::Real,
        Some(SchemaNode::Integer) | Some(SchemaNode::Boolean) => SqliteType::Integer,
        Some(SchemaNode::Date) => SqliteType::Text,
        Some(SchemaNode::Array(elem)) => match elem.unwrap_wrappers() {
            SchemaNode::Number | SchemaNode::Integer => SqliteType::Vector,
            _ => SqliteType::Text,
        },
        _ => SqliteType::Text,
    }
}

/// Dotted-path lookup inside a document.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Extract `path → value` for every constrained field present in `doc`.
pub fn extract<'a>(
    doc: &'a Value,
    fields: &'a ConstrainedFields,
) -> Vec<(&'a str, &'a FieldDefinition, Option<&'a Value>)> {
    fields
        .iter()
        .map(|(path, def)| (path.as_str(), def, lookup_path(doc, path)))
        .collect()
}

/// A parameter value at the core/storage seam. The storage crate converts
/// these into driver-native bindings; nothing above it names driver types.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

/// Coerce a document value into its column representation.
///
/// Booleans become 0/1; dates become RFC 3339 TEXT; objects and arrays
/// (including VECTOR fields) are stored as JSON text.
pub fn to_storage(value: &Value, ty: SqliteType) -> VellumResult<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    if let Some(dt) = as_tagged_date(value) {
        return Ok(SqlValue::Text(dt.to_rfc3339_opts(SecondsFormat::Millis, true)));
    }
    match ty {
        SqliteType::Integer => match value {
            Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
            Value::Number(n) => n
                .as_i64()
                .map(SqlValue::Integer)
                .ok_or_else(|| VellumError::validation(format!("expected integer, got {n}"))),
            other => Err(VellumError::validation(format!(
                "cannot store {other} in an INTEGER column"
            ))),
        },
        SqliteType::Real => match value {
            Value::Number(n) => n
                .as_f64()
                .map(SqlValue::Real)
                .ok_or_else(|| VellumError::validation(format!("expected number, got {n}"))),
            other => Err(VellumError::validation(format!(
                "cannot store {other} in a REAL column"
            ))),
        },
        SqliteType::Text | SqliteType::Vector => match value {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
            other => Ok(SqlValue::Text(serde_json::to_string(other)?)),
        },
        SqliteType::Blob => match value {
            Value::String(s) => Ok(SqlValue::Blob(s.as_bytes().to_vec())),
            other => Err(VellumError::validation(format!(
                "cannot store {other} in a BLOB column"
            ))),
        },
    }
}

/// Inverse of `to_storage` for merging column values back into documents.
///
/// VECTOR text parses back into a JSON array. Booleans are *not* restored
/// here — a bare 0/1 heuristic would corrupt integer fields; the caller
/// applies schema-driven boolean restoration.
pub fn from_storage(value: SqlValue, ty: SqliteType) -> Value {
    match (ty, value) {
        (_, SqlValue::Null) => Value::Null,
        (SqliteType::Vector, SqlValue::Text(s)) | (SqliteType::Text, SqlValue::Text(s)) => {
            if s.starts_with('[') || s.starts_with('{') {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            } else {
                Value::String(s)
            }
        }
        (_, SqlValue::Integer(i)) => Value::from(i),
        (_, SqlValue::Real(f)) => Value::from(f),
        (_, SqlValue::Text(s)) => Value::String(s),
        (_, SqlValue::Blob(b)) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}
