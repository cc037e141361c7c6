//! Schema AST, path resolution, and structural document validation.
//!
//! A schema is a plain tree value — no runtime reflection. It drives three
//! things: SQLite type inference for synthesized columns, field-path
//! validation in the query builder, and boolean/date restoration when
//! column values are merged back into documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::as_tagged_date;
use crate::errors::{VellumError, VellumResult};

/// One node of the schema tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaNode {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    /// Accepts any JSON value.
    Any,
    Array(Box<SchemaNode>),
    Object(BTreeMap<String, SchemaNode>),
    /// Field may be absent.
    Optional(Box<SchemaNode>),
    /// Field may be JSON null.
    Nullable(Box<SchemaNode>),
    Union(Vec<SchemaNode>),
}

impl SchemaNode {
    pub fn optional(self) -> SchemaNode {
        SchemaNode::Optional(Box::new(self))
    }

    pub fn nullable(self) -> SchemaNode {
        SchemaNode::Nullable(Box::new(self))
    }

    pub fn array_of(elem: SchemaNode) -> SchemaNode {
        SchemaNode::Array(Box::new(elem))
    }

    /// Strip Optional/Nullable wrappers down to the element type.
    pub fn unwrap_wrappers(&self) -> &SchemaNode {
        match self {
            SchemaNode::Optional(inner) | SchemaNode::Nullable(inner) => inner.unwrap_wrappers(),
            other => other,
        }
    }

    /// Whether the unwrapped type is boolean.
    pub fn is_boolean(&self) -> bool {
        matches!(self.unwrap_wrappers(), SchemaNode::Boolean)
    }

    /// Whether the unwrapped type is a date.
    pub fn is_date(&self) -> bool {
        matches!(self.unwrap_wrappers(), SchemaNode::Date)
    }

    fn type_name(&self) -> &'static str {
        match self {
            SchemaNode::String => "string",
            SchemaNode::Number => "number",
            SchemaNode::Integer => "integer",
            SchemaNode::Boolean => "boolean",
            SchemaNode::Date => "date",
            SchemaNode::Any => "any",
            SchemaNode::Array(_) => "array",
            SchemaNode::Object(_) => "object",
            SchemaNode::Optional(inner) => inner.type_name(),
            SchemaNode::Nullable(inner) => inner.type_name(),
            SchemaNode::Union(_) => "union",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaNode::String => value.is_string(),
            SchemaNode::Number => value.is_number(),
            SchemaNode::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            SchemaNode::Boolean => value.is_boolean(),
            SchemaNode::Date => {
                as_tagged_date(value).is_some()
                    || value
                        .as_str()
                        .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            }
            SchemaNode::Any => true,
            SchemaNode::Array(elem) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| elem.matches(v))),
            SchemaNode::Object(fields) => match value.as_object() {
                None => false,
                Some(map) => fields.iter().all(|(name, node)| match map.get(name) {
                    Some(v) => node.unwrap_nullable_matches(v),
                    None => node.is_optional(),
                }),
            },
            SchemaNode::Optional(inner) => inner.matches(value),
            SchemaNode::Nullable(inner) => value.is_null() || inner.matches(value),
            SchemaNode::Union(branches) => branches.iter().any(|b| b.matches(value)),
        }
    }

    fn unwrap_nullable_matches(&self, value: &Value) -> bool {
        match self {
            // Storage round trips surface absent optional fields as null,
            // so Optional accepts null as well as absence.
            SchemaNode::Optional(inner) => {
                value.is_null() || inner.unwrap_nullable_matches(value)
            }
            SchemaNode::Nullable(inner) => value.is_null() || inner.unwrap_nullable_matches(value),
            other => other.matches(value),
        }
    }

    fn is_optional(&self) -> bool {
        match self {
            SchemaNode::Optional(_) => true,
            SchemaNode::Nullable(inner) => inner.is_optional(),
            _ => false,
        }
    }
}

/// A collection schema: the root is always an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    root: SchemaNode,
}

impl Schema {
    /// Build a schema from root fields. Panics if handed a non-object root —
    /// construction-time misuse, not a runtime condition.
    pub fn new(root: SchemaNode) -> Schema {
        assert!(
            matches!(root, SchemaNode::Object(_)),
            "schema root must be an object"
        );
        Schema { root }
    }

    /// Convenience constructor from `(name, node)` pairs.
    pub fn object<I, S>(fields: I) -> Schema
    where
        I: IntoIterator<Item = (S, SchemaNode)>,
        S: Into<String>,
    {
        let map = fields
            .into_iter()
            .map(|(name, node)| (name.into(), node))
            .collect();
        Schema {
            root: SchemaNode::Object(map),
        }
    }

    pub fn root(&self) -> &SchemaNode {
        &self.root
    }

    /// Names of the root-level fields.
    pub fn root_field_names(&self) -> Vec<&str> {
        match &self.root {
            SchemaNode::Object(fields) => fields.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Resolve a dotted path to its element type, descending through
    /// Optional/Nullable wrappers. Returns `None` for unknown paths.
    pub fn resolve_path(&self, path: &str) -> Option<&SchemaNode> {
        let mut node = &self.root;
        for segment in path.split('.') {
            node = match node.unwrap_wrappers() {
                SchemaNode::Object(fields) => fields.get(segment)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Structurally validate a document against this schema.
    ///
    /// Unknown root fields other than the engine-managed `_id` and
    /// `_version` are rejected.
    pub fn validate(&self, doc: &Value) -> VellumResult<()> {
        let map = doc
            .as_object()
            .ok_or_else(|| VellumError::validation("document must be a JSON object"))?;

        let fields = match &self.root {
            SchemaNode::Object(fields) => fields,
            _ => return Ok(()),
        };

        for (name, value) in map {
            if name == "_id" || name == "_version" {
                continue;
            }
            let node = fields.get(name).ok_or_else(|| {
                VellumError::validation(format!("unknown field '{name}' not in schema"))
            })?;
            if !node.unwrap_nullable_matches(value) {
                return Err(VellumError::validation(format!(
                    "field '{name}' does not match schema type '{}'",
                    node.type_name()
                )));
            }
        }

        for (name, node) in fields {
            if !map.contains_key(name) && !node.is_optional() {
                return Err(VellumError::validation(format!(
                    "required field '{name}' is missing"
                )));
            }
        }

        Ok(())
    }
}
