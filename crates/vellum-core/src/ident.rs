//! SQL identifier, field-path, and file-path validation.
//!
//! Every identifier that is interpolated into emitted DDL/DML must pass
//! through this module first. Failures are `VellumError::Validation` —
//! this layer never panics.

use crate::errors::{VellumError, VellumResult};

/// Maximum length accepted for any single identifier or path segment chain.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// What an identifier is used as, for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentKind {
    Table,
    Column,
    Index,
    Trigger,
}

impl IdentKind {
    fn label(self) -> &'static str {
        match self {
            IdentKind::Table => "table",
            IdentKind::Column => "column",
            IdentKind::Index => "index",
            IdentKind::Trigger => "trigger",
        }
    }
}

/// SQL reserved words rejected as collection names.
///
/// Using one as a table name would require quoting everywhere and invites
/// injection-adjacent mistakes, so they are rejected outright.
const RESERVED_WORDS: &[&str] = &[
    "abort", "action", "add", "after", "all", "alter", "analyze", "and", "as", "asc", "attach",
    "autoincrement", "before", "begin", "between", "by", "cascade", "case", "cast", "check",
    "collate", "column", "commit", "conflict", "constraint", "create", "cross", "current",
    "current_date", "current_time", "current_timestamp", "database", "default", "deferrable",
    "deferred", "delete", "desc", "detach", "distinct", "do", "drop", "each", "else", "end",
    "escape", "except", "exclude", "exclusive", "exists", "explain", "fail", "filter", "first",
    "following", "for", "foreign", "from", "full", "generated", "glob", "group", "groups",
    "having", "if", "ignore", "immediate", "in", "index", "indexed", "initially", "inner",
    "insert", "instead", "intersect", "into", "is", "isnull", "join", "key", "last", "left",
    "like", "limit", "match", "natural", "no", "not", "nothing", "notnull", "null", "nulls",
    "of", "offset", "on", "or", "order", "others", "outer", "over", "partition", "plan",
    "pragma", "preceding", "primary", "query", "raise", "range", "recursive", "references",
    "regexp", "reindex", "release", "rename", "replace", "restrict", "right", "rollback",
    "row", "rows", "savepoint", "select", "set", "table", "temp", "temporary", "then", "ties",
    "to", "transaction", "trigger", "unbounded", "union", "unique", "update", "using", "vacuum",
    "values", "view", "virtual", "when", "where", "window", "with", "without",
];

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn check_ident(s: &str, what: &str) -> VellumResult<()> {
    if s.is_empty() {
        return Err(VellumError::validation(format!("{what} name is empty")));
    }
    if s.len() > MAX_IDENTIFIER_LEN {
        return Err(VellumError::validation(format!(
            "{what} name '{s}' exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap();
    if !is_ident_start(first) {
        return Err(VellumError::validation(format!(
            "{what} name '{s}' must start with a letter or underscore"
        )));
    }
    if let Some(bad) = chars.find(|c| !is_ident_char(*c)) {
        return Err(VellumError::validation(format!(
            "{what} name '{s}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

/// Validate a bare SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`, length ≤ 128).
pub fn validate_identifier(s: &str, kind: IdentKind) -> VellumResult<()> {
    check_ident(s, kind.label())
}

/// Validate a dotted document field path: identifier segments joined by `.`.
pub fn validate_field_path(path: &str) -> VellumResult<()> {
    if path.is_empty() {
        return Err(VellumError::validation("field path is empty"));
    }
    if path.len() > MAX_IDENTIFIER_LEN {
        return Err(VellumError::validation(format!(
            "field path '{path}' exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    for segment in path.split('.') {
        check_ident(segment, "field path segment")?;
    }
    Ok(())
}

/// Validate a collection name: identifier grammar plus a reserved-word check.
pub fn validate_collection_name(s: &str) -> VellumResult<()> {
    check_ident(s, "collection")?;
    if RESERVED_WORDS.binary_search(&s.to_ascii_lowercase().as_str()).is_ok() {
        return Err(VellumError::validation(format!(
            "collection name '{s}' is a reserved SQL word"
        )));
    }
    Ok(())
}

/// Validate a database file path.
///
/// `:memory:` is always accepted. Otherwise the path must not contain SQL
/// comment/terminator sequences, null bytes, or shell metacharacters.
pub fn validate_database_path(path: &str) -> VellumResult<()> {
    if path == ":memory:" {
        return Ok(());
    }
    if path.is_empty() {
        return Err(VellumError::validation("database path is empty"));
    }
    if path.contains('\0') {
        return Err(VellumError::validation("database path contains a null byte"));
    }
    for forbidden in ["--", ";", "/*", "*/"] {
        if path.contains(forbidden) {
            return Err(VellumError::validation(format!(
                "database path contains forbidden sequence '{forbidden}'"
            )));
        }
    }
    const SHELL_META: &[char] = &['|', '&', '$', '`', '<', '>', '!', '*', '?', '"', '\''];
    if let Some(bad) = path.chars().find(|c| SHELL_META.contains(c)) {
        return Err(VellumError::validation(format!(
            "database path contains shell metacharacter '{bad}'"
        )));
    }
    Ok(())
}
