//! Table DDL generation: main table, vec0 virtual tables, indexes, and the
//! coherence triggers that keep synthesized columns and the JSON body in
//! sync.
//!
//! Constrained columns are the authoritative in-row representation for SQL
//! constraints and indexing; the JSON body is authoritative for caller
//! reads. The AFTER INSERT / AFTER UPDATE OF triggers rewrite `doc` from
//! the columns so the two can never drift on a committed row.

use std::fmt::Write as _;

use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::fields::{column_name, sqlite_type_of, ConstrainedFields, SqliteType};
use vellum_core::ident::{validate_field_path, validate_identifier, IdentKind};
use vellum_core::schema::Schema;

/// Generated DDL for one collection: the primary CREATE TABLE plus ordered
/// auxiliary statements (virtual tables, indexes, triggers).
#[derive(Debug, Clone, PartialEq)]
pub struct TableSql {
    pub create_table: String,
    pub auxiliary: Vec<String>,
}

impl TableSql {
    /// All statements in execution order.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.create_table.as_str())
            .chain(self.auxiliary.iter().map(String::as_str))
    }
}

/// Name of the vec0 virtual table backing a VECTOR column.
pub fn vector_table_name(table: &str, column: &str) -> String {
    format!("{table}_{column}_vec")
}

/// Trigger names for a collection, so migrations can drop and recreate.
pub fn trigger_names(table: &str) -> [String; 2] {
    [format!("{table}_doc_ai"), format!("{table}_doc_au")]
}

/// Build the complete DDL for a collection table.
pub fn build_table_sql(
    table: &str,
    fields: &ConstrainedFields,
    schema: &Schema,
) -> VellumResult<TableSql> {
    validate_identifier(table, IdentKind::Table)?;

    let mut columns: Vec<(String, SqliteType, &str)> = Vec::with_capacity(fields.len());
    for (path, def) in fields {
        validate_field_path(path)?;
        let col = column_name(path);
        validate_identifier(&col, IdentKind::Column)?;
        let ty = sqlite_type_of(schema.resolve_path(path), def);
        if ty == SqliteType::Vector && def.vector.is_none() {
            return Err(VellumError::validation(format!(
                "field '{path}' is a VECTOR column but has no dimensions"
            )));
        }
        columns.push((col, ty, path.as_str()));
    }

    let mut create = format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    _id TEXT PRIMARY KEY,\n    doc TEXT NOT NULL,\n    _version INTEGER NOT NULL DEFAULT 1"
    );
    for ((col, ty, _), def) in columns.iter().zip(fields.values()) {
        write!(create, ",\n    {col} {}", ty.ddl()).expect("writing to String");
        if !def.nullable {
            create.push_str(" NOT NULL");
        }
        if let Some(check) = &def.check {
            let rewritten = rewrite_check_expr(check, fields)?;
            write!(create, " CHECK ({rewritten})").expect("writing to String");
        }
        if let Some(fk) = &def.foreign_key {
            validate_identifier(&fk.table, IdentKind::Table)?;
            validate_identifier(&fk.column, IdentKind::Column)?;
            write!(create, " REFERENCES {}({})", fk.table, fk.column).expect("writing to String");
            if let Some(action) = fk.on_delete {
                write!(create, " ON DELETE {}", action.ddl()).expect("writing to String");
            }
            if let Some(action) = fk.on_update {
                write!(create, " ON UPDATE {}", action.ddl()).expect("writing to String");
            }
        }
    }
    create.push_str("\n)");

    let mut auxiliary = Vec::new();

    // 1. vec0 virtual tables.
    for ((col, ty, path), def) in columns.iter().zip(fields.values()) {
        if *ty != SqliteType::Vector {
            continue;
        }
        let spec = def.vector.ok_or_else(|| {
            VellumError::validation(format!("field '{path}' is missing vector dimensions"))
        })?;
        if spec.dimensions == 0 {
            return Err(VellumError::validation(format!(
                "field '{path}' declares zero vector dimensions"
            )));
        }
        let vec_table = vector_table_name(table, col);
        validate_identifier(&vec_table, IdentKind::Table)?;
        auxiliary.push(format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {vec_table} USING vec0({col} {}[{}])",
            spec.element.ddl(),
            spec.dimensions
        ));
    }

    // 2. Plain indexes.
    for ((col, _, _), def) in columns.iter().zip(fields.values()) {
        if !def.index || def.unique {
            continue;
        }
        let index_name = format!("idx_{table}_{col}");
        validate_identifier(&index_name, IdentKind::Index)?;
        let mut stmt = format!("CREATE INDEX IF NOT EXISTS {index_name} ON {table}({col})");
        if let Some(clause) = &def.index_where {
            validate_partial_index_where(clause)?;
            write!(stmt, " WHERE {clause}").expect("writing to String");
        }
        auxiliary.push(stmt);
    }

    // 3. Unique indexes.
    for ((col, _, _), def) in columns.iter().zip(fields.values()) {
        if !def.unique {
            continue;
        }
        let index_name = format!("idx_{table}_{col}_unique");
        validate_identifier(&index_name, IdentKind::Index)?;
        auxiliary.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {index_name} ON {table}({col})"
        ));
    }

    // 4. Coherence triggers.
    if !columns.is_empty() {
        let rewrite = doc_rewrite_expr(&columns);
        let [ai, au] = trigger_names(table);
        auxiliary.push(format!(
            "CREATE TRIGGER IF NOT EXISTS {ai} AFTER INSERT ON {table}\nBEGIN\n    UPDATE {table} SET doc = {rewrite} WHERE rowid = NEW.rowid;\nEND"
        ));
        let update_of = columns
            .iter()
            .map(|(col, _, _)| col.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        auxiliary.push(format!(
            "CREATE TRIGGER IF NOT EXISTS {au} AFTER UPDATE OF {update_of} ON {table}\nBEGIN\n    UPDATE {table} SET doc = {rewrite} WHERE rowid = NEW.rowid;\nEND"
        ));
    }

    Ok(TableSql {
        create_table: create,
        auxiliary,
    })
}

/// The folded `json_set` expression rewriting `doc` from column values.
///
/// A SQL NULL argument would null the entire `json_set` result, so every
/// column expression is guarded.
fn doc_rewrite_expr(columns: &[(String, SqliteType, &str)]) -> String {
    let mut expr = String::from("json_set(COALESCE(NEW.doc, '{}')");
    for (col, ty, path) in columns {
        let value_expr = match ty {
            SqliteType::Integer | SqliteType::Real => format!("NEW.{col}"),
            SqliteType::Text | SqliteType::Vector => format!(
                "CASE WHEN json_valid(NEW.{col}) THEN json(NEW.{col}) ELSE json_quote(NEW.{col}) END"
            ),
            SqliteType::Blob => format!("json_quote(hex(NEW.{col}))"),
        };
        write!(
            expr,
            ", '$.{path}', CASE WHEN NEW.{col} IS NULL THEN json('null') ELSE {value_expr} END"
        )
        .expect("writing to String");
    }
    expr.push(')');
    expr
}

/// Rewrite bare field-path tokens in a check expression to their column
/// names, leaving everything else untouched.
fn rewrite_check_expr(expr: &str, fields: &ConstrainedFields) -> VellumResult<String> {
    for forbidden in [";", "--", "/*", "*/"] {
        if expr.contains(forbidden) {
            return Err(VellumError::validation(format!(
                "check expression contains forbidden sequence '{forbidden}'"
            )));
        }
    }

    let mut out = String::with_capacity(expr.len());
    let mut chars = expr.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = start + c.len_utf8();
            while let Some(&(i, nc)) = chars.peek() {
                if nc.is_ascii_alphanumeric() || nc == '_' || nc == '.' {
                    end = i + nc.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let token = &expr[start..end];
            if fields.contains_key(token) {
                out.push_str(&column_name(token));
            } else {
                out.push_str(token);
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Whitelist grammar for partial-index WHERE clauses: no quotes, no
/// semicolons, no comments, restricted character set.
fn validate_partial_index_where(clause: &str) -> VellumResult<()> {
    for forbidden in [";", "--", "/*", "*/", "'", "\""] {
        if clause.contains(forbidden) {
            return Err(VellumError::validation(format!(
                "partial index WHERE contains forbidden sequence '{forbidden}'"
            )));
        }
    }
    let allowed = |c: char| {
        c.is_ascii_alphanumeric() || c.is_ascii_whitespace() || "_.<>=!()+-*/%,".contains(c)
    };
    if let Some(bad) = clause.chars().find(|c| !allowed(*c)) {
        return Err(VellumError::validation(format!(
            "partial index WHERE contains invalid character '{bad}'"
        )));
    }
    Ok(())
}
