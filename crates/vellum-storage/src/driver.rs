//! Driver adapter over rusqlite: parameter binding, row materialization,
//! prepared-statement caching, and error classification.
//!
//! All statements go through `prepare_cached`; the per-connection cache is
//! capped at [`STATEMENT_CACHE_CAPACITY`] entries and rusqlite finalizes
//! statements as they are evicted.

use rusqlite::types::Value as RusqliteValue;
use rusqlite::Connection;

use vellum_core::errors::VellumError;
use vellum_core::fields::SqlValue;

/// Prepared-statement LRU capacity per connection.
pub const STATEMENT_CACHE_CAPACITY: usize = 100;

/// Which constraint a failed statement violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Unique/primary-key violation; carries the offending `table.column`
    /// when the driver message names it.
    Unique(Option<String>),
    ForeignKey,
    Check(String),
    NotNull(Option<String>),
}

/// Classification of a driver error, per the engine failure model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The connection or database handle is closed — benign at shutdown.
    Closed,
    /// Lock contention or timeout; a retry may succeed.
    Busy,
    Constraint(ConstraintKind),
    Other,
}

/// A classified driver failure.
#[derive(Debug, Clone)]
pub struct StorageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StorageFailure {
    pub fn new(error: &rusqlite::Error) -> StorageFailure {
        StorageFailure {
            kind: classify_error(error),
            message: error.to_string(),
        }
    }

    /// Map to the public taxonomy without document context.
    pub fn into_error(self) -> VellumError {
        self.into_error_for_id("")
    }

    /// Map to the public taxonomy, attributing constraint failures to the
    /// document being written.
    pub fn into_error_for_id(self, id: &str) -> VellumError {
        match self.kind {
            FailureKind::Closed => VellumError::Closed,
            FailureKind::Busy => VellumError::Database(format!("database is busy: {}", self.message)),
            FailureKind::Constraint(ConstraintKind::Unique(column)) => {
                let field = column
                    .and_then(|c| c.rsplit('.').next().map(str::to_string))
                    .unwrap_or_else(|| "_id".to_string());
                VellumError::UniqueConstraint {
                    field,
                    id: id.to_string(),
                }
            }
            FailureKind::Constraint(ConstraintKind::ForeignKey) => VellumError::Validation(
                format!("foreign key constraint failed for document '{id}'"),
            ),
            FailureKind::Constraint(ConstraintKind::Check(detail)) => {
                VellumError::CheckConstraint(detail)
            }
            FailureKind::Constraint(ConstraintKind::NotNull(column)) => {
                VellumError::Validation(match column {
                    Some(col) => format!("NOT NULL constraint failed on {col}"),
                    None => "NOT NULL constraint failed".to_string(),
                })
            }
            FailureKind::Other => VellumError::Database(self.message),
        }
    }
}

impl From<rusqlite::Error> for StorageFailure {
    fn from(error: rusqlite::Error) -> Self {
        StorageFailure::new(&error)
    }
}

/// Classify a rusqlite error by code and message.
pub fn classify_error(error: &rusqlite::Error) -> FailureKind {
    use rusqlite::ErrorCode;

    let message = error.to_string();
    if let rusqlite::Error::SqliteFailure(inner, _) = error {
        match inner.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => return FailureKind::Busy,
            ErrorCode::ConstraintViolation => {
                if let Some(rest) = message.split("UNIQUE constraint failed: ").nth(1) {
                    return FailureKind::Constraint(ConstraintKind::Unique(Some(
                        rest.trim().to_string(),
                    )));
                }
                if message.contains("FOREIGN KEY constraint failed") {
                    return FailureKind::Constraint(ConstraintKind::ForeignKey);
                }
                if let Some(rest) = message.split("CHECK constraint failed: ").nth(1) {
                    return FailureKind::Constraint(ConstraintKind::Check(rest.trim().to_string()));
                }
                if let Some(rest) = message.split("NOT NULL constraint failed: ").nth(1) {
                    return FailureKind::Constraint(ConstraintKind::NotNull(Some(
                        rest.trim().to_string(),
                    )));
                }
                return FailureKind::Constraint(ConstraintKind::Unique(None));
            }
            ErrorCode::CannotOpen => return FailureKind::Closed,
            _ => {}
        }
    }
    let lower = message.to_ascii_lowercase();
    if lower.contains("closed") {
        FailureKind::Closed
    } else if lower.contains("busy") || lower.contains("locked") || lower.contains("timeout") {
        FailureKind::Busy
    } else {
        FailureKind::Other
    }
}

fn to_rusqlite(value: &SqlValue) -> RusqliteValue {
    match value {
        SqlValue::Null => RusqliteValue::Null,
        SqlValue::Integer(i) => RusqliteValue::Integer(*i),
        SqlValue::Real(f) => RusqliteValue::Real(*f),
        SqlValue::Text(s) => RusqliteValue::Text(s.clone()),
        SqlValue::Blob(b) => RusqliteValue::Blob(b.clone()),
    }
}

fn from_rusqlite(value: RusqliteValue) -> SqlValue {
    match value {
        RusqliteValue::Null => SqlValue::Null,
        RusqliteValue::Integer(i) => SqlValue::Integer(i),
        RusqliteValue::Real(f) => SqlValue::Real(f),
        RusqliteValue::Text(s) => SqlValue::Text(s),
        RusqliteValue::Blob(b) => SqlValue::Blob(b),
    }
}

/// One materialized result row: column names plus values.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: std::sync::Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn get_named(&self, name: &str) -> Option<&SqlValue> {
        let index = self.columns.iter().position(|c| c == name)?;
        self.values.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get_named(name) {
            Some(SqlValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.get_named(name) {
            Some(SqlValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn real(&self, name: &str) -> Option<f64> {
        match self.get_named(name) {
            Some(SqlValue::Real(f)) => Some(*f),
            Some(SqlValue::Integer(i)) => Some(*i as f64),
            _ => None,
        }
    }
}

/// Execute a statement, returning the affected row count.
pub fn exec(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<usize, StorageFailure> {
    let mut stmt = conn.prepare_cached(sql)?;
    let bound = params.iter().map(to_rusqlite).collect::<Vec<_>>();
    let changed = stmt.execute(rusqlite::params_from_iter(bound))?;
    Ok(changed)
}

/// Run a query, materializing every row.
pub fn query_rows(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<SqlRow>, StorageFailure> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: std::sync::Arc<Vec<String>> = std::sync::Arc::new(
        stmt.column_names().iter().map(|c| c.to_string()).collect(),
    );
    let bound = params.iter().map(to_rusqlite).collect::<Vec<_>>();
    let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(from_rusqlite(row.get::<_, RusqliteValue>(i)?));
        }
        out.push(SqlRow {
            columns: std::sync::Arc::clone(&columns),
            values,
        });
    }
    Ok(out)
}

/// Configure the per-connection prepared-statement cache.
pub fn configure_statement_cache(conn: &Connection) {
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
}

/// Default chunk size for keyset streaming.
pub const KEYSET_CHUNK: usize = 256;

/// Chunked keyset streaming over a statement.
///
/// The statement must compare its cursor column against a trailing `?`
/// placeholder and order by that column, e.g.
/// `... WHERE _id > ? ORDER BY _id LIMIT 256`. Each chunk re-executes the
/// statement with the cursor advanced to the last row seen, so rows
/// inserted or deleted between chunks are never skipped past or returned
/// twice — unlike OFFSET windows, whose row numbering shifts under
/// concurrent writes.
pub struct KeysetRows {
    sql: String,
    leading_params: Vec<SqlValue>,
    cursor_column: String,
    cursor: SqlValue,
    chunk: usize,
    buffer: std::collections::VecDeque<SqlRow>,
    done: bool,
}

/// Start a keyset stream. `leading_params` bind before the cursor
/// placeholder; the projected rows must include `cursor_column` so the
/// cursor can advance.
pub fn query_iter(
    sql: impl Into<String>,
    leading_params: Vec<SqlValue>,
    cursor_column: impl Into<String>,
    initial_cursor: SqlValue,
    chunk: usize,
) -> KeysetRows {
    KeysetRows {
        sql: sql.into(),
        leading_params,
        cursor_column: cursor_column.into(),
        cursor: initial_cursor,
        chunk,
        buffer: std::collections::VecDeque::new(),
        done: false,
    }
}

impl KeysetRows {
    /// Next row, fetching the next chunk when the buffer drains. Returns
    /// `None` once the stream is exhausted.
    pub fn next_row(&mut self, conn: &Connection) -> Result<Option<SqlRow>, StorageFailure> {
        if self.buffer.is_empty() && !self.done {
            self.fetch(conn)?;
        }
        Ok(self.buffer.pop_front())
    }

    fn fetch(&mut self, conn: &Connection) -> Result<(), StorageFailure> {
        let mut params = self.leading_params.clone();
        params.push(self.cursor.clone());
        let rows = query_rows(conn, &self.sql, &params)?;
        if rows.len() < self.chunk {
            self.done = true;
        }
        match rows.last().and_then(|row| row.get_named(&self.cursor_column)) {
            Some(value) => self.cursor = value.clone(),
            // A missing cursor column cannot advance; stop rather than
            // refetch the same chunk forever.
            None => self.done = true,
        }
        self.buffer.extend(rows);
        Ok(())
    }
}
