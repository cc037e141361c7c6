//! Schema synchronization and version-keyed upgrades.
//!
//! Versions live in the internal `_schema_versions` table, one row per
//! collection. Opening a collection creates or diffs its table inside a
//! transaction, runs the seed on a fresh table, and walks the upgrade map
//! for every version between the stored and the requested one. Failures
//! are retained per collection and surfaced by `wait_for_initialization`.

use std::collections::BTreeSet;

use rusqlite::Connection;
use serde_json::Value;
use tracing::info;

use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::fields::{column_name, sqlite_type_of, SqlValue};
use vellum_query::ddl::{build_table_sql, trigger_names, vector_table_name};
use vellum_storage::driver::{exec, query_rows, SqlRow};
use vellum_storage::txn::{run_in_transaction, TxnBehavior};

use crate::collection::{CollectionConfig, Upgrade};
use crate::ops;

/// Internal version-tracking table.
const SCHEMA_VERSIONS_DDL: &str = "CREATE TABLE IF NOT EXISTS _schema_versions (
    collection TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)";

/// Terminal state of a collection's initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Ready,
    Failed(String),
}

/// One collection's migration outcome, cached per database instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub collection: String,
    pub from_version: u32,
    pub to_version: u32,
    pub state: MigrationState,
}

/// Context handed to upgrade steps and seed functions. Everything runs
/// inside the migration transaction.
pub struct UpgradeContext<'a> {
    conn: &'a mut Connection,
    config: &'a CollectionConfig,
    pub from_version: u32,
    pub to_version: u32,
}

impl UpgradeContext<'_> {
    pub fn collection(&self) -> &str {
        &self.config.name
    }

    pub fn exec(&mut self, sql: &str, params: &[SqlValue]) -> VellumResult<usize> {
        exec(self.conn, sql, params).map_err(|f| f.into_error())
    }

    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> VellumResult<Vec<SqlRow>> {
        query_rows(self.conn, sql, params).map_err(|f| f.into_error())
    }

    /// Insert a document into the collection being migrated.
    pub fn insert(&mut self, doc: Value) -> VellumResult<Value> {
        ops::write::insert(self.conn, self.config, doc)
    }
}

/// Bring one collection's physical shape and version up to its config.
/// Returns `(from_version, to_version)`.
pub fn ensure_collection(
    conn: &mut Connection,
    config: &CollectionConfig,
) -> VellumResult<(u32, u32)> {
    exec(conn, SCHEMA_VERSIONS_DDL, &[]).map_err(|f| f.into_error())?;

    let table_existed = table_exists(conn, &config.name)?;
    let stored = stored_version(conn, &config.name)?;

    run_in_transaction(conn, TxnBehavior::Immediate, |conn| {
        let ddl = build_table_sql(&config.name, &config.fields, &config.schema)?;
        exec(conn, &ddl.create_table, &[]).map_err(|f| f.into_error())?;

        if table_existed {
            sync_columns(conn, config)?;
            sync_indexes(conn, config)?;
        }
        // Triggers are dropped and recreated so the rewrite expression
        // always matches the current field set.
        for trigger in trigger_names(&config.name) {
            exec(conn, &format!("DROP TRIGGER IF EXISTS {trigger}"), &[])
                .map_err(|f| f.into_error())?;
        }
        for statement in &ddl.auxiliary {
            exec(conn, statement, &[]).map_err(|f| f.into_error())?;
        }

        match stored {
            None if !table_existed => {
                if let Some(seed) = &config.seed {
                    info!(collection = %config.name, "running seed for new collection");
                    let mut ctx = UpgradeContext {
                        conn: &mut *conn,
                        config,
                        from_version: 0,
                        to_version: config.version,
                    };
                    seed(&mut ctx)?;
                }
                set_stored_version(conn, &config.name, config.version)?;
                Ok((0, config.version))
            }
            maybe_stored => {
                // A table without a version row predates version tracking.
                let from = maybe_stored.unwrap_or(1);
                if from > config.version {
                    return Err(VellumError::Migration(format!(
                        "collection '{}' is at version {from}, newer than requested {}",
                        config.name, config.version
                    )));
                }
                for version in (from + 1)..=config.version {
                    run_upgrade(conn, config, from, version)?;
                }
                if from != config.version {
                    info!(
                        collection = %config.name,
                        from,
                        to = config.version,
                        "collection schema migration complete"
                    );
                }
                set_stored_version(conn, &config.name, config.version)?;
                Ok((from, config.version))
            }
        }
    })
}

fn run_upgrade(
    conn: &mut Connection,
    config: &CollectionConfig,
    from: u32,
    version: u32,
) -> VellumResult<()> {
    let Some(upgrade) = config.upgrades.get(&version) else {
        return Ok(());
    };
    let mut ctx = UpgradeContext {
        conn,
        config,
        from_version: from,
        to_version: version,
    };
    match upgrade {
        Upgrade::Run(migrate) => migrate(&mut ctx),
        Upgrade::Conditional { condition, migrate } => {
            if condition(&mut ctx)? {
                migrate(&mut ctx)
            } else {
                Ok(())
            }
        }
    }
    .map_err(|e| VellumError::Migration(format!(
        "upgrade to version {version} of '{}' failed: {e}",
        config.name
    )))
}

fn table_exists(conn: &mut Connection, table: &str) -> VellumResult<bool> {
    let rows = query_rows(
        conn,
        "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?",
        &[SqlValue::Text(table.to_string())],
    )
    .map_err(|f| f.into_error())?;
    Ok(rows.first().and_then(|r| r.integer("n")).unwrap_or(0) > 0)
}

fn stored_version(conn: &mut Connection, collection: &str) -> VellumResult<Option<u32>> {
    let rows = query_rows(
        conn,
        "SELECT version FROM _schema_versions WHERE collection = ?",
        &[SqlValue::Text(collection.to_string())],
    )
    .map_err(|f| f.into_error())?;
    Ok(rows
        .first()
        .and_then(|r| r.integer("version"))
        .map(|v| v.max(0) as u32))
}

fn set_stored_version(conn: &mut Connection, collection: &str, version: u32) -> VellumResult<()> {
    exec(
        conn,
        "INSERT INTO _schema_versions (collection, version) VALUES (?, ?)
         ON CONFLICT(collection) DO UPDATE SET version = excluded.version,
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        &[
            SqlValue::Text(collection.to_string()),
            SqlValue::Integer(i64::from(version)),
        ],
    )
    .map_err(|f| f.into_error())?;
    Ok(())
}

/// `ALTER TABLE ADD COLUMN` for newly constrained fields, backfilled from
/// the JSON body.
fn sync_columns(conn: &mut Connection, config: &CollectionConfig) -> VellumResult<()> {
    let rows = query_rows(
        conn,
        &format!("PRAGMA table_info({})", config.name),
        &[],
    )
    .map_err(|f| f.into_error())?;
    let existing: BTreeSet<String> = rows
        .iter()
        .filter_map(|row| row.text("name").map(str::to_string))
        .collect();

    for (path, def) in &config.fields {
        let col = column_name(path);
        if existing.contains(&col) {
            continue;
        }
        let ty = sqlite_type_of(config.schema.resolve_path(path), def);
        info!(collection = %config.name, column = %col, "adding synthesized column");
        exec(
            conn,
            &format!("ALTER TABLE {} ADD COLUMN {col} {}", config.name, ty.ddl()),
            &[],
        )
        .map_err(|f| f.into_error())?;
        exec(
            conn,
            &format!(
                "UPDATE {table} SET {col} = json_extract(doc, '$.{path}')",
                table = config.name
            ),
            &[],
        )
        .map_err(|f| f.into_error())?;
    }
    Ok(())
}

/// Drop engine-managed indexes that no longer match the target shape; the
/// auxiliary DDL recreates the current set.
fn sync_indexes(conn: &mut Connection, config: &CollectionConfig) -> VellumResult<()> {
    let rows = query_rows(
        conn,
        "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND name LIKE ?",
        &[
            SqlValue::Text(config.name.clone()),
            SqlValue::Text(format!("idx_{}_%", config.name)),
        ],
    )
    .map_err(|f| f.into_error())?;

    let mut expected = BTreeSet::new();
    for (path, def) in &config.fields {
        let col = column_name(path);
        if def.unique {
            expected.insert(format!("idx_{}_{}_unique", config.name, col));
        } else if def.index {
            expected.insert(format!("idx_{}_{}", config.name, col));
        }
    }

    for row in rows {
        let Some(name) = row.text("name") else { continue };
        if !expected.contains(name) {
            info!(collection = %config.name, index = name, "dropping stale index");
            exec(conn, &format!("DROP INDEX IF EXISTS {name}"), &[])
                .map_err(|f| f.into_error())?;
        }
    }
    Ok(())
}

/// DDL teardown for `drop_collection`: vec0 tables, triggers, the main
/// table, and the version row.
pub fn drop_collection_ddl(conn: &mut Connection, config: &CollectionConfig) -> VellumResult<()> {
    run_in_transaction(conn, TxnBehavior::Immediate, |conn| {
        for (path, def) in &config.fields {
            if def.vector.is_some() {
                let vec_table = vector_table_name(&config.name, &column_name(path));
                exec(conn, &format!("DROP TABLE IF EXISTS {vec_table}"), &[])
                    .map_err(|f| f.into_error())?;
            }
        }
        for trigger in trigger_names(&config.name) {
            exec(conn, &format!("DROP TRIGGER IF EXISTS {trigger}"), &[])
                .map_err(|f| f.into_error())?;
        }
        exec(conn, &format!("DROP TABLE IF EXISTS {}", config.name), &[])
            .map_err(|f| f.into_error())?;
        exec(
            conn,
            "DELETE FROM _schema_versions WHERE collection = ?",
            &[SqlValue::Text(config.name.clone())],
        )
        .map_err(|f| f.into_error())?;
        Ok(())
    })
}
