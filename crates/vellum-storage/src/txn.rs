//! Transaction demarcation: BEGIN/COMMIT/ROLLBACK at the outer scope,
//! uniquely named SAVEPOINTs for nested scopes.
//!
//! Rollback failures never mask the original error — the cause is
//! propagated and the rollback failure is logged.

use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::Connection;
use tracing::warn;

use vellum_core::errors::{VellumError, VellumResult};

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

/// How an outermost transaction acquires its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnBehavior {
    Deferred,
    /// Upgrades the lock immediately, serializing writers. Used around
    /// read-modify-write sequences so the read version cannot go stale
    /// between the SELECT and the UPDATE.
    Immediate,
}

impl TxnBehavior {
    fn begin_sql(self) -> &'static str {
        match self {
            TxnBehavior::Deferred => "BEGIN",
            TxnBehavior::Immediate => "BEGIN IMMEDIATE",
        }
    }
}

/// Run `f` inside a transaction. If the connection is already inside one,
/// a nested SAVEPOINT scope is used instead, so callers can compose
/// without tracking depth.
pub fn run_in_transaction<T, F>(
    conn: &mut Connection,
    behavior: TxnBehavior,
    f: F,
) -> VellumResult<T>
where
    F: FnOnce(&mut Connection) -> VellumResult<T>,
{
    if !conn.is_autocommit() {
        return run_in_savepoint(conn, f);
    }

    conn.execute_batch(behavior.begin_sql())
        .map_err(|e| VellumError::Database(format!("failed to begin transaction: {e}")))?;

    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| VellumError::Database(format!("failed to commit: {e}")))?;
            Ok(value)
        }
        Err(cause) => {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                warn!(error = %rollback_err, "rollback failed after transaction error");
            }
            Err(cause)
        }
    }
}

/// Run `f` inside a uniquely named SAVEPOINT: `RELEASE` on success,
/// `ROLLBACK TO` + `RELEASE` on error.
pub fn run_in_savepoint<T, F>(conn: &mut Connection, f: F) -> VellumResult<T>
where
    F: FnOnce(&mut Connection) -> VellumResult<T>,
{
    let name = format!("sp_{}", SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed));
    conn.execute_batch(&format!("SAVEPOINT {name}"))
        .map_err(|e| VellumError::Database(format!("failed to create savepoint: {e}")))?;

    match f(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {name}"))
                .map_err(|e| VellumError::Database(format!("failed to release savepoint: {e}")))?;
            Ok(value)
        }
        Err(cause) => {
            if let Err(rollback_err) =
                conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
            {
                warn!(error = %rollback_err, "savepoint rollback failed");
            }
            Err(cause)
        }
    }
}
