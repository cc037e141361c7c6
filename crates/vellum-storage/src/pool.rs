//! Connection pool: one writer plus round-robin readers.
//!
//! The writer connection is the only one that mutates; readers are opened
//! read-only and fall back to the writer for in-memory databases. Shared
//! (multiplexed) pools are registered by config key so several database
//! handles can reuse one pool.
//!
//! A periodic health task runs `SELECT 1`; three consecutive failures
//! remove a reader, and an unhealthy writer is reopened with linear
//! backoff up to the configured attempt limit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use vellum_core::config::DatabaseOptions;
use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::ident::validate_database_path;

use crate::driver::configure_statement_cache;
use crate::pragmas::{configure_connection, configure_readonly_connection};
use crate::vector::register_vector_extension;

/// Consecutive health-check failures before a connection is dropped.
const HEALTH_FAILURE_LIMIT: u32 = 3;

/// The writer connection, guarded for exclusive access.
///
/// Critical sections are short and never held across an await; the async
/// wrapper exists so call sites read as suspension points.
pub struct WriteConnection {
    conn: Mutex<Connection>,
}

impl WriteConnection {
    fn new(conn: Connection) -> WriteConnection {
        WriteConnection {
            conn: Mutex::new(conn),
        }
    }

    pub async fn with_conn<T, F>(&self, f: F) -> VellumResult<T>
    where
        F: FnOnce(&mut Connection) -> VellumResult<T>,
    {
        self.with_conn_sync(f)
    }

    pub fn with_conn_sync<T, F>(&self, f: F) -> VellumResult<T>
    where
        F: FnOnce(&mut Connection) -> VellumResult<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| VellumError::Database(format!("writer lock poisoned: {e}")))?;
        f(&mut guard)
    }

    fn replace(&self, conn: Connection) -> VellumResult<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| VellumError::Database(format!("writer lock poisoned: {e}")))?;
        *guard = conn;
        Ok(())
    }
}

struct ReadConnection {
    conn: Mutex<Connection>,
    failures: AtomicU32,
}

/// Writer + readers pool for one database location.
pub struct ConnectionPool {
    writer: Arc<WriteConnection>,
    readers: Mutex<Vec<Arc<ReadConnection>>>,
    read_index: AtomicUsize,
    options: DatabaseOptions,
    shared: bool,
    closed: AtomicBool,
    health_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn shared_registry() -> &'static Mutex<HashMap<String, Weak<ConnectionPool>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<ConnectionPool>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl ConnectionPool {
    /// Open a pool for `options`, honoring shared-connection mode.
    pub fn open(options: &DatabaseOptions) -> VellumResult<Arc<ConnectionPool>> {
        if options.shared_connection {
            let key = options.config_key();
            let mut registry = shared_registry()
                .lock()
                .map_err(|e| VellumError::Database(format!("pool registry poisoned: {e}")))?;
            if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
                debug!(%key, "reusing shared connection pool");
                return Ok(existing);
            }
            let pool = Arc::new(Self::open_dedicated(options, true)?);
            registry.insert(key, Arc::downgrade(&pool));
            pool.arm_health_task();
            return Ok(pool);
        }
        let pool = Arc::new(Self::open_dedicated(options, false)?);
        pool.arm_health_task();
        Ok(pool)
    }

    fn open_dedicated(options: &DatabaseOptions, shared: bool) -> VellumResult<ConnectionPool> {
        register_vector_extension();

        let writer = open_with_retry(options)?;

        let mut readers = Vec::new();
        if !options.memory {
            if let Some(path) = options.path.as_deref() {
                let reader_count = options.connection_pool.max_connections.saturating_sub(1);
                for i in 0..reader_count {
                    let conn = Connection::open_with_flags(
                        path,
                        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                    )
                    .map_err(|e| {
                        VellumError::Database(format!("failed to open reader {i}: {e}"))
                    })?;
                    configure_readonly_connection(&conn, &options.sqlite)?;
                    configure_statement_cache(&conn);
                    readers.push(Arc::new(ReadConnection {
                        conn: Mutex::new(conn),
                        failures: AtomicU32::new(0),
                    }));
                }
            }
        }

        Ok(ConnectionPool {
            writer: Arc::new(WriteConnection::new(writer)),
            readers: Mutex::new(readers),
            read_index: AtomicUsize::new(0),
            options: options.clone(),
            shared,
            closed: AtomicBool::new(false),
            health_task: Mutex::new(None),
        })
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn writer(&self) -> &Arc<WriteConnection> {
        &self.writer
    }

    fn check_open(&self) -> VellumResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VellumError::Closed);
        }
        Ok(())
    }

    /// Run `f` on the writer connection.
    pub async fn with_writer<T, F>(&self, f: F) -> VellumResult<T>
    where
        F: FnOnce(&mut Connection) -> VellumResult<T>,
    {
        self.check_open()?;
        self.writer.with_conn(f).await
    }

    pub fn with_writer_sync<T, F>(&self, f: F) -> VellumResult<T>
    where
        F: FnOnce(&mut Connection) -> VellumResult<T>,
    {
        self.check_open()?;
        self.writer.with_conn_sync(f)
    }

    /// Run `f` on a reader connection, round-robin. Falls back to the
    /// writer when no readers exist (in-memory databases).
    pub async fn with_reader<T, F>(&self, f: F) -> VellumResult<T>
    where
        F: FnOnce(&mut Connection) -> VellumResult<T>,
    {
        self.with_reader_sync(f)
    }

    pub fn with_reader_sync<T, F>(&self, f: F) -> VellumResult<T>
    where
        F: FnOnce(&mut Connection) -> VellumResult<T>,
    {
        self.check_open()?;
        let reader = {
            let readers = self
                .readers
                .lock()
                .map_err(|e| VellumError::Database(format!("reader list poisoned: {e}")))?;
            if readers.is_empty() {
                None
            } else {
                let index = self.read_index.fetch_add(1, Ordering::Relaxed) % readers.len();
                Some(Arc::clone(&readers[index]))
            }
        };
        match reader {
            None => self.writer.with_conn_sync(f),
            Some(reader) => {
                let mut guard = reader
                    .conn
                    .lock()
                    .map_err(|e| VellumError::Database(format!("reader lock poisoned: {e}")))?;
                f(&mut guard)
            }
        }
    }

    /// One health sweep: `SELECT 1` on every connection. Readers past the
    /// failure limit are removed; a failing writer is reopened.
    pub fn run_health_check(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let readers: Vec<Arc<ReadConnection>> = match self.readers.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for reader in &readers {
            let healthy = reader
                .conn
                .lock()
                .map(|conn| conn.execute_batch("SELECT 1").is_ok())
                .unwrap_or(false);
            if healthy {
                reader.failures.store(0, Ordering::Relaxed);
            } else {
                let failures = reader.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= HEALTH_FAILURE_LIMIT {
                    warn!("removing reader after {failures} failed health checks");
                    if let Ok(mut guard) = self.readers.lock() {
                        guard.retain(|r| !Arc::ptr_eq(r, reader));
                    }
                }
            }
        }

        let writer_healthy = self
            .writer
            .with_conn_sync(|conn| Ok(conn.execute_batch("SELECT 1").is_ok()))
            .unwrap_or(false);
        if !writer_healthy && self.options.auto_reconnect {
            if let Err(e) = self.reconnect_writer() {
                warn!(error = %e, "writer reconnect failed");
            }
        }
    }

    /// Reopen the writer with linear backoff.
    fn reconnect_writer(&self) -> VellumResult<()> {
        if self.options.memory {
            // Reopening an in-memory database would silently lose data.
            return Err(VellumError::Database(
                "cannot reconnect an in-memory database".to_string(),
            ));
        }
        let mut last_error = None;
        for attempt in 1..=self.options.max_reconnect_attempts.max(1) {
            match open_with_retry(&self.options) {
                Ok(conn) => {
                    self.writer.replace(conn)?;
                    debug!(attempt, "writer reconnected");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                    std::thread::sleep(Duration::from_millis(
                        self.options.reconnect_delay_ms * u64::from(attempt),
                    ));
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| VellumError::Database("reconnect failed".to_string())))
    }

    /// Start the periodic health task. Only runs when a tokio runtime is
    /// present; pools constructed outside one skip periodic checks.
    pub fn arm_health_task(self: &Arc<Self>) {
        let interval_ms = self.options.connection_pool.health_check_interval_ms;
        if interval_ms == 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.closed.load(Ordering::Acquire) {
                    break;
                }
                pool.run_health_check();
            }
        });
        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// Mark the pool closed and stop background work. Connections close on
    /// drop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        if self.shared {
            if let Ok(mut registry) = shared_registry().lock() {
                registry.retain(|_, weak| weak.strong_count() > 0);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cheap connectivity probe for the façade's health report.
    pub fn health_snapshot(&self) -> PoolHealth {
        let writer_ok = self
            .writer
            .with_conn_sync(|conn| Ok(conn.execute_batch("SELECT 1").is_ok()))
            .unwrap_or(false);
        let reader_count = self.readers.lock().map(|r| r.len()).unwrap_or(0);
        PoolHealth {
            writer_ok,
            reader_count,
            closed: self.is_closed(),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Snapshot of pool state for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHealth {
    pub writer_ok: bool,
    pub reader_count: usize,
    pub closed: bool,
}

fn open_writer(options: &DatabaseOptions) -> VellumResult<Connection> {
    let conn = if options.memory {
        Connection::open_in_memory()
            .map_err(|e| VellumError::Database(format!("failed to open in-memory database: {e}")))?
    } else {
        let path = options
            .path
            .as_deref()
            .ok_or_else(|| VellumError::Config("no database path configured".to_string()))?;
        validate_database_path(path)?;
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    VellumError::Database(format!("failed to create database directory: {e}"))
                })?;
            }
        }
        Connection::open(path)
            .map_err(|e| VellumError::Database(format!("failed to open database: {e}")))?
    };
    configure_connection(&conn, &options.sqlite)?;
    configure_statement_cache(&conn);
    Ok(conn)
}

fn open_with_retry(options: &DatabaseOptions) -> VellumResult<Connection> {
    let attempts = options.connection_pool.retry_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match open_writer(options) {
            Ok(conn) => return Ok(conn),
            Err(e @ VellumError::Config(_)) | Err(e @ VellumError::Validation(_)) => {
                return Err(e);
            }
            Err(e) => {
                last_error = Some(e);
                if attempt < attempts {
                    std::thread::sleep(Duration::from_millis(
                        options.connection_pool.retry_delay_ms,
                    ));
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| VellumError::Database("open failed".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_pool_reads_through_writer() {
        let pool = ConnectionPool::open(&DatabaseOptions::in_memory()).unwrap();
        pool.with_writer_sync(|conn| {
            conn.execute_batch("CREATE TABLE t (x); INSERT INTO t VALUES (1)")
                .map_err(|e| VellumError::Database(e.to_string()))
        })
        .unwrap();
        let n: i64 = pool
            .with_reader_sync(|conn| {
                conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .map_err(|e| VellumError::Database(e.to_string()))
            })
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_file_pool_round_robin_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let options = DatabaseOptions::at_path(path.to_str().unwrap());
        let pool = ConnectionPool::open(&options).unwrap();
        pool.with_writer_sync(|conn| {
            conn.execute_batch("CREATE TABLE t (x); INSERT INTO t VALUES (1)")
                .map_err(|e| VellumError::Database(e.to_string()))
        })
        .unwrap();
        for _ in 0..5 {
            let n: i64 = pool
                .with_reader_sync(|conn| {
                    conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                        .map_err(|e| VellumError::Database(e.to_string()))
                })
                .unwrap();
            assert_eq!(n, 1);
        }
        assert!(pool.health_snapshot().writer_ok);
    }

    #[test]
    fn test_shared_pools_reuse_by_config_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let mut options = DatabaseOptions::at_path(path.to_str().unwrap());
        options.shared_connection = true;
        let a = ConnectionPool::open(&options).unwrap();
        let b = ConnectionPool::open(&options).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_closed_pool_rejects_operations() {
        let pool = ConnectionPool::open(&DatabaseOptions::in_memory()).unwrap();
        pool.close();
        let result = pool.with_writer_sync(|_conn| Ok(()));
        assert!(matches!(result, Err(VellumError::Closed)));
    }

    #[test]
    fn test_health_check_survives_healthy_pool() {
        let pool = ConnectionPool::open(&DatabaseOptions::in_memory()).unwrap();
        pool.run_health_check();
        assert!(!pool.is_closed());
    }
}
