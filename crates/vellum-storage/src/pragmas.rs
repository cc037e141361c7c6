//! SQLite PRAGMA configuration.
//!
//! Must be called on every connection immediately after opening. Explicit
//! config values win; the defaults are WAL journaling, NORMAL synchronous,
//! a 5 s busy timeout, foreign keys ON, and a page cache sized from
//! available memory.

use rusqlite::Connection;

use vellum_core::config::SqliteOptions;
use vellum_core::errors::{VellumError, VellumResult};

/// Lower bound for the page cache: 16 MiB.
const CACHE_MIN_KIB: i64 = 16 * 1024;
/// Upper bound for the page cache: 256 MiB.
const CACHE_MAX_KIB: i64 = 256 * 1024;
/// Fallback when available memory cannot be probed: 64 MiB.
const CACHE_FALLBACK_KIB: i64 = 64 * 1024;

/// Configure a connection with the engine PRAGMAs.
pub fn configure_connection(conn: &Connection, options: &SqliteOptions) -> VellumResult<()> {
    let journal_mode = options.journal_mode.as_deref().unwrap_or("WAL");
    let synchronous = options.synchronous.as_deref().unwrap_or("NORMAL");
    let busy_timeout = options.busy_timeout_ms.unwrap_or(5000);
    let temp_store = options.temp_store.as_deref().unwrap_or("MEMORY");
    let cache_kib = resolve_cache_size(options.cache_size);

    validate_pragma_token(journal_mode)?;
    validate_pragma_token(synchronous)?;
    validate_pragma_token(temp_store)?;

    conn.execute_batch(&format!(
        "
        PRAGMA journal_mode = {journal_mode};
        PRAGMA synchronous = {synchronous};
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = {busy_timeout};
        PRAGMA cache_size = -{cache_kib};
        PRAGMA temp_store = {temp_store};
        ",
    ))
    .map_err(|e| VellumError::Database(format!("failed to apply pragmas: {e}")))?;

    if let Some(locking_mode) = options.locking_mode.as_deref() {
        validate_pragma_token(locking_mode)?;
        conn.execute_batch(&format!("PRAGMA locking_mode = {locking_mode};"))
            .map_err(|e| VellumError::Database(format!("failed to set locking_mode: {e}")))?;
    }
    if let Some(auto_vacuum) = options.auto_vacuum.as_deref() {
        validate_pragma_token(auto_vacuum)?;
        conn.execute_batch(&format!("PRAGMA auto_vacuum = {auto_vacuum};"))
            .map_err(|e| VellumError::Database(format!("failed to set auto_vacuum: {e}")))?;
    }
    if let Some(pages) = options.wal_checkpoint {
        conn.execute_batch(&format!("PRAGMA wal_autocheckpoint = {pages};"))
            .map_err(|e| VellumError::Database(format!("failed to set wal_autocheckpoint: {e}")))?;
    }

    Ok(())
}

/// Read-only variant: same PRAGMAs plus `query_only` so accidental writes
/// through a reader fail loudly.
pub fn configure_readonly_connection(
    conn: &Connection,
    options: &SqliteOptions,
) -> VellumResult<()> {
    configure_connection(conn, options)?;
    conn.execute_batch("PRAGMA query_only = ON;")
        .map_err(|e| VellumError::Database(format!("failed to set query_only: {e}")))?;
    Ok(())
}

/// PRAGMA values are keywords, not user data; reject anything else.
fn validate_pragma_token(token: &str) -> VellumResult<()> {
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(VellumError::Config(format!(
            "invalid pragma value '{token}'"
        )));
    }
    Ok(())
}

/// Cache size in KiB: explicit config wins, otherwise 10% of available
/// memory clamped to [16 MiB, 256 MiB].
fn resolve_cache_size(configured: Option<i64>) -> i64 {
    if let Some(kib) = configured {
        return kib.abs().clamp(CACHE_MIN_KIB, CACHE_MAX_KIB);
    }
    match available_memory_kib() {
        Some(avail) => (avail / 10).clamp(CACHE_MIN_KIB, CACHE_MAX_KIB),
        None => CACHE_FALLBACK_KIB,
    }
}

#[cfg(target_os = "linux")]
fn available_memory_kib() -> Option<i64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            return rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse::<i64>()
                .ok();
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn available_memory_kib() -> Option<i64> {
    None
}
