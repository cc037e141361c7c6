//! Database configuration.

use serde::{Deserialize, Serialize};

use crate::errors::{VellumError, VellumResult};

/// Which SQLite binding backs the database.
///
/// `Auto` resolves through the injected environment descriptor; the
/// `DATABASE_DRIVER` environment variable overrides both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    #[default]
    Auto,
    SqliteNative,
    SqliteBundled,
}

impl DriverKind {
    /// Parse the `DATABASE_DRIVER` environment variable, if set.
    pub fn from_env() -> VellumResult<Option<DriverKind>> {
        match std::env::var("DATABASE_DRIVER") {
            Ok(raw) => Self::parse(&raw).map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn parse(raw: &str) -> VellumResult<DriverKind> {
        match raw {
            "auto" => Ok(DriverKind::Auto),
            "sqlite-native" => Ok(DriverKind::SqliteNative),
            "sqlite-bundled" => Ok(DriverKind::SqliteBundled),
            other => Err(VellumError::Config(format!(
                "unrecognized DATABASE_DRIVER '{other}' (expected auto | sqlite-native | sqlite-bundled)"
            ))),
        }
    }
}

/// Connection-pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub max_connections: usize,
    pub max_idle_time_ms: u64,
    pub health_check_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 4,
            max_idle_time_ms: 300_000,
            health_check_interval_ms: 30_000,
            retry_attempts: 3,
            retry_delay_ms: 250,
        }
    }
}

/// PRAGMA-level SQLite tuning. `None` keeps the engine default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    pub journal_mode: Option<String>,
    pub synchronous: Option<String>,
    pub busy_timeout_ms: Option<u64>,
    /// PRAGMA cache_size value. When absent, sized as 10% of available
    /// memory clamped to [16 MiB, 256 MiB].
    pub cache_size: Option<i64>,
    pub temp_store: Option<String>,
    pub locking_mode: Option<String>,
    pub auto_vacuum: Option<String>,
    /// WAL auto-checkpoint page threshold.
    pub wal_checkpoint: Option<u32>,
}

/// Top-level database options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// File path; ignored when `memory` is set.
    pub path: Option<String>,
    pub memory: bool,
    pub driver: DriverKind,
    /// Multiplex one pool across handles with the same config key.
    pub shared_connection: bool,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// When set, a failing plugin hook aborts the operation instead of
    /// being logged.
    pub strict_hooks: bool,
    pub connection_pool: PoolOptions,
    pub sqlite: SqliteOptions,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            path: None,
            memory: false,
            driver: DriverKind::Auto,
            shared_connection: false,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 200,
            strict_hooks: false,
            connection_pool: PoolOptions::default(),
            sqlite: SqliteOptions::default(),
        }
    }
}

impl DatabaseOptions {
    /// In-memory database (tests, scratch work).
    pub fn in_memory() -> Self {
        DatabaseOptions {
            memory: true,
            ..Default::default()
        }
    }

    /// File-backed database at `path`.
    pub fn at_path(path: impl Into<String>) -> Self {
        DatabaseOptions {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// The driver after applying the environment override.
    pub fn effective_driver(&self) -> VellumResult<DriverKind> {
        Ok(DriverKind::from_env()?.unwrap_or(self.driver))
    }

    /// Key identifying a shared pool: canonical location string.
    pub fn config_key(&self) -> String {
        if self.memory {
            ":memory:".to_string()
        } else {
            self.path.clone().unwrap_or_else(|| ":memory:".to_string())
        }
    }
}
