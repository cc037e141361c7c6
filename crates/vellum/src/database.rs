//! The database façade: collection registry, pool wiring, transactions,
//! plugins, and lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use dashmap::DashMap;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use vellum_core::codec::document_cache;
use vellum_core::config::{DatabaseOptions, DriverKind};
use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::fields::{ConstrainedFields, SqlValue};
use vellum_core::ident::validate_collection_name;
use vellum_storage::driver::{exec as driver_exec, query_rows, SqlRow};
use vellum_storage::pool::{ConnectionPool, PoolHealth};
use vellum_storage::txn::{run_in_savepoint, run_in_transaction, TxnBehavior};
use vellum_storage::vector::buffer_pool;

use crate::collection::{Collection, CollectionConfig, CollectionInner};
use crate::hooks::{Hook, HookContext, HookMode, Plugin, PluginManager};
use crate::migrate::{self, MigrationState, MigrationStatus};
use crate::ops;

/// Count of live databases; process caches are cleared when it reaches
/// zero.
fn open_databases() -> &'static AtomicUsize {
    static COUNT: OnceLock<AtomicUsize> = OnceLock::new();
    COUNT.get_or_init(|| AtomicUsize::new(0))
}

/// Database health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHealth {
    pub pool: PoolHealth,
    pub closed: bool,
}

struct DatabaseInner {
    id: String,
    options: DatabaseOptions,
    pool: Arc<ConnectionPool>,
    collections: RwLock<HashMap<String, Collection>>,
    configs: RwLock<BTreeMap<String, CollectionConfig>>,
    catalog: Arc<RwLock<BTreeMap<String, ConstrainedFields>>>,
    plugins: Arc<PluginManager>,
    migrations: DashMap<(String, u32), MigrationStatus>,
    init_errors: DashMap<String, String>,
    closed: AtomicBool,
}

/// An open vellum database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open a database with the given options.
    pub async fn open(options: DatabaseOptions) -> VellumResult<Database> {
        let driver = match options.effective_driver()? {
            DriverKind::Auto => DriverKind::SqliteBundled,
            explicit => explicit,
        };
        debug!(?driver, "resolved sqlite driver");

        let pool = ConnectionPool::open(&options)?;
        let mode = if options.strict_hooks {
            HookMode::Strict
        } else {
            HookMode::Safe
        };

        let db = Database {
            inner: Arc::new(DatabaseInner {
                id: Uuid::new_v4().to_string(),
                options,
                pool,
                collections: RwLock::new(HashMap::new()),
                configs: RwLock::new(BTreeMap::new()),
                catalog: Arc::new(RwLock::new(BTreeMap::new())),
                plugins: Arc::new(PluginManager::new(mode)),
                migrations: DashMap::new(),
                init_errors: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        };
        open_databases().fetch_add(1, Ordering::AcqRel);
        info!(id = %db.inner.id, "database opened");
        db.inner
            .plugins
            .dispatch(Hook::DatabaseInit, &HookContext::default())
            .await?;
        Ok(db)
    }

    /// In-memory database.
    pub async fn open_in_memory() -> VellumResult<Database> {
        Self::open(DatabaseOptions::in_memory()).await
    }

    /// Unique id of this database instance; scopes migration caches.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.inner.options
    }

    fn check_open(&self) -> VellumResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(VellumError::Closed);
        }
        Ok(())
    }

    fn check_sync_allowed(&self) -> VellumResult<()> {
        if self.inner.options.shared_connection {
            return Err(VellumError::SharedSync);
        }
        Ok(())
    }

    /// Open (and on first use, create/migrate) a collection.
    pub async fn collection(&self, config: CollectionConfig) -> VellumResult<Collection> {
        self.check_open()?;
        validate_collection_name(&config.name)?;

        if let Some(existing) = self
            .inner
            .collections
            .read()
            .ok()
            .and_then(|map| map.get(&config.name).cloned())
        {
            return Ok(existing);
        }

        let cache_key = (config.name.clone(), config.version);
        let already_ready = self
            .inner
            .migrations
            .get(&cache_key)
            .map(|status| status.state == MigrationState::Ready)
            .unwrap_or(false);

        if !already_ready {
            let outcome = self
                .inner
                .pool
                .with_writer(|conn| migrate::ensure_collection(conn, &config))
                .await;
            match outcome {
                Ok((from, to)) => {
                    self.inner.init_errors.remove(&config.name);
                    self.inner.migrations.insert(
                        cache_key,
                        MigrationStatus {
                            collection: config.name.clone(),
                            from_version: from,
                            to_version: to,
                            state: MigrationState::Ready,
                        },
                    );
                }
                Err(e) => {
                    let message = e.to_string();
                    self.inner
                        .init_errors
                        .insert(config.name.clone(), message.clone());
                    self.inner.migrations.insert(
                        cache_key,
                        MigrationStatus {
                            collection: config.name.clone(),
                            from_version: 0,
                            to_version: config.version,
                            state: MigrationState::Failed(message),
                        },
                    );
                    return Err(e);
                }
            }
        }

        if let Ok(mut catalog) = self.inner.catalog.write() {
            catalog.insert(config.name.clone(), config.fields.clone());
        }
        if let Ok(mut configs) = self.inner.configs.write() {
            configs.insert(config.name.clone(), config.clone());
        }

        let name = config.name.clone();
        let schema = Arc::new(config.schema.clone());
        let collection = Collection {
            inner: Arc::new(CollectionInner {
                config,
                schema,
                pool: Arc::clone(&self.inner.pool),
                hooks: Arc::clone(&self.inner.plugins),
                catalog: Arc::clone(&self.inner.catalog),
            }),
        };
        if let Ok(mut map) = self.inner.collections.write() {
            map.insert(name.clone(), collection.clone());
        }
        self.inner
            .plugins
            .dispatch(Hook::CollectionCreate, &HookContext::for_collection(&name))
            .await?;
        Ok(collection)
    }

    /// Drop a collection: its table, vector tables, triggers, and version
    /// row.
    pub async fn drop_collection(&self, name: &str) -> VellumResult<()> {
        self.check_open()?;
        let config = self
            .inner
            .configs
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
            .ok_or_else(|| VellumError::NotFound {
                id: name.to_string(),
            })?;

        self.inner
            .pool
            .with_writer(|conn| migrate::drop_collection_ddl(conn, &config))
            .await?;

        if let Ok(mut map) = self.inner.collections.write() {
            map.remove(name);
        }
        if let Ok(mut configs) = self.inner.configs.write() {
            configs.remove(name);
        }
        if let Ok(mut catalog) = self.inner.catalog.write() {
            catalog.remove(name);
        }
        self.inner.migrations.retain(|(n, _), _| n != name);
        self.inner.init_errors.remove(name);
        self.inner
            .plugins
            .dispatch(Hook::CollectionDrop, &HookContext::for_collection(name))
            .await?;
        Ok(())
    }

    /// Run `f` inside a transaction. Re-entrant calls nest via SAVEPOINTs;
    /// `TransactionScope::nested` opens explicit inner scopes.
    pub async fn transaction<T, F>(&self, f: F) -> VellumResult<T>
    where
        F: FnOnce(&mut TransactionScope<'_>) -> VellumResult<T>,
    {
        self.check_open()?;
        self.inner
            .plugins
            .dispatch(Hook::BeforeTransaction, &HookContext::default())
            .await?;

        let configs = Arc::new(
            self.inner
                .configs
                .read()
                .map(|map| map.clone())
                .unwrap_or_default(),
        );
        let result = self
            .inner
            .pool
            .with_writer(|conn| {
                run_in_transaction(conn, TxnBehavior::Deferred, |conn| {
                    let mut scope = TransactionScope {
                        conn,
                        configs: Arc::clone(&configs),
                    };
                    f(&mut scope)
                })
            })
            .await;

        match result {
            Ok(value) => {
                self.inner
                    .plugins
                    .dispatch(Hook::AfterTransaction, &HookContext::default())
                    .await?;
                Ok(value)
            }
            Err(e) => {
                let ctx = HookContext::default().with_error(&e);
                let _ = self
                    .inner
                    .plugins
                    .dispatch(Hook::TransactionError, &ctx)
                    .await;
                Err(e)
            }
        }
    }

    /// Raw statement passthrough (writer).
    pub async fn exec(&self, sql: &str, params: &[SqlValue]) -> VellumResult<usize> {
        self.check_open()?;
        self.inner
            .pool
            .with_writer(|conn| driver_exec(conn, sql, params).map_err(|f| f.into_error()))
            .await
    }

    /// Raw query passthrough (reader).
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> VellumResult<Vec<SqlRow>> {
        self.check_open()?;
        self.inner
            .pool
            .with_reader(|conn| query_rows(conn, sql, params).map_err(|f| f.into_error()))
            .await
    }

    /// Synchronous statement passthrough. Unavailable in shared mode.
    pub fn exec_sync(&self, sql: &str, params: &[SqlValue]) -> VellumResult<usize> {
        self.check_open()?;
        self.check_sync_allowed()?;
        self.inner
            .pool
            .with_writer_sync(|conn| driver_exec(conn, sql, params).map_err(|f| f.into_error()))
    }

    /// Synchronous query passthrough. Unavailable in shared mode.
    pub fn query_sync(&self, sql: &str, params: &[SqlValue]) -> VellumResult<Vec<SqlRow>> {
        self.check_open()?;
        self.check_sync_allowed()?;
        self.inner
            .pool
            .with_reader_sync(|conn| query_rows(conn, sql, params).map_err(|f| f.into_error()))
    }

    /// Register a plugin.
    pub async fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> VellumResult<()> {
        self.check_open()?;
        self.inner.plugins.register(plugin);
        Ok(())
    }

    /// Unregister a plugin by name.
    pub fn unuse_plugin(&self, name: &str) -> bool {
        self.inner.plugins.unregister(name)
    }

    /// Migration status of every collection opened through this handle.
    pub fn migration_status(&self) -> Vec<MigrationStatus> {
        let mut statuses: Vec<MigrationStatus> = self
            .inner
            .migrations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        statuses.sort_by(|a, b| a.collection.cmp(&b.collection));
        statuses
    }

    /// Surface a retained initialization failure for `collection`, if any.
    pub async fn wait_for_initialization(&self, collection: &str) -> VellumResult<()> {
        if let Some(entry) = self.inner.init_errors.get(collection) {
            return Err(VellumError::Migration(entry.value().clone()));
        }
        Ok(())
    }

    /// Pool/driver health snapshot.
    pub fn health(&self) -> DatabaseHealth {
        DatabaseHealth {
            pool: self.inner.pool.health_snapshot(),
            closed: self.inner.closed.load(Ordering::Acquire),
        }
    }

    /// Close the database: fire `on_database_close`, stop background work,
    /// and clear process-wide caches when this was the last open handle.
    pub async fn close(&self) -> VellumResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self
            .inner
            .plugins
            .dispatch(Hook::DatabaseClose, &HookContext::default())
            .await;
        self.inner.pool.close();
        if open_databases().fetch_sub(1, Ordering::AcqRel) == 1 {
            document_cache().clear();
            buffer_pool().clear();
        }
        info!(id = %self.inner.id, "database closed");
        Ok(())
    }
}

/// Operations available inside a `Database::transaction` closure. All of
/// them run on the transaction's connection; `nested` opens a SAVEPOINT
/// scope that can roll back independently of the outer work.
pub struct TransactionScope<'a> {
    conn: &'a mut Connection,
    configs: Arc<BTreeMap<String, CollectionConfig>>,
}

impl TransactionScope<'_> {
    fn config(&self, collection: &str) -> VellumResult<CollectionConfig> {
        self.configs
            .get(collection)
            .cloned()
            .ok_or_else(|| VellumError::NotFound {
                id: collection.to_string(),
            })
    }

    pub fn exec(&mut self, sql: &str, params: &[SqlValue]) -> VellumResult<usize> {
        driver_exec(self.conn, sql, params).map_err(|f| f.into_error())
    }

    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> VellumResult<Vec<SqlRow>> {
        query_rows(self.conn, sql, params).map_err(|f| f.into_error())
    }

    pub fn insert(&mut self, collection: &str, doc: Value) -> VellumResult<Value> {
        let config = self.config(collection)?;
        ops::write::insert(self.conn, &config, doc)
    }

    pub fn put(&mut self, collection: &str, id: &str, partial: Value) -> VellumResult<Value> {
        let config = self.config(collection)?;
        ops::write::put(self.conn, &config, id, partial, None)
    }

    pub fn upsert(&mut self, collection: &str, id: &str, doc: Value) -> VellumResult<Value> {
        let config = self.config(collection)?;
        ops::write::upsert(self.conn, &config, id, doc)
    }

    pub fn delete(&mut self, collection: &str, id: &str) -> VellumResult<bool> {
        let config = self.config(collection)?;
        ops::write::delete(self.conn, &config, id)
    }

    pub fn find_by_id(&mut self, collection: &str, id: &str) -> VellumResult<Option<Value>> {
        let config = self.config(collection)?;
        ops::read::find_by_id(self.conn, &config, document_cache(), id)
    }

    /// Open a nested SAVEPOINT scope. An error rolls back only the inner
    /// scope's work.
    pub fn nested<T, F>(&mut self, f: F) -> VellumResult<T>
    where
        F: FnOnce(&mut TransactionScope<'_>) -> VellumResult<T>,
    {
        let configs = Arc::clone(&self.configs);
        run_in_savepoint(&mut *self.conn, |conn| {
            let mut child = TransactionScope {
                conn,
                configs: Arc::clone(&configs),
            };
            f(&mut child)
        })
    }
}
