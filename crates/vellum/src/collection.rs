//! Collections: configuration and the public async handle.
//!
//! A [`Collection`] orchestrates validation, translation, storage, vector
//! maintenance, and hook dispatch for one named document set. The handle
//! is cheap to clone; all state lives behind the database's pool.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use vellum_core::codec::document_cache;
use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::fields::{ConstrainedFields, FieldDefinition};
use vellum_core::schema::Schema;
use vellum_query::builder::{FieldCondition, QueryBuilder};
use vellum_query::ir::{
    CompareOp, Filter, JoinKind, Node, OrderBy, QueryOptions, SortDir, Subquery,
};
use vellum_query::translate::UpdateOperators;
use vellum_storage::pool::ConnectionPool;

use crate::hooks::{Hook, HookContext, PluginManager};
use crate::migrate::UpgradeContext;
use crate::ops;

/// User-supplied step run between schema versions, inside the migration
/// transaction.
pub type UpgradeFn = Arc<dyn Fn(&mut UpgradeContext<'_>) -> VellumResult<()> + Send + Sync>;

/// Predicate deciding whether a conditional upgrade runs.
pub type ConditionFn = Arc<dyn Fn(&mut UpgradeContext<'_>) -> VellumResult<bool> + Send + Sync>;

/// An entry in the upgrade map: run unconditionally, or behind a condition.
#[derive(Clone)]
pub enum Upgrade {
    Run(UpgradeFn),
    Conditional {
        condition: ConditionFn,
        migrate: UpgradeFn,
    },
}

/// Everything that defines a collection: name, schema, version, constrained
/// fields, upgrades, and an optional seed.
#[derive(Clone)]
pub struct CollectionConfig {
    pub name: String,
    pub schema: Schema,
    pub version: u32,
    pub fields: ConstrainedFields,
    pub upgrades: BTreeMap<u32, Upgrade>,
    pub seed: Option<UpgradeFn>,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>, schema: Schema) -> CollectionConfig {
        CollectionConfig {
            name: name.into(),
            schema,
            version: 1,
            fields: ConstrainedFields::new(),
            upgrades: BTreeMap::new(),
            seed: None,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version.max(1);
        self
    }

    /// Promote a document path to a constrained column.
    pub fn field(mut self, path: impl Into<String>, def: FieldDefinition) -> Self {
        self.fields.insert(path.into(), def);
        self
    }

    /// Register the upgrade step for `version`.
    pub fn upgrade<F>(mut self, version: u32, f: F) -> Self
    where
        F: Fn(&mut UpgradeContext<'_>) -> VellumResult<()> + Send + Sync + 'static,
    {
        self.upgrades.insert(version, Upgrade::Run(Arc::new(f)));
        self
    }

    /// Register a conditional upgrade step for `version`.
    pub fn upgrade_if<C, F>(mut self, version: u32, condition: C, f: F) -> Self
    where
        C: Fn(&mut UpgradeContext<'_>) -> VellumResult<bool> + Send + Sync + 'static,
        F: Fn(&mut UpgradeContext<'_>) -> VellumResult<()> + Send + Sync + 'static,
    {
        self.upgrades.insert(
            version,
            Upgrade::Conditional {
                condition: Arc::new(condition),
                migrate: Arc::new(f),
            },
        );
        self
    }

    /// Populate a freshly created collection.
    pub fn seed<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut UpgradeContext<'_>) -> VellumResult<()> + Send + Sync + 'static,
    {
        self.seed = Some(Arc::new(f));
        self
    }
}

/// Result row of a vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub document: Value,
    pub distance: f64,
}

/// A vector similarity search request.
#[derive(Debug, Clone)]
pub struct VectorSearch {
    pub field: String,
    pub vector: Vec<f32>,
    pub limit: u64,
    pub filter: Option<QueryOptions>,
}

impl VectorSearch {
    pub fn new(field: impl Into<String>, vector: Vec<f32>, limit: u64) -> VectorSearch {
        VectorSearch {
            field: field.into(),
            vector,
            limit,
            filter: None,
        }
    }

    pub fn filtered(mut self, filter: QueryOptions) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Outcome of `rebuild_indexes`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuildReport {
    pub scanned: u64,
    pub fixed: u64,
    pub errors: Vec<String>,
}

pub(crate) struct CollectionInner {
    pub config: CollectionConfig,
    pub schema: Arc<Schema>,
    pub pool: Arc<ConnectionPool>,
    pub hooks: Arc<PluginManager>,
    pub catalog: Arc<RwLock<BTreeMap<String, ConstrainedFields>>>,
}

/// Async handle to one collection.
#[derive(Clone)]
pub struct Collection {
    pub(crate) inner: Arc<CollectionInner>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name()).finish()
    }
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.config.schema
    }

    pub fn version(&self) -> u32 {
        self.inner.config.version
    }

    fn ctx(&self) -> HookContext {
        HookContext::for_collection(self.name())
    }

    fn catalog_snapshot(&self) -> BTreeMap<String, ConstrainedFields> {
        self.inner
            .catalog
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    async fn fail(&self, error: VellumError) -> VellumError {
        let ctx = self.ctx().with_error(&error);
        let _ = self.inner.hooks.dispatch(Hook::Error, &ctx).await;
        error
    }

    /// Insert a new document. Generates `_id` when absent; rejects an
    /// existing `_id` with `UniqueConstraint`.
    pub async fn insert(&self, doc: Value) -> VellumResult<Value> {
        let ctx = self.ctx().with_document(&doc);
        self.inner.hooks.dispatch(Hook::BeforeInsert, &ctx).await?;
        let config = &self.inner.config;
        let result = self
            .inner
            .pool
            .with_writer(|conn| ops::write::insert(conn, config, doc))
            .await;
        match result {
            Ok(stored) => {
                let ctx = self.ctx().with_document(&stored);
                self.inner.hooks.dispatch(Hook::AfterInsert, &ctx).await?;
                Ok(stored)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Insert many documents atomically: existing ids are pre-checked in
    /// one batched query, the rows go in as a single multi-row INSERT, and
    /// any failure (vector inserts included) rolls back the whole batch.
    pub async fn insert_bulk(&self, docs: Vec<Value>) -> VellumResult<Vec<Value>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = self.ctx();
        self.inner.hooks.dispatch(Hook::BeforeInsert, &ctx).await?;
        let config = &self.inner.config;
        let result = self
            .inner
            .pool
            .with_writer(|conn| ops::write::insert_bulk(conn, config, docs))
            .await;
        match result {
            Ok(stored) => {
                self.inner.hooks.dispatch(Hook::AfterInsert, &ctx).await?;
                Ok(stored)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Merge `partial` over the stored document under optimistic
    /// concurrency. Raises `VersionMismatch` when a concurrent writer got
    /// there first.
    pub async fn put(&self, id: &str, partial: Value) -> VellumResult<Value> {
        self.put_inner(id, partial, None).await
    }

    /// `put` with a caller-supplied expected version.
    pub async fn put_with_version(
        &self,
        id: &str,
        partial: Value,
        expected_version: i64,
    ) -> VellumResult<Value> {
        self.put_inner(id, partial, Some(expected_version)).await
    }

    async fn put_inner(
        &self,
        id: &str,
        partial: Value,
        expected_version: Option<i64>,
    ) -> VellumResult<Value> {
        let ctx = self.ctx().with_document(&partial);
        self.inner.hooks.dispatch(Hook::BeforeUpdate, &ctx).await?;
        let config = &self.inner.config;
        let result = self
            .inner
            .pool
            .with_writer(|conn| ops::write::put(conn, config, id, partial, expected_version))
            .await;
        match result {
            Ok(updated) => {
                let ctx = self.ctx().with_document(&updated);
                self.inner.hooks.dispatch(Hook::AfterUpdate, &ctx).await?;
                Ok(updated)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Apply merges to several documents inside one transaction. No
    /// version check is performed per item.
    pub async fn put_bulk(&self, updates: Vec<(String, Value)>) -> VellumResult<Vec<Value>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = self.ctx();
        self.inner.hooks.dispatch(Hook::BeforeUpdate, &ctx).await?;
        let config = &self.inner.config;
        let result = self
            .inner
            .pool
            .with_writer(|conn| ops::write::put_bulk(conn, config, updates))
            .await;
        match result {
            Ok(updated) => {
                self.inner.hooks.dispatch(Hook::AfterUpdate, &ctx).await?;
                Ok(updated)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Apply `$set` / `$inc` / `$push` operators in one UPDATE, without
    /// reading the document first.
    pub async fn atomic_update(&self, id: &str, operators: UpdateOperators) -> VellumResult<Value> {
        self.atomic_update_inner(id, operators, None).await
    }

    /// `atomic_update` guarded by an expected version.
    pub async fn atomic_update_with_version(
        &self,
        id: &str,
        operators: UpdateOperators,
        expected_version: i64,
    ) -> VellumResult<Value> {
        self.atomic_update_inner(id, operators, Some(expected_version))
            .await
    }

    async fn atomic_update_inner(
        &self,
        id: &str,
        operators: UpdateOperators,
        expected_version: Option<i64>,
    ) -> VellumResult<Value> {
        let ctx = self.ctx();
        self.inner.hooks.dispatch(Hook::BeforeUpdate, &ctx).await?;
        let config = &self.inner.config;
        let result = self
            .inner
            .pool
            .with_writer(|conn| {
                ops::write::atomic_update(conn, config, id, &operators, expected_version)
            })
            .await;
        match result {
            Ok(updated) => {
                let ctx = self.ctx().with_document(&updated);
                self.inner.hooks.dispatch(Hook::AfterUpdate, &ctx).await?;
                Ok(updated)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Insert-or-update preserving version monotonicity: an upsert that
    /// hits an existing row increments `_version`, never resets it.
    pub async fn upsert(&self, id: &str, doc: Value) -> VellumResult<Value> {
        let ctx = self.ctx().with_document(&doc);
        self.inner.hooks.dispatch(Hook::BeforeUpdate, &ctx).await?;
        let config = &self.inner.config;
        let result = self
            .inner
            .pool
            .with_writer(|conn| ops::write::upsert(conn, config, id, doc))
            .await;
        match result {
            Ok(stored) => {
                let ctx = self.ctx().with_document(&stored);
                self.inner.hooks.dispatch(Hook::AfterUpdate, &ctx).await?;
                Ok(stored)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Upsert several documents inside one transaction.
    pub async fn upsert_bulk(&self, docs: Vec<(String, Value)>) -> VellumResult<Vec<Value>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = self.ctx();
        self.inner.hooks.dispatch(Hook::BeforeUpdate, &ctx).await?;
        let config = &self.inner.config;
        let result = self
            .inner
            .pool
            .with_writer(|conn| ops::write::upsert_bulk(conn, config, docs))
            .await;
        match result {
            Ok(stored) => {
                self.inner.hooks.dispatch(Hook::AfterUpdate, &ctx).await?;
                Ok(stored)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Delete by id. Returns whether a document was removed. Vector rows
    /// share the document's lifecycle.
    pub async fn delete(&self, id: &str) -> VellumResult<bool> {
        let ctx = self.ctx();
        self.inner.hooks.dispatch(Hook::BeforeDelete, &ctx).await?;
        let config = &self.inner.config;
        let result = self
            .inner
            .pool
            .with_writer(|conn| ops::write::delete(conn, config, id))
            .await;
        match result {
            Ok(deleted) => {
                self.inner.hooks.dispatch(Hook::AfterDelete, &ctx).await?;
                Ok(deleted)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Delete several documents inside one transaction; returns the count
    /// removed.
    pub async fn delete_bulk(&self, ids: &[String]) -> VellumResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ctx = self.ctx();
        self.inner.hooks.dispatch(Hook::BeforeDelete, &ctx).await?;
        let config = &self.inner.config;
        let result = self
            .inner
            .pool
            .with_writer(|conn| ops::write::delete_bulk(conn, config, ids))
            .await;
        match result {
            Ok(count) => {
                self.inner.hooks.dispatch(Hook::AfterDelete, &ctx).await?;
                Ok(count)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Fetch one document. Synthesized column values are authoritative and
    /// are merged back over the JSON body.
    pub async fn find_by_id(&self, id: &str) -> VellumResult<Option<Value>> {
        let config = &self.inner.config;
        self.inner
            .pool
            .with_reader(|conn| ops::read::find_by_id(conn, config, document_cache(), id))
            .await
    }

    /// Start a query chain.
    pub fn query(&self) -> CollectionQuery {
        CollectionQuery {
            collection: self.clone(),
            builder: QueryBuilder::new(self.name(), Arc::clone(&self.inner.schema)),
        }
    }

    /// Shorthand for `query().where_field(path)`.
    pub fn where_field(&self, path: impl Into<String>) -> VellumResult<CollectionCondition> {
        self.query().where_field(path)
    }

    /// Documents in the collection, unfiltered.
    pub async fn count(&self) -> VellumResult<u64> {
        self.query().count().await
    }

    /// K-nearest-neighbor search over a VECTOR field, ascending by
    /// distance.
    pub async fn vector_search(&self, search: VectorSearch) -> VellumResult<Vec<VectorMatch>> {
        let ctx = self.ctx();
        self.inner.hooks.dispatch(Hook::BeforeQuery, &ctx).await?;
        let config = &self.inner.config;
        let catalog = self.catalog_snapshot();
        let result = self
            .inner
            .pool
            .with_reader(|conn| {
                ops::vector::vector_search(conn, config, document_cache(), &search, &catalog)
            })
            .await;
        match result {
            Ok(matches) => {
                self.inner.hooks.dispatch(Hook::AfterQuery, &ctx).await?;
                Ok(matches)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Stream every row, recompute synthesized columns from the JSON body,
    /// repair divergent columns and vector rows.
    pub async fn rebuild_indexes(&self) -> VellumResult<RebuildReport> {
        let config = &self.inner.config;
        self.inner
            .pool
            .with_writer(|conn| ops::rebuild::rebuild_indexes(conn, config, document_cache()))
            .await
    }

    pub(crate) async fn run_to_array(&self, options: &QueryOptions) -> VellumResult<Vec<Value>> {
        let config = &self.inner.config;
        let catalog = self.catalog_snapshot();
        self.inner
            .pool
            .with_reader(|conn| {
                ops::read::to_array(conn, config, document_cache(), options, &catalog)
            })
            .await
    }

    pub(crate) async fn run_count(&self, options: &QueryOptions) -> VellumResult<u64> {
        let config = &self.inner.config;
        let catalog = self.catalog_snapshot();
        self.inner
            .pool
            .with_reader(|conn| ops::read::count(conn, config, options, &catalog))
            .await
    }
}

/// A query chain bound to a collection. Chaining is immutable, mirroring
/// the underlying builder; terminal methods execute.
#[derive(Clone)]
pub struct CollectionQuery {
    collection: Collection,
    builder: QueryBuilder,
}

impl CollectionQuery {
    pub fn options(&self) -> &QueryOptions {
        self.builder.options()
    }

    fn with_builder(&self, builder: QueryBuilder) -> CollectionQuery {
        CollectionQuery {
            collection: self.collection.clone(),
            builder,
        }
    }

    pub fn where_field(&self, path: impl Into<String>) -> VellumResult<CollectionCondition> {
        Ok(CollectionCondition {
            collection: self.collection.clone(),
            condition: self.builder.where_field(path)?,
        })
    }

    pub fn and_where(&self, filter: Filter) -> VellumResult<CollectionQuery> {
        Ok(self.with_builder(self.builder.and_where(filter)?))
    }

    pub fn or_where(&self, filters: Vec<Filter>) -> VellumResult<CollectionQuery> {
        Ok(self.with_builder(self.builder.or_where(filters)?))
    }

    pub fn where_subquery(&self, subquery: Subquery) -> VellumResult<CollectionQuery> {
        Ok(self.with_builder(self.builder.where_subquery(subquery)?))
    }

    pub fn join(
        &self,
        kind: JoinKind,
        collection: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
    ) -> VellumResult<CollectionQuery> {
        Ok(self.with_builder(self.builder.join(kind, collection, left, right)?))
    }

    pub fn order_by(&self, field: impl Into<String>, dir: SortDir) -> VellumResult<CollectionQuery> {
        Ok(self.with_builder(self.builder.order_by(field, dir)?))
    }

    pub fn limit(&self, n: u64) -> CollectionQuery {
        self.with_builder(self.builder.limit(n))
    }

    pub fn offset(&self, n: u64) -> CollectionQuery {
        self.with_builder(self.builder.offset(n))
    }

    pub fn page(&self, page: u64, page_size: u64) -> CollectionQuery {
        self.with_builder(self.builder.page(page, page_size))
    }

    pub fn distinct(&self) -> CollectionQuery {
        self.with_builder(self.builder.distinct())
    }

    pub fn select(&self, fields: &[&str]) -> VellumResult<CollectionQuery> {
        Ok(self.with_builder(self.builder.select(fields)?))
    }

    pub fn group_by(&self, fields: &[&str]) -> VellumResult<CollectionQuery> {
        Ok(self.with_builder(self.builder.group_by(fields)?))
    }

    pub fn having(&self, filter: Filter) -> CollectionQuery {
        self.with_builder(self.builder.having(filter))
    }

    pub fn aggregate(
        &self,
        func: vellum_query::ir::AggregateFn,
        field: &str,
        alias: Option<&str>,
    ) -> VellumResult<CollectionQuery> {
        Ok(self.with_builder(self.builder.aggregate(func, field, alias)?))
    }

    /// Execute and return all matching documents (or projected rows).
    pub async fn to_array(&self) -> VellumResult<Vec<Value>> {
        let hooks = &self.collection.inner.hooks;
        let ctx = self.collection.ctx();
        hooks.dispatch(Hook::BeforeQuery, &ctx).await?;
        let options = self.builder.optimize().into_options();
        let result = self.collection.run_to_array(&options).await;
        match result {
            Ok(rows) => {
                hooks.dispatch(Hook::AfterQuery, &ctx).await?;
                Ok(rows)
            }
            Err(e) => Err(self.collection.fail(e).await),
        }
    }

    /// Execute and return the first matching document.
    pub async fn first(&self) -> VellumResult<Option<Value>> {
        let rows = self.limit(1).to_array().await?;
        Ok(rows.into_iter().next())
    }

    /// Count matching rows.
    pub async fn count(&self) -> VellumResult<u64> {
        let options = self.builder.optimize().into_options();
        self.collection.run_count(&options).await
    }

    /// Stream matching documents in fixed-size chunks.
    pub async fn iterator(&self) -> VellumResult<DocumentStream> {
        let hooks = &self.collection.inner.hooks;
        let ctx = self.collection.ctx();
        hooks.dispatch(Hook::BeforeQuery, &ctx).await?;
        let options = self.builder.optimize().into_options();
        Ok(DocumentStream::new(self.collection.clone(), options))
    }
}

/// A predicate bound to a collection query; finishing it with a comparator
/// resumes the chain.
pub struct CollectionCondition {
    collection: Collection,
    condition: FieldCondition,
}

macro_rules! forward_comparator {
    ($name:ident, $arg:ty) => {
        pub fn $name(self, value: $arg) -> CollectionQuery {
            CollectionQuery {
                collection: self.collection,
                builder: self.condition.$name(value),
            }
        }
    };
}

impl CollectionCondition {
    forward_comparator!(eq, Value);
    forward_comparator!(neq, Value);
    forward_comparator!(gt, Value);
    forward_comparator!(gte, Value);
    forward_comparator!(lt, Value);
    forward_comparator!(lte, Value);
    forward_comparator!(in_list, Vec<Value>);
    forward_comparator!(not_in_list, Vec<Value>);
    forward_comparator!(like, String);
    forward_comparator!(ilike, String);
    forward_comparator!(starts_with, String);
    forward_comparator!(ends_with, String);
    forward_comparator!(contains, String);
    forward_comparator!(exists, bool);
    forward_comparator!(array_contains, Value);
    forward_comparator!(array_not_contains, Value);

    pub fn between(self, low: Value, high: Value) -> CollectionQuery {
        CollectionQuery {
            collection: self.collection,
            builder: self.condition.between(low, high),
        }
    }
}

/// Chunked streaming over a query.
///
/// The default mode paginates by keyset over `_id`: each chunk filters
/// `_id > <last seen>` and orders by `_id`, so rows inserted or deleted
/// mid-scan are never skipped past or returned twice. A caller-imposed
/// ORDER BY or OFFSET (or a join/projection/aggregate shape) pins the row
/// numbering and falls back to limit/offset windows, which cannot make
/// that guarantee under concurrent writes.
pub struct DocumentStream {
    collection: Collection,
    options: QueryOptions,
    buffer: VecDeque<Value>,
    mode: StreamMode,
    remaining: Option<u64>,
    done: bool,
}

enum StreamMode {
    Keyset { cursor: String },
    Windowed { next_offset: u64 },
}

const STREAM_CHUNK: u64 = 256;

fn keyset_eligible(options: &QueryOptions) -> bool {
    options.is_document_query()
        && options.order_by.is_empty()
        && options.offset.is_none()
        && options.joins.is_empty()
        && options.group_by.is_empty()
        && !options.distinct
}

impl DocumentStream {
    fn new(collection: Collection, options: QueryOptions) -> DocumentStream {
        let mode = if keyset_eligible(&options) {
            StreamMode::Keyset {
                cursor: String::new(),
            }
        } else {
            StreamMode::Windowed {
                next_offset: options.offset.unwrap_or(0),
            }
        };
        let remaining = options.limit;
        DocumentStream {
            collection,
            options,
            buffer: VecDeque::new(),
            mode,
            remaining,
            done: false,
        }
    }

    /// Next document, or `None` when the stream is exhausted.
    pub async fn next(&mut self) -> Option<VellumResult<Value>> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill().await {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }

    async fn fill(&mut self) -> VellumResult<()> {
        let chunk = match self.remaining {
            Some(0) => {
                self.done = true;
                return Ok(());
            }
            Some(left) => left.min(STREAM_CHUNK),
            None => STREAM_CHUNK,
        };

        let mut window = self.options.clone();
        window.limit = Some(chunk);
        match &self.mode {
            StreamMode::Keyset { cursor } => {
                window.filters.push(Node::Filter(Filter::new(
                    "_id",
                    CompareOp::Gt,
                    Value::String(cursor.clone()),
                )));
                window.order_by = vec![OrderBy {
                    field: "_id".to_string(),
                    dir: SortDir::Asc,
                }];
                window.offset = None;
            }
            StreamMode::Windowed { next_offset } => {
                window.offset = Some(*next_offset);
            }
        }

        let rows = self.collection.run_to_array(&window).await?;
        let fetched = rows.len() as u64;
        match &mut self.mode {
            StreamMode::Keyset { cursor } => {
                match rows.last().and_then(|doc| doc["_id"].as_str()) {
                    Some(last_id) => *cursor = last_id.to_string(),
                    // Without a cursor the stream cannot advance; stop
                    // instead of refetching the same chunk.
                    None => self.done = true,
                }
            }
            StreamMode::Windowed { next_offset } => {
                *next_offset += fetched;
            }
        }
        if let Some(left) = self.remaining.as_mut() {
            *left -= fetched.min(*left);
        }
        if fetched < chunk {
            self.done = true;
        }
        self.buffer.extend(rows);
        Ok(())
    }
}
