//! # vellum
//!
//! Embedded document store over SQLite: schema-validated JSON documents in
//! named collections, synthesized columns for SQL-level constraints and
//! indexing, per-document versions for optimistic concurrency, a typed
//! query builder translated to parameterized SQL, and vec0 vector search.
//!
//! ```no_run
//! use serde_json::json;
//! use vellum::{CollectionConfig, Database, FieldDefinition, Schema, SchemaNode};
//!
//! # async fn demo() -> vellum::VellumResult<()> {
//! let db = Database::open_in_memory().await?;
//! let products = db
//!     .collection(
//!         CollectionConfig::new(
//!             "products",
//!             Schema::object([
//!                 ("name", SchemaNode::String),
//!                 ("price", SchemaNode::Number),
//!             ]),
//!         )
//!         .field("price", FieldDefinition::real().indexed()),
//!     )
//!     .await?;
//!
//! let stored = products.insert(json!({"name": "anvil", "price": 9.5})).await?;
//! let cheap = products.where_field("price")?.lt(json!(10.0)).to_array().await?;
//! # let _ = (stored, cheap);
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod database;
pub mod hooks;
pub mod migrate;
pub(crate) mod ops;

pub use collection::{
    Collection, CollectionCondition, CollectionConfig, CollectionQuery, DocumentStream,
    RebuildReport, Upgrade, VectorMatch, VectorSearch,
};
pub use database::{Database, DatabaseHealth, TransactionScope};
pub use hooks::{Hook, HookContext, HookMode, Plugin, PluginManager};
pub use migrate::{MigrationState, MigrationStatus, UpgradeContext};

pub use vellum_core::config::{DatabaseOptions, DriverKind, PoolOptions, SqliteOptions};
pub use vellum_core::errors::{VellumError, VellumResult};
pub use vellum_core::fields::{
    FieldDefinition, ForeignKey, RefAction, SqlValue, SqliteType, VectorElement, VectorSpec,
};
pub use vellum_core::schema::{Schema, SchemaNode};
pub use vellum_query::ir::{
    AggregateFn, CompareOp, Filter, JoinKind, QueryOptions, SortDir, Subquery, SubqueryOp,
};
pub use vellum_query::translate::UpdateOperators;
