//! # vellum-core
//!
//! Core types for the vellum embedded document store: the error taxonomy,
//! identifier validation, the schema AST and structural validator, the
//! constrained-field model, the date-tagged JSON codec with its bounded
//! parse cache, and configuration.
//!
//! This crate is storage-agnostic — nothing in here touches SQLite.

pub mod codec;
pub mod config;
pub mod errors;
pub mod fields;
pub mod ident;
pub mod schema;

pub use codec::{document_cache, DocumentCache};
pub use config::{DatabaseOptions, DriverKind, PoolOptions, SqliteOptions};
pub use errors::{VellumError, VellumResult};
pub use fields::{FieldDefinition, ForeignKey, RefAction, SqlValue, SqliteType, VectorSpec};
pub use schema::{Schema, SchemaNode};
