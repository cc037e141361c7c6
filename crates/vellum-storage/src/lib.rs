//! # vellum-storage
//!
//! Owns the SQLite plumbing: a driver adapter over rusqlite (PRAGMA
//! configuration, prepared-statement cache, error classification), a
//! SAVEPOINT-nesting transaction helper, a writer + readers connection
//! pool, and the vec0 extension registration.

pub mod driver;
pub mod pool;
pub mod pragmas;
pub mod txn;
pub mod vector;

pub use driver::{
    classify_error, exec, query_iter, query_rows, ConstraintKind, FailureKind, KeysetRows,
    SqlRow, StorageFailure, KEYSET_CHUNK,
};
pub use pool::{ConnectionPool, PoolHealth, WriteConnection};
pub use txn::{run_in_savepoint, run_in_transaction, TxnBehavior};
pub use vector::{
    blob_to_vector, buffer_pool, register_vector_extension, vector_to_blob, VectorBufferPool,
};
