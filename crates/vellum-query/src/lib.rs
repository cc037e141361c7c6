//! # vellum-query
//!
//! The declarative query layer: a typed filter/group/subquery/join/aggregate
//! IR, an immutable chaining builder that validates field paths against the
//! collection schema, the table/trigger/index DDL generator, and the
//! translator that turns IR into parameterized SQL.
//!
//! Translation is deterministic: equal IRs produce byte-identical SQL.

pub mod builder;
pub mod ddl;
pub mod ir;
pub mod translate;

pub use builder::{FieldCondition, QueryBuilder};
pub use ddl::{build_table_sql, trigger_names, vector_table_name, TableSql};
pub use ir::{
    Aggregate, AggregateFn, CompareOp, Filter, Group, GroupKind, Join, JoinKind, Node, OrderBy,
    QueryOptions, SortDir, Subquery, SubqueryOp,
};
pub use translate::{
    build_atomic_update, build_count, build_delete, build_insert, build_insert_many,
    build_select, build_update, build_upsert, build_vector_delete, build_vector_insert,
    build_vector_search, column_params, EmptyCatalog, SqlQuery, TableCatalog, TableMeta,
    UpdateOperators,
};
