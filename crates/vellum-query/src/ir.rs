//! Query intermediate representation.
//!
//! The IR is plain data. The builder produces it, the translator consumes
//! it; nothing in here emits SQL.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator of a single filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Like,
    Ilike,
    StartsWith,
    EndsWith,
    Contains,
    Exists,
    Between,
    JsonArrayContains,
    JsonArrayNotContains,
    VectorMatch,
}

/// One predicate over a field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
    /// Upper bound for `Between`.
    pub value2: Option<Value>,
    /// Distance cutoff for `VectorMatch`.
    pub vector_distance: Option<f64>,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: CompareOp, value: Value) -> Filter {
        Filter {
            field: field.into(),
            op,
            value,
            value2: None,
            vector_distance: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    And,
    Or,
}

/// Boolean combination of filters, nested groups, and subqueries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub kind: GroupKind,
    pub children: Vec<Node>,
}

/// A node in the filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Filter(Filter),
    Group(Group),
    Subquery(Subquery),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubqueryOp {
    Exists,
    NotExists,
    In,
    NotIn,
}

/// Correlated or membership subquery against another collection.
///
/// Correlation is explicit: `child_key` names the field on the subquery
/// collection that pairs with `field` on the outer collection. No naming
/// heuristics are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subquery {
    /// Outer-collection field.
    pub field: String,
    pub op: SubqueryOp,
    /// The collection queried inside.
    pub collection: String,
    /// Field on `collection` correlated with / projected for `field`.
    pub child_key: String,
    pub inner: QueryOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    pub fn sql(self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub func: AggregateFn,
    /// `*` is accepted for COUNT.
    pub field: String,
    pub alias: Option<String>,
    pub distinct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    pub fn sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL OUTER JOIN",
        }
    }
}

/// Equi-join against another collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub kind: JoinKind,
    pub collection: String,
    /// Base-side field.
    pub left: String,
    /// Joined-side field.
    pub right: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub dir: SortDir,
}

/// Everything a SELECT translation needs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub filters: Vec<Node>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub group_by: Vec<String>,
    pub having: Vec<Node>,
    pub distinct: bool,
    pub aggregates: Vec<Aggregate>,
    pub joins: Vec<Join>,
    pub select_fields: Vec<String>,
}

impl QueryOptions {
    pub fn is_document_query(&self) -> bool {
        self.aggregates.is_empty() && self.select_fields.is_empty()
    }
}
