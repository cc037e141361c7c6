//! Immutable query builder.
//!
//! Every chaining operation returns a new builder with a copied filter
//! list; a builder held at any point in a chain stays valid. Field paths
//! are validated against the collection schema at build time, so an
//! unknown field fails here rather than deep inside SQL translation.
//!
//! `where_field` returns a [`FieldCondition`] — a sub-object that cannot
//! execute until a comparator has been applied.

use std::sync::Arc;

use serde_json::Value;

use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::ident::validate_field_path;
use vellum_core::schema::Schema;

use crate::ir::{
    Aggregate, AggregateFn, CompareOp, Filter, Group, GroupKind, Join, JoinKind, Node, OrderBy,
    QueryOptions, SortDir, Subquery,
};

/// Shorthand constructors so `or_where` callers can build filters inline.
impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::new(field, CompareOp::Eq, value.into())
    }

    pub fn neq(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::new(field, CompareOp::Neq, value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::new(field, CompareOp::Gt, value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::new(field, CompareOp::Gte, value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::new(field, CompareOp::Lt, value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::new(field, CompareOp::Lte, value.into())
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Filter {
        Filter::new(field, CompareOp::Like, Value::String(pattern.into()))
    }
}

/// Immutable builder over one collection's query options.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    collection: String,
    schema: Arc<Schema>,
    options: QueryOptions,
}

impl QueryBuilder {
    pub fn new(collection: impl Into<String>, schema: Arc<Schema>) -> QueryBuilder {
        QueryBuilder {
            collection: collection.into(),
            schema,
            options: QueryOptions::default(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn into_options(self) -> QueryOptions {
        self.options
    }

    /// Validate a field path for this query: schema fields, the engine
    /// columns `_id`/`_version`, and `table.field` references to a declared
    /// join or the base collection.
    fn check_field(&self, path: &str) -> VellumResult<()> {
        validate_field_path(path)?;
        if path == "_id" || path == "_version" {
            return Ok(());
        }
        if self.schema.resolve_path(path).is_some() {
            return Ok(());
        }
        if let Some((head, _rest)) = path.split_once('.') {
            if head == self.collection || self.options.joins.iter().any(|j| j.collection == head) {
                return Ok(());
            }
        }
        Err(VellumError::validation(format!(
            "unknown field '{path}' in collection '{}'",
            self.collection
        )))
    }

    fn with_options(&self, options: QueryOptions) -> QueryBuilder {
        QueryBuilder {
            collection: self.collection.clone(),
            schema: Arc::clone(&self.schema),
            options,
        }
    }

    /// Start a predicate on `path`. The returned condition must be finished
    /// with a comparator before the chain can continue.
    pub fn where_field(&self, path: impl Into<String>) -> VellumResult<FieldCondition> {
        let path = path.into();
        self.check_field(&path)?;
        Ok(FieldCondition {
            builder: self.clone(),
            field: path,
        })
    }

    /// AND an already-built filter onto the chain.
    pub fn and_where(&self, filter: Filter) -> VellumResult<QueryBuilder> {
        self.check_field(&filter.field)?;
        let mut options = self.options.clone();
        options.filters.push(Node::Filter(filter));
        Ok(self.with_options(options))
    }

    /// OR-combine a set of filters as one group.
    pub fn or_where(&self, filters: Vec<Filter>) -> VellumResult<QueryBuilder> {
        for f in &filters {
            self.check_field(&f.field)?;
        }
        let mut options = self.options.clone();
        options.filters.push(Node::Group(Group {
            kind: GroupKind::Or,
            children: filters.into_iter().map(Node::Filter).collect(),
        }));
        Ok(self.with_options(options))
    }

    /// AND-combine a set of filters as one group.
    pub fn and_group(&self, filters: Vec<Filter>) -> VellumResult<QueryBuilder> {
        for f in &filters {
            self.check_field(&f.field)?;
        }
        let mut options = self.options.clone();
        options.filters.push(Node::Group(Group {
            kind: GroupKind::And,
            children: filters.into_iter().map(Node::Filter).collect(),
        }));
        Ok(self.with_options(options))
    }

    /// Add a correlated or membership subquery.
    pub fn where_subquery(&self, subquery: Subquery) -> VellumResult<QueryBuilder> {
        self.check_field(&subquery.field)?;
        validate_field_path(&subquery.child_key)?;
        let mut options = self.options.clone();
        options.filters.push(Node::Subquery(subquery));
        Ok(self.with_options(options))
    }

    pub fn join(
        &self,
        kind: JoinKind,
        collection: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
    ) -> VellumResult<QueryBuilder> {
        let collection = collection.into();
        let left = left.into();
        let right = right.into();
        vellum_core::ident::validate_collection_name(&collection)?;
        validate_field_path(&right)?;
        let mut options = self.options.clone();
        options.joins.push(Join {
            kind,
            collection,
            left: left.clone(),
            right,
        });
        // The base-side field may itself be join-prefixed, so validate it
        // against the updated join list.
        let next = self.with_options(options);
        next.check_field(&left)?;
        Ok(next)
    }

    pub fn order_by(&self, field: impl Into<String>, dir: SortDir) -> VellumResult<QueryBuilder> {
        let field = field.into();
        self.check_field(&field)?;
        let mut options = self.options.clone();
        options.order_by.push(OrderBy { field, dir });
        Ok(self.with_options(options))
    }

    pub fn limit(&self, n: u64) -> QueryBuilder {
        let mut options = self.options.clone();
        options.limit = Some(n);
        self.with_options(options)
    }

    pub fn offset(&self, n: u64) -> QueryBuilder {
        let mut options = self.options.clone();
        options.offset = Some(n);
        self.with_options(options)
    }

    /// 1-based page sugar over limit/offset.
    pub fn page(&self, page: u64, page_size: u64) -> QueryBuilder {
        let page = page.max(1);
        let mut options = self.options.clone();
        options.limit = Some(page_size);
        options.offset = Some((page - 1) * page_size);
        self.with_options(options)
    }

    pub fn distinct(&self) -> QueryBuilder {
        let mut options = self.options.clone();
        options.distinct = true;
        self.with_options(options)
    }

    pub fn select(&self, fields: &[&str]) -> VellumResult<QueryBuilder> {
        for f in fields {
            self.check_field(f)?;
        }
        let mut options = self.options.clone();
        options.select_fields = fields.iter().map(|f| f.to_string()).collect();
        Ok(self.with_options(options))
    }

    pub fn group_by(&self, fields: &[&str]) -> VellumResult<QueryBuilder> {
        for f in fields {
            self.check_field(f)?;
        }
        let mut options = self.options.clone();
        options.group_by = fields.iter().map(|f| f.to_string()).collect();
        Ok(self.with_options(options))
    }

    pub fn having(&self, filter: Filter) -> QueryBuilder {
        // HAVING references aggregate aliases, which are not schema fields;
        // alias resolution happens in the translator.
        let mut options = self.options.clone();
        options.having.push(Node::Filter(filter));
        self.with_options(options)
    }

    pub fn aggregate(
        &self,
        func: AggregateFn,
        field: &str,
        alias: Option<&str>,
    ) -> VellumResult<QueryBuilder> {
        if field != "*" {
            self.check_field(field)?;
        } else if func != AggregateFn::Count {
            return Err(VellumError::validation("'*' is only valid with COUNT"));
        }
        let mut options = self.options.clone();
        options.aggregates.push(Aggregate {
            func,
            field: field.to_string(),
            alias: alias.map(str::to_string),
            distinct: false,
        });
        Ok(self.with_options(options))
    }

    pub fn aggregate_distinct(
        &self,
        func: AggregateFn,
        field: &str,
        alias: Option<&str>,
    ) -> VellumResult<QueryBuilder> {
        let mut next = self.aggregate(func, field, alias)?;
        if let Some(last) = next.options.aggregates.last_mut() {
            last.distinct = true;
        }
        Ok(next)
    }

    /// Small rewrites: flatten single-child groups, then drop redundant
    /// range filters (keep the strongest bound per field and direction).
    pub fn optimize(&self) -> QueryBuilder {
        let mut options = self.options.clone();
        options.filters = options.filters.into_iter().map(flatten_node).collect();
        options.filters = eliminate_redundant_ranges(options.filters);
        self.with_options(options)
    }
}

/// A predicate under construction. Only comparator methods can turn it back
/// into an executable builder.
#[derive(Debug, Clone)]
pub struct FieldCondition {
    builder: QueryBuilder,
    field: String,
}

impl FieldCondition {
    fn finish(self, op: CompareOp, value: Value, value2: Option<Value>) -> QueryBuilder {
        let mut options = self.builder.options.clone();
        options.filters.push(Node::Filter(Filter {
            field: self.field,
            op,
            value,
            value2,
            vector_distance: None,
        }));
        self.builder.with_options(options)
    }

    pub fn eq(self, value: impl Into<Value>) -> QueryBuilder {
        self.finish(CompareOp::Eq, value.into(), None)
    }

    pub fn neq(self, value: impl Into<Value>) -> QueryBuilder {
        self.finish(CompareOp::Neq, value.into(), None)
    }

    pub fn gt(self, value: impl Into<Value>) -> QueryBuilder {
        self.finish(CompareOp::Gt, value.into(), None)
    }

    pub fn gte(self, value: impl Into<Value>) -> QueryBuilder {
        self.finish(CompareOp::Gte, value.into(), None)
    }

    pub fn lt(self, value: impl Into<Value>) -> QueryBuilder {
        self.finish(CompareOp::Lt, value.into(), None)
    }

    pub fn lte(self, value: impl Into<Value>) -> QueryBuilder {
        self.finish(CompareOp::Lte, value.into(), None)
    }

    pub fn in_list(self, values: Vec<Value>) -> QueryBuilder {
        self.finish(CompareOp::In, Value::Array(values), None)
    }

    pub fn not_in_list(self, values: Vec<Value>) -> QueryBuilder {
        self.finish(CompareOp::Nin, Value::Array(values), None)
    }

    pub fn like(self, pattern: impl Into<String>) -> QueryBuilder {
        self.finish(CompareOp::Like, Value::String(pattern.into()), None)
    }

    pub fn ilike(self, pattern: impl Into<String>) -> QueryBuilder {
        self.finish(CompareOp::Ilike, Value::String(pattern.into()), None)
    }

    pub fn starts_with(self, prefix: impl Into<String>) -> QueryBuilder {
        self.finish(CompareOp::StartsWith, Value::String(prefix.into()), None)
    }

    pub fn ends_with(self, suffix: impl Into<String>) -> QueryBuilder {
        self.finish(CompareOp::EndsWith, Value::String(suffix.into()), None)
    }

    pub fn contains(self, needle: impl Into<String>) -> QueryBuilder {
        self.finish(CompareOp::Contains, Value::String(needle.into()), None)
    }

    /// `exists(true)` → IS NOT NULL; `exists(false)` → IS NULL.
    pub fn exists(self, present: bool) -> QueryBuilder {
        self.finish(CompareOp::Exists, Value::Bool(present), None)
    }

    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> QueryBuilder {
        self.finish(CompareOp::Between, low.into(), Some(high.into()))
    }

    pub fn array_contains(self, value: impl Into<Value>) -> QueryBuilder {
        self.finish(CompareOp::JsonArrayContains, value.into(), None)
    }

    pub fn array_not_contains(self, value: impl Into<Value>) -> QueryBuilder {
        self.finish(CompareOp::JsonArrayNotContains, value.into(), None)
    }
}

/// Flatten single-child groups recursively.
fn flatten_node(node: Node) -> Node {
    match node {
        Node::Group(mut group) => {
            group.children = group.children.into_iter().map(flatten_node).collect();
            if group.children.len() == 1 {
                group.children.pop().unwrap()
            } else {
                Node::Group(group)
            }
        }
        other => other,
    }
}

fn bound_of(filter: &Filter) -> Option<f64> {
    filter.value.as_f64()
}

/// Among top-level AND range filters on the same field, keep only the
/// strongest lower bound and the strongest upper bound.
fn eliminate_redundant_ranges(nodes: Vec<Node>) -> Vec<Node> {
    let mut kept: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();

    for i in 0..kept.len() {
        for j in 0..kept.len() {
            if i == j {
                continue;
            }
            let (Some(Node::Filter(a)), Some(Node::Filter(b))) = (&kept[i], &kept[j]) else {
                continue;
            };
            if a.field != b.field {
                continue;
            }
            let (Some(av), Some(bv)) = (bound_of(a), bound_of(b)) else {
                continue;
            };
            use CompareOp::{Gt, Gte, Lt, Lte};
            let a_lower = matches!(a.op, Gt | Gte);
            let b_lower = matches!(b.op, Gt | Gte);
            let a_upper = matches!(a.op, Lt | Lte);
            let b_upper = matches!(b.op, Lt | Lte);
            // Drop `b` when `a` subsumes it.
            let subsumed = (a_lower && b_lower && av >= bv) || (a_upper && b_upper && av <= bv);
            if subsumed && (av != bv || i < j) {
                kept[j] = None;
            }
        }
    }

    kept.into_iter().flatten().collect()
}
