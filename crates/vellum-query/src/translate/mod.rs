//! IR → parameterized SQL translation.
//!
//! Field access resolves to a synthesized column when the path is
//! constrained, otherwise to `json_extract(doc, '$.path')`. Every literal
//! is parameterized; every identifier has passed the validator before it
//! reaches an emitted string. Translation is pure and deterministic —
//! equal IRs produce byte-identical SQL.

mod mutate;
mod select;
mod vector;

pub use mutate::{
    build_atomic_update, build_delete, build_insert, build_insert_many, build_update,
    build_upsert, column_params, UpdateOperators,
};
pub use select::{build_count, build_select};
pub use vector::{build_vector_delete, build_vector_insert, build_vector_search};

use serde_json::Value;

use vellum_core::codec::as_tagged_date;
use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::fields::{column_name, ConstrainedFields, SqlValue};

use crate::ir::{CompareOp, Filter, Group, GroupKind, Node, QueryOptions, Subquery, SubqueryOp};

/// A translated statement: SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// What the translator needs to know about one table.
#[derive(Debug, Clone, Copy)]
pub struct TableMeta<'a> {
    pub table: &'a str,
    pub fields: &'a ConstrainedFields,
}

/// Lookup for the constrained fields of sibling collections, used by joins
/// and subqueries.
pub trait TableCatalog {
    fn fields_of(&self, table: &str) -> Option<&ConstrainedFields>;
}

/// Catalog for single-collection queries.
pub struct EmptyCatalog;

impl TableCatalog for EmptyCatalog {
    fn fields_of(&self, _table: &str) -> Option<&ConstrainedFields> {
        None
    }
}

impl TableCatalog for std::collections::BTreeMap<String, ConstrainedFields> {
    fn fields_of(&self, table: &str) -> Option<&ConstrainedFields> {
        self.get(table)
    }
}

/// Resolution context: the base table plus any joined tables.
pub(crate) struct QueryContext<'a> {
    pub base: TableMeta<'a>,
    pub joined: Vec<TableMeta<'a>>,
}

impl<'a> QueryContext<'a> {
    pub fn single(base: TableMeta<'a>) -> QueryContext<'a> {
        QueryContext {
            base,
            joined: Vec::new(),
        }
    }

    pub fn for_options(
        base: TableMeta<'a>,
        options: &'a QueryOptions,
        catalog: &'a dyn TableCatalog,
    ) -> VellumResult<QueryContext<'a>> {
        let mut joined = Vec::with_capacity(options.joins.len());
        for join in &options.joins {
            let fields = catalog.fields_of(&join.collection).ok_or_else(|| {
                VellumError::validation(format!(
                    "joined collection '{}' is not registered",
                    join.collection
                ))
            })?;
            joined.push(TableMeta {
                table: join.collection.as_str(),
                fields,
            });
        }
        Ok(QueryContext { base, joined })
    }

    fn table_named(&self, name: &str) -> Option<&TableMeta<'a>> {
        if self.base.table == name {
            return Some(&self.base);
        }
        self.joined.iter().find(|t| t.table == name)
    }

    /// SQL expression for a field within one specific table.
    fn expr_in_table(table: &TableMeta<'_>, field: &str) -> String {
        if field == "_id" || field == "_version" {
            return format!("{}.{field}", table.table);
        }
        if table.fields.contains_key(field) {
            return format!("{}.{}", table.table, column_name(field));
        }
        format!("json_extract({}.doc, '$.{field}')", table.table)
    }

    /// Resolve a (possibly table-qualified) field to a SQL expression.
    ///
    /// Unqualified fields default to the base table. An unqualified field
    /// that is constrained on more than one declared table is ambiguous
    /// and rejected rather than silently coalesced.
    pub fn field_expr(&self, field: &str) -> VellumResult<String> {
        if let Some((head, rest)) = field.split_once('.') {
            if let Some(table) = self.table_named(head) {
                return Ok(Self::expr_in_table(table, rest));
            }
        }

        if !self.joined.is_empty() {
            let constrained_in = std::iter::once(&self.base)
                .chain(self.joined.iter())
                .filter(|t| t.fields.contains_key(field) || field == "_id" || field == "_version")
                .count();
            if constrained_in > 1 {
                return Err(VellumError::validation(format!(
                    "field '{field}' is ambiguous across joined collections; qualify it as 'table.field'"
                )));
            }
        }

        Ok(Self::expr_in_table(&self.base, field))
    }
}

/// Convert a JSON literal to a bind parameter. Booleans become 0/1;
/// tagged dates become RFC 3339 text; arrays and objects bind as JSON text.
pub(crate) fn value_to_param(value: &Value) -> VellumResult<SqlValue> {
    if let Some(dt) = as_tagged_date(value) {
        return Ok(SqlValue::Text(dt.to_rfc3339()));
    }
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().ok_or_else(|| {
                VellumError::validation(format!("number {n} is not representable"))
            })?),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(serde_json::to_string(other)?),
    })
}

/// Render the filter tree as one SQL boolean expression, appending bind
/// parameters to `params`.
pub(crate) fn render_nodes(
    ctx: &QueryContext<'_>,
    nodes: &[Node],
    joiner: GroupKind,
    catalog: &dyn TableCatalog,
    params: &mut Vec<SqlValue>,
) -> VellumResult<String> {
    let mut parts = Vec::with_capacity(nodes.len());
    for node in nodes {
        parts.push(render_node(ctx, node, catalog, params)?);
    }
    let sep = match joiner {
        GroupKind::And => " AND ",
        GroupKind::Or => " OR ",
    };
    Ok(parts.join(sep))
}

fn render_node(
    ctx: &QueryContext<'_>,
    node: &Node,
    catalog: &dyn TableCatalog,
    params: &mut Vec<SqlValue>,
) -> VellumResult<String> {
    match node {
        Node::Filter(filter) => render_filter(ctx, filter, params),
        Node::Group(group) => render_group(ctx, group, catalog, params),
        Node::Subquery(subquery) => render_subquery(ctx, subquery, catalog, params),
    }
}

fn render_group(
    ctx: &QueryContext<'_>,
    group: &Group,
    catalog: &dyn TableCatalog,
    params: &mut Vec<SqlValue>,
) -> VellumResult<String> {
    if group.children.is_empty() {
        // An empty AND is vacuously true, an empty OR vacuously false.
        return Ok(match group.kind {
            GroupKind::And => "1 = 1".to_string(),
            GroupKind::Or => "1 = 0".to_string(),
        });
    }
    let inner = render_nodes(ctx, &group.children, group.kind, catalog, params)?;
    Ok(format!("({inner})"))
}

fn render_filter(
    ctx: &QueryContext<'_>,
    filter: &Filter,
    params: &mut Vec<SqlValue>,
) -> VellumResult<String> {
    let expr = ctx.field_expr(&filter.field)?;
    match filter.op {
        CompareOp::Eq => {
            if filter.value.is_null() {
                Ok(format!("{expr} IS NULL"))
            } else {
                params.push(value_to_param(&filter.value)?);
                Ok(format!("{expr} = ?"))
            }
        }
        CompareOp::Neq => {
            if filter.value.is_null() {
                Ok(format!("{expr} IS NOT NULL"))
            } else {
                params.push(value_to_param(&filter.value)?);
                Ok(format!("{expr} != ?"))
            }
        }
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let op = match filter.op {
                CompareOp::Gt => ">",
                CompareOp::Gte => ">=",
                CompareOp::Lt => "<",
                _ => "<=",
            };
            params.push(value_to_param(&filter.value)?);
            Ok(format!("{expr} {op} ?"))
        }
        CompareOp::In | CompareOp::Nin => {
            let items = filter.value.as_array().ok_or_else(|| {
                VellumError::validation(format!(
                    "'{}' requires an array operand",
                    if filter.op == CompareOp::In { "in" } else { "nin" }
                ))
            })?;
            if items.is_empty() {
                return Ok(match filter.op {
                    CompareOp::In => "1 = 0".to_string(),
                    _ => "1 = 1".to_string(),
                });
            }
            for item in items {
                params.push(value_to_param(item)?);
            }
            let placeholders = vec!["?"; items.len()].join(", ");
            let keyword = if filter.op == CompareOp::In { "IN" } else { "NOT IN" };
            Ok(format!("{expr} {keyword} ({placeholders})"))
        }
        CompareOp::Like => {
            params.push(value_to_param(&filter.value)?);
            Ok(format!("{expr} LIKE ?"))
        }
        CompareOp::Ilike => {
            params.push(value_to_param(&filter.value)?);
            Ok(format!("LOWER({expr}) LIKE LOWER(?)"))
        }
        CompareOp::StartsWith | CompareOp::EndsWith | CompareOp::Contains => {
            let needle = filter.value.as_str().ok_or_else(|| {
                VellumError::validation("pattern operators require a string operand")
            })?;
            let pattern = match filter.op {
                CompareOp::StartsWith => format!("{needle}%"),
                CompareOp::EndsWith => format!("%{needle}"),
                _ => format!("%{needle}%"),
            };
            params.push(SqlValue::Text(pattern));
            Ok(format!("{expr} LIKE ?"))
        }
        CompareOp::Exists => {
            let present = filter.value.as_bool().unwrap_or(true);
            if present {
                Ok(format!("{expr} IS NOT NULL"))
            } else {
                Ok(format!("{expr} IS NULL"))
            }
        }
        CompareOp::Between => {
            let high = filter.value2.as_ref().ok_or_else(|| {
                VellumError::validation("'between' requires an upper bound")
            })?;
            params.push(value_to_param(&filter.value)?);
            params.push(value_to_param(high)?);
            Ok(format!("{expr} BETWEEN ? AND ?"))
        }
        CompareOp::JsonArrayContains | CompareOp::JsonArrayNotContains => {
            params.push(value_to_param(&filter.value)?);
            let prefix = if filter.op == CompareOp::JsonArrayContains {
                "EXISTS"
            } else {
                "NOT EXISTS"
            };
            Ok(format!(
                "{prefix} (SELECT 1 FROM json_each({expr}) WHERE json_each.value = ?)"
            ))
        }
        CompareOp::VectorMatch => Err(VellumError::validation(
            "vector_match is only valid inside vector_search",
        )),
    }
}

fn render_subquery(
    ctx: &QueryContext<'_>,
    subquery: &Subquery,
    catalog: &dyn TableCatalog,
    params: &mut Vec<SqlValue>,
) -> VellumResult<String> {
    let child_fields = catalog.fields_of(&subquery.collection).ok_or_else(|| {
        VellumError::validation(format!(
            "subquery collection '{}' is not registered",
            subquery.collection
        ))
    })?;
    let child = TableMeta {
        table: subquery.collection.as_str(),
        fields: child_fields,
    };
    let child_ctx = QueryContext::single(child);
    let child_key_expr = child_ctx.field_expr(&subquery.child_key)?;
    let outer_expr = ctx.field_expr(&subquery.field)?;

    let mut inner_where = String::new();
    if !subquery.inner.filters.is_empty() {
        let rendered = render_nodes(
            &child_ctx,
            &subquery.inner.filters,
            GroupKind::And,
            catalog,
            params,
        )?;
        inner_where = format!(" AND {rendered}");
    }
    let limit = match subquery.inner.limit {
        Some(n) => format!(" LIMIT {n}"),
        None => String::new(),
    };

    match subquery.op {
        SubqueryOp::Exists | SubqueryOp::NotExists => {
            let keyword = if subquery.op == SubqueryOp::Exists {
                "EXISTS"
            } else {
                "NOT EXISTS"
            };
            Ok(format!(
                "{keyword} (SELECT 1 FROM {} WHERE {child_key_expr} = {outer_expr}{inner_where}{limit})",
                subquery.collection
            ))
        }
        SubqueryOp::In | SubqueryOp::NotIn => {
            let keyword = if subquery.op == SubqueryOp::In { "IN" } else { "NOT IN" };
            let where_clause = if inner_where.is_empty() {
                String::new()
            } else {
                // Strip the leading " AND " — this is the whole clause.
                format!(" WHERE {}", &inner_where[5..])
            };
            Ok(format!(
                "{outer_expr} {keyword} (SELECT {child_key_expr} FROM {}{where_clause}{limit})",
                subquery.collection
            ))
        }
    }
}
