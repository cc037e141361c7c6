//! SELECT translation: projection, joins, grouping, ordering, paging.

use std::fmt::Write as _;

use vellum_core::errors::{VellumError, VellumResult};
use vellum_core::fields::SqlValue;
use vellum_core::ident::{validate_identifier, IdentKind};

use crate::ir::{GroupKind, QueryOptions};

use super::{render_nodes, QueryContext, SqlQuery, TableCatalog, TableMeta};

/// Translate query options into a full SELECT statement.
pub fn build_select(
    base: TableMeta<'_>,
    options: &QueryOptions,
    catalog: &dyn TableCatalog,
) -> VellumResult<SqlQuery> {
    let ctx = QueryContext::for_options(base, options, catalog)?;
    let mut params = Vec::new();

    let mut sql = String::from("SELECT ");
    if options.distinct {
        sql.push_str("DISTINCT ");
    }
    sql.push_str(&projection(&ctx, options)?);

    write!(sql, " FROM {}", base.table).expect("writing to String");
    for (join, meta) in options.joins.iter().zip(ctx.joined.iter()) {
        let left = ctx.field_expr(&join.left)?;
        let right = QueryContext::single(*meta).field_expr(&join.right)?;
        write!(sql, " {} {} ON {left} = {right}", join.kind.sql(), join.collection)
            .expect("writing to String");
    }

    if !options.filters.is_empty() {
        let where_clause =
            render_nodes(&ctx, &options.filters, GroupKind::And, catalog, &mut params)?;
        write!(sql, " WHERE {where_clause}").expect("writing to String");
    }

    if !options.group_by.is_empty() {
        let mut exprs = Vec::with_capacity(options.group_by.len());
        for field in &options.group_by {
            exprs.push(ctx.field_expr(field)?);
        }
        write!(sql, " GROUP BY {}", exprs.join(", ")).expect("writing to String");
    }

    if !options.having.is_empty() {
        let having_ctx = AliasAware {
            ctx: &ctx,
            options,
        };
        let mut parts = Vec::with_capacity(options.having.len());
        for node in &options.having {
            match node {
                crate::ir::Node::Filter(f) => {
                    let expr = having_ctx.expr(&f.field)?;
                    parts.push(render_having_filter(&expr, f, &mut params)?);
                }
                other => {
                    return Err(VellumError::validation(format!(
                        "HAVING only supports plain filters, got {other:?}"
                    )))
                }
            }
        }
        write!(sql, " HAVING {}", parts.join(" AND ")).expect("writing to String");
    }

    if !options.order_by.is_empty() {
        let mut parts = Vec::with_capacity(options.order_by.len());
        for order in &options.order_by {
            let expr = if is_aggregate_alias(options, &order.field) {
                order.field.clone()
            } else {
                ctx.field_expr(&order.field)?
            };
            parts.push(format!("{expr} {}", order.dir.sql()));
        }
        write!(sql, " ORDER BY {}", parts.join(", ")).expect("writing to String");
    }

    match (options.limit, options.offset) {
        (Some(limit), Some(offset)) => {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(SqlValue::Integer(limit as i64));
            params.push(SqlValue::Integer(offset as i64));
        }
        (Some(limit), None) => {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(limit as i64));
        }
        (None, Some(offset)) => {
            // SQLite requires LIMIT before OFFSET; use the max safe value.
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(SqlValue::Integer(i64::MAX));
            params.push(SqlValue::Integer(offset as i64));
        }
        (None, None) => {}
    }

    Ok(SqlQuery { sql, params })
}

/// Translate to `SELECT COUNT(*)` with the same FROM/WHERE shape.
pub fn build_count(
    base: TableMeta<'_>,
    options: &QueryOptions,
    catalog: &dyn TableCatalog,
) -> VellumResult<SqlQuery> {
    let ctx = QueryContext::for_options(base, options, catalog)?;
    let mut params = Vec::new();

    let mut sql = format!("SELECT COUNT(*) FROM {}", base.table);
    for (join, meta) in options.joins.iter().zip(ctx.joined.iter()) {
        let left = ctx.field_expr(&join.left)?;
        let right = QueryContext::single(*meta).field_expr(&join.right)?;
        write!(sql, " {} {} ON {left} = {right}", join.kind.sql(), join.collection)
            .expect("writing to String");
    }
    if !options.filters.is_empty() {
        let where_clause =
            render_nodes(&ctx, &options.filters, GroupKind::And, catalog, &mut params)?;
        write!(sql, " WHERE {where_clause}").expect("writing to String");
    }

    Ok(SqlQuery { sql, params })
}

fn projection(ctx: &QueryContext<'_>, options: &QueryOptions) -> VellumResult<String> {
    if !options.aggregates.is_empty() {
        let mut parts = Vec::new();
        for field in &options.group_by {
            parts.push(format!("{} AS \"{field}\"", ctx.field_expr(field)?));
        }
        for agg in &options.aggregates {
            let inner = if agg.field == "*" {
                "*".to_string()
            } else {
                ctx.field_expr(&agg.field)?
            };
            let distinct = if agg.distinct { "DISTINCT " } else { "" };
            let mut part = format!("{}({distinct}{inner})", agg.func.sql());
            if let Some(alias) = &agg.alias {
                validate_identifier(alias, IdentKind::Column)?;
                write!(part, " AS {alias}").expect("writing to String");
            }
            parts.push(part);
        }
        return Ok(parts.join(", "));
    }

    if !options.select_fields.is_empty() {
        let mut parts = Vec::with_capacity(options.select_fields.len());
        for field in &options.select_fields {
            parts.push(format!("{} AS \"{field}\"", ctx.field_expr(field)?));
        }
        return Ok(parts.join(", "));
    }

    let t = ctx.base.table;
    Ok(format!("{t}.doc AS doc, {t}._id AS _id, {t}._version AS _version"))
}

fn is_aggregate_alias(options: &QueryOptions, field: &str) -> bool {
    options
        .aggregates
        .iter()
        .any(|a| a.alias.as_deref() == Some(field))
}

/// HAVING field resolution: aggregate aliases win over document paths.
struct AliasAware<'a> {
    ctx: &'a QueryContext<'a>,
    options: &'a QueryOptions,
}

impl AliasAware<'_> {
    fn expr(&self, field: &str) -> VellumResult<String> {
        if is_aggregate_alias(self.options, field) {
            validate_identifier(field, IdentKind::Column)?;
            return Ok(field.to_string());
        }
        self.ctx.field_expr(field)
    }
}

fn render_having_filter(
    expr: &str,
    filter: &crate::ir::Filter,
    params: &mut Vec<SqlValue>,
) -> VellumResult<String> {
    use crate::ir::CompareOp;
    let op = match filter.op {
        CompareOp::Eq => "=",
        CompareOp::Neq => "!=",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
        other => {
            return Err(VellumError::validation(format!(
                "HAVING supports comparison operators only, got {other:?}"
            )))
        }
    };
    params.push(super::value_to_param(&filter.value)?);
    Ok(format!("{expr} {op} ?"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Aggregate, AggregateFn, CompareOp, Filter, Join, JoinKind, Node, OrderBy, SortDir,
        Subquery, SubqueryOp,
    };
    use crate::translate::EmptyCatalog;
    use serde_json::json;
    use std::collections::BTreeMap;
    use vellum_core::fields::{ConstrainedFields, FieldDefinition};

    fn fields() -> ConstrainedFields {
        let mut f = ConstrainedFields::new();
        f.insert("price".to_string(), FieldDefinition::real());
        f
    }

    fn opts(filters: Vec<Node>) -> QueryOptions {
        QueryOptions {
            filters,
            ..Default::default()
        }
    }

    #[test]
    fn test_document_projection() {
        let f = fields();
        let base = TableMeta { table: "items", fields: &f };
        let q = build_select(base, &QueryOptions::default(), &EmptyCatalog).unwrap();
        assert_eq!(
            q.sql,
            "SELECT items.doc AS doc, items._id AS _id, items._version AS _version FROM items"
        );
    }

    #[test]
    fn test_constrained_field_uses_column() {
        let f = fields();
        let base = TableMeta { table: "items", fields: &f };
        let q = build_select(
            base,
            &opts(vec![Node::Filter(Filter::gt("price", json!(9.5)))]),
            &EmptyCatalog,
        )
        .unwrap();
        assert!(q.sql.ends_with("WHERE items.price > ?"));
        assert_eq!(q.params, vec![SqlValue::Real(9.5)]);
    }

    #[test]
    fn test_unconstrained_field_uses_json_extract() {
        let f = ConstrainedFields::new();
        let base = TableMeta { table: "items", fields: &f };
        let q = build_select(
            base,
            &opts(vec![Node::Filter(Filter::eq("meta.color", json!("red")))]),
            &EmptyCatalog,
        )
        .unwrap();
        assert!(q
            .sql
            .contains("WHERE json_extract(items.doc, '$.meta.color') = ?"));
    }

    #[test]
    fn test_booleans_parameterize_as_integers() {
        let f = ConstrainedFields::new();
        let base = TableMeta { table: "items", fields: &f };
        let q = build_select(
            base,
            &opts(vec![Node::Filter(Filter::eq("active", json!(true)))]),
            &EmptyCatalog,
        )
        .unwrap();
        assert_eq!(q.params, vec![SqlValue::Integer(1)]);
    }

    #[test]
    fn test_in_expands_placeholders_and_empty_is_false() {
        let f = ConstrainedFields::new();
        let base = TableMeta { table: "items", fields: &f };
        let q = build_select(
            base,
            &opts(vec![Node::Filter(Filter::new(
                "name",
                CompareOp::In,
                json!(["a", "b", "c"]),
            ))]),
            &EmptyCatalog,
        )
        .unwrap();
        assert!(q.sql.contains("IN (?, ?, ?)"));

        let q = build_select(
            base,
            &opts(vec![Node::Filter(Filter::new(
                "name",
                CompareOp::In,
                json!([]),
            ))]),
            &EmptyCatalog,
        )
        .unwrap();
        assert!(q.sql.ends_with("WHERE 1 = 0"));
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_contains_wraps_pattern() {
        let f = ConstrainedFields::new();
        let base = TableMeta { table: "items", fields: &f };
        let q = build_select(
            base,
            &opts(vec![Node::Filter(Filter::new(
                "name",
                CompareOp::Contains,
                json!("mid"),
            ))]),
            &EmptyCatalog,
        )
        .unwrap();
        assert_eq!(q.params, vec![SqlValue::Text("%mid%".to_string())]);
    }

    #[test]
    fn test_exists_toggles_null_check() {
        let f = ConstrainedFields::new();
        let base = TableMeta { table: "items", fields: &f };
        let q = build_select(
            base,
            &opts(vec![Node::Filter(Filter::new(
                "bio",
                CompareOp::Exists,
                json!(false),
            ))]),
            &EmptyCatalog,
        )
        .unwrap();
        assert!(q.sql.ends_with("IS NULL"));
    }

    #[test]
    fn test_join_chain_and_qualified_fields() {
        let base_fields = fields();
        let base = TableMeta { table: "items", fields: &base_fields };
        let mut catalog = BTreeMap::new();
        catalog.insert("orders".to_string(), ConstrainedFields::new());
        let options = QueryOptions {
            joins: vec![Join {
                kind: JoinKind::Left,
                collection: "orders".to_string(),
                left: "_id".to_string(),
                right: "item_id".to_string(),
            }],
            filters: vec![Node::Filter(Filter::gt("orders.total", json!(10)))],
            ..Default::default()
        };
        let q = build_select(base, &options, &catalog).unwrap();
        assert!(q.sql.contains(
            "LEFT JOIN orders ON items._id = json_extract(orders.doc, '$.item_id')"
        ));
        assert!(q.sql.contains("WHERE json_extract(orders.doc, '$.total') > ?"));
    }

    #[test]
    fn test_ambiguous_unprefixed_field_errors() {
        let mut base_fields = ConstrainedFields::new();
        base_fields.insert("total".to_string(), FieldDefinition::real());
        let base = TableMeta { table: "items", fields: &base_fields };
        let mut order_fields = ConstrainedFields::new();
        order_fields.insert("total".to_string(), FieldDefinition::real());
        let mut catalog = BTreeMap::new();
        catalog.insert("orders".to_string(), order_fields);
        let options = QueryOptions {
            joins: vec![Join {
                kind: JoinKind::Inner,
                collection: "orders".to_string(),
                left: "_id".to_string(),
                right: "item_id".to_string(),
            }],
            filters: vec![Node::Filter(Filter::gt("total", json!(10)))],
            ..Default::default()
        };
        assert!(build_select(base, &options, &catalog).is_err());
    }

    #[test]
    fn test_correlated_exists_subquery() {
        let f = ConstrainedFields::new();
        let base = TableMeta { table: "users", fields: &f };
        let mut catalog = BTreeMap::new();
        catalog.insert("orders".to_string(), ConstrainedFields::new());
        let options = QueryOptions {
            filters: vec![Node::Subquery(Subquery {
                field: "_id".to_string(),
                op: SubqueryOp::Exists,
                collection: "orders".to_string(),
                child_key: "user_id".to_string(),
                inner: QueryOptions::default(),
            })],
            ..Default::default()
        };
        let q = build_select(base, &options, &catalog).unwrap();
        assert!(q.sql.contains(
            "WHERE EXISTS (SELECT 1 FROM orders WHERE json_extract(orders.doc, '$.user_id') = users._id)"
        ));
    }

    #[test]
    fn test_membership_subquery_with_inner_filter() {
        let f = ConstrainedFields::new();
        let base = TableMeta { table: "users", fields: &f };
        let mut catalog = BTreeMap::new();
        catalog.insert("orders".to_string(), ConstrainedFields::new());
        let options = QueryOptions {
            filters: vec![Node::Subquery(Subquery {
                field: "_id".to_string(),
                op: SubqueryOp::In,
                collection: "orders".to_string(),
                child_key: "user_id".to_string(),
                inner: QueryOptions {
                    filters: vec![Node::Filter(Filter::gt("total", json!(100)))],
                    ..Default::default()
                },
            })],
            ..Default::default()
        };
        let q = build_select(base, &options, &catalog).unwrap();
        assert!(q.sql.contains(
            "users._id IN (SELECT json_extract(orders.doc, '$.user_id') FROM orders WHERE json_extract(orders.doc, '$.total') > ?)"
        ));
    }

    #[test]
    fn test_aggregates_with_group_by_and_having() {
        let f = fields();
        let base = TableMeta { table: "items", fields: &f };
        let options = QueryOptions {
            group_by: vec!["category".to_string()],
            aggregates: vec![Aggregate {
                func: AggregateFn::Count,
                field: "*".to_string(),
                alias: Some("n".to_string()),
                distinct: false,
            }],
            having: vec![Node::Filter(Filter::gt("n", json!(2)))],
            ..Default::default()
        };
        let q = build_select(base, &options, &EmptyCatalog).unwrap();
        assert!(q.sql.starts_with(
            "SELECT json_extract(items.doc, '$.category') AS \"category\", COUNT(*) AS n FROM items"
        ));
        assert!(q.sql.contains("GROUP BY json_extract(items.doc, '$.category')"));
        assert!(q.sql.contains("HAVING n > ?"));
    }

    #[test]
    fn test_distinct_aggregate() {
        let f = ConstrainedFields::new();
        let base = TableMeta { table: "items", fields: &f };
        let options = QueryOptions {
            aggregates: vec![Aggregate {
                func: AggregateFn::Count,
                field: "category".to_string(),
                alias: Some("kinds".to_string()),
                distinct: true,
            }],
            ..Default::default()
        };
        let q = build_select(base, &options, &EmptyCatalog).unwrap();
        assert!(q
            .sql
            .contains("COUNT(DISTINCT json_extract(items.doc, '$.category')) AS kinds"));
    }

    #[test]
    fn test_select_fields_aliased_by_path() {
        let f = fields();
        let base = TableMeta { table: "items", fields: &f };
        let options = QueryOptions {
            select_fields: vec!["price".to_string(), "meta.color".to_string()],
            ..Default::default()
        };
        let q = build_select(base, &options, &EmptyCatalog).unwrap();
        assert!(q.sql.starts_with(
            "SELECT items.price AS \"price\", json_extract(items.doc, '$.meta.color') AS \"meta.color\" FROM items"
        ));
    }

    #[test]
    fn test_order_limit_offset() {
        let f = fields();
        let base = TableMeta { table: "items", fields: &f };
        let options = QueryOptions {
            order_by: vec![OrderBy {
                field: "price".to_string(),
                dir: SortDir::Desc,
            }],
            limit: Some(10),
            offset: Some(20),
            ..Default::default()
        };
        let q = build_select(base, &options, &EmptyCatalog).unwrap();
        assert!(q.sql.ends_with("ORDER BY items.price DESC LIMIT ? OFFSET ?"));
        assert_eq!(
            q.params,
            vec![SqlValue::Integer(10), SqlValue::Integer(20)]
        );
    }

    #[test]
    fn test_offset_without_limit_gets_max_safe_limit() {
        let f = ConstrainedFields::new();
        let base = TableMeta { table: "items", fields: &f };
        let options = QueryOptions {
            offset: Some(5),
            ..Default::default()
        };
        let q = build_select(base, &options, &EmptyCatalog).unwrap();
        assert_eq!(
            q.params,
            vec![SqlValue::Integer(i64::MAX), SqlValue::Integer(5)]
        );
    }

    #[test]
    fn test_count_shape() {
        let f = fields();
        let base = TableMeta { table: "items", fields: &f };
        let q = build_count(
            base,
            &opts(vec![Node::Filter(Filter::gt("price", json!(1.0)))]),
            &EmptyCatalog,
        )
        .unwrap();
        assert_eq!(q.sql, "SELECT COUNT(*) FROM items WHERE items.price > ?");
    }

    #[test]
    fn test_translation_is_deterministic() {
        let f = fields();
        let base = TableMeta { table: "items", fields: &f };
        let options = QueryOptions {
            filters: vec![
                Node::Filter(Filter::gt("price", json!(1.0))),
                Node::Filter(Filter::like("name", "a%")),
            ],
            order_by: vec![OrderBy {
                field: "price".to_string(),
                dir: SortDir::Asc,
            }],
            limit: Some(3),
            ..Default::default()
        };
        let a = build_select(base, &options, &EmptyCatalog).unwrap();
        let b = build_select(base, &options, &EmptyCatalog).unwrap();
        assert_eq!(a.sql, b.sql);
    }
}
