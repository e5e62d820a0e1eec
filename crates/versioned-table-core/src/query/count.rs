//! Count queries.
//!
//! The total behind a page of results is computed by rewriting the
//! translated statement:
//!
//! - a simple aggregate (`SELECT COUNT(*) FROM ...`) always yields one row;
//! - `DISTINCT` counts the distinct projected expressions;
//! - `GROUP BY` counts the distinct grouping keys, with select aliases
//!   replaced by the expressions they name;
//! - anything else becomes `COUNT(*)`.
//!
//! Ordering and pagination are dropped from the count; the caller's `LIMIT`
//! and `OFFSET` are applied to the result with [`clamp_count`].

use crate::collaborators::{BoundSql, RowSet};
use crate::error::{EngineError, EngineResult};
use crate::query::ast::{Expr, QuerySpec, SelectItem};
use crate::query::translator::TranslatedQuery;

/// How to obtain the row count of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum CountPlan {
    /// The count is known without running anything.
    Constant(u64),
    /// Run this single-value query.
    Query(BoundSql),
}

/// Rewrite `translated` into a count.
pub fn count_plan(translated: &TranslatedQuery) -> CountPlan {
    let source = &translated.query;
    if source.is_simple_aggregate() {
        return CountPlan::Constant(1);
    }
    let projected: Vec<Expr> = translated
        .user_select()
        .iter()
        .filter_map(|item| match item {
            SelectItem::Expr { expr, .. } => Some(expr.clone()),
            SelectItem::Wildcard => None,
        })
        .collect();

    let count = if source.distinct {
        count_distinct(projected)
    } else if !source.group_by.is_empty() {
        let keys = source
            .group_by
            .iter()
            .map(|key| resolve_alias(key, translated.user_select()))
            .collect();
        count_distinct(keys)
    } else {
        Expr::CountStar
    };

    let mut query = QuerySpec::select(vec![SelectItem::expr(count)], source.from.name.clone());
    query.with = source.with.clone();
    query.joins = source.joins.clone();
    query.where_clause = source.where_clause.clone();
    CountPlan::Query(BoundSql {
        sql: query.to_string(),
        parameters: translated.binder.parameters().clone(),
    })
}

fn count_distinct(args: Vec<Expr>) -> Expr {
    Expr::Function {
        name: "COUNT".to_string(),
        args,
        distinct: true,
    }
}

/// The projected expression `key` names when it is a select alias.
fn resolve_alias(key: &Expr, select: &[SelectItem]) -> Expr {
    let Expr::Column(column) = key else {
        return key.clone();
    };
    select
        .iter()
        .find_map(|item| match item {
            SelectItem::Expr {
                expr,
                alias: Some(alias),
            } if *alias == column.name => Some(expr.clone()),
            _ => None,
        })
        .unwrap_or_else(|| key.clone())
}

/// Rows visible after skipping `offset` rows and taking at most `limit`.
pub fn clamp_count(count: u64, limit: Option<u64>, offset: Option<u64>) -> u64 {
    let visible = count.saturating_sub(offset.unwrap_or(0));
    match limit {
        Some(limit) => visible.min(limit),
        None => visible,
    }
}

/// Read the single value of a count result.
pub fn count_from_rows(rows: &RowSet) -> EngineResult<u64> {
    let cell = rows
        .rows
        .first()
        .and_then(|row| row.first())
        .cloned()
        .flatten();
    match cell {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| EngineError::invalid_argument(format!("Count query returned a non-numeric value: {value}"))),
    }
}
