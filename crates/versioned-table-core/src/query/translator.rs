//! Compiling dialect queries into backing SQL.
//!
//! [`translate`] rewrites a [`QuerySpec`] against the tables resolved for
//! it:
//!
//! - `syn<id>` becomes the physical index table (`T<id>`, `T<id>_<version>`)
//!   and column names become `_C<id>_`. Bookkeeping columns (`ROW_ID`,
//!   `ROW_VERSION`, ...) pass through, and select aliases may be used in
//!   `GROUP BY`, `HAVING` and `ORDER BY`.
//! - Every literal except `NULL` becomes a named parameter (`:b0`, `:b1`,
//!   ...) numbered in order of appearance and typed from the column it is
//!   compared with.
//! - A virtual table becomes a chain of CTEs, innermost first. Each CTE
//!   projects only the columns its consumer reads.
//! - The table holding the rows contributes its benefactor filters.
//! - Row queries against tables with an index also select `ROW_ID` and
//!   `ROW_VERSION` so each result row can be identified.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collaborators::BoundSql;
use crate::error::{EngineError, EngineResult};
use crate::model::{ColumnModel, ColumnType, IdAndVersion, IndexShapeDescription, column::parse_long};
use crate::query::ast::{
    BinaryOp, ColumnRef, CommonTableExpression, Expr, Literal, OrderByItem, QuerySpec, SelectItem,
};
use crate::query::security::conjoin;
use crate::query::shape::{ResolvedTables, defining_table};
use crate::schema::validation::is_reserved_column_name;

/// Row id bookkeeping column.
pub const ROW_ID: &str = "ROW_ID";
/// Row version bookkeeping column.
pub const ROW_VERSION: &str = "ROW_VERSION";

/// Hands out `:b0`, `:b1`, ... and remembers their values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBinder {
    parameters: BTreeMap<String, Value>,
    next: usize,
}

impl ParameterBinder {
    /// A binder whose first parameter is `b0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` to the next parameter name and return the reference.
    pub fn bind(&mut self, value: Value) -> Expr {
        let name = format!("b{}", self.next);
        self.next += 1;
        self.parameters.insert(name.clone(), value);
        Expr::param(name)
    }

    /// Values bound so far, keyed by name.
    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }
}

/// A column of the query result as the caller sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectColumn {
    /// Alias, or the expression as written.
    pub name: String,
    /// Logical type, when it can be inferred.
    pub column_type: Option<ColumnType>,
    /// Column model id for direct column references.
    pub column_id: Option<u64>,
}

/// Output of [`translate`].
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedQuery {
    /// Queried table.
    pub table: IdAndVersion,
    /// The statement in physical names, with its CTE chain.
    pub query: QuerySpec,
    /// Parameters bound while translating; keeps numbering for additions.
    pub binder: ParameterBinder,
    /// Result columns, excluding row bookkeeping.
    pub select_columns: Vec<SelectColumn>,
    /// True when `ROW_ID` and `ROW_VERSION` were appended to the projection.
    pub includes_row_metadata: bool,
    /// True for aggregating, grouping or `DISTINCT` statements.
    pub is_aggregate: bool,
}

impl TranslatedQuery {
    /// SQL text and parameters for the driver.
    pub fn to_bound_sql(&self) -> BoundSql {
        BoundSql {
            sql: self.query.to_string(),
            parameters: self.binder.parameters().clone(),
        }
    }

    /// Projection without the appended row bookkeeping columns.
    pub fn user_select(&self) -> &[SelectItem] {
        let appended = if self.includes_row_metadata { 2 } else { 0 };
        &self.query.select[..self.query.select.len().saturating_sub(appended)]
    }
}

/// Translate `query` against `tables`.
pub fn translate(query: &QuerySpec, tables: &ResolvedTables) -> EngineResult<TranslatedQuery> {
    let table: IdAndVersion = defining_table(query)?;
    let mut translator = Translator {
        tables,
        binder: ParameterBinder::new(),
        ctes: Vec::new(),
        expanding: BTreeSet::new(),
    };
    let level = translator.translate_select(query.clone(), true)?;
    let mut physical = level.query;
    physical.with = translator.ctes;
    Ok(TranslatedQuery {
        table,
        query: physical,
        binder: translator.binder,
        select_columns: level.select_columns,
        includes_row_metadata: level.includes_row_metadata,
        is_aggregate: level.is_aggregate,
    })
}

/// True for aggregating, grouping or `DISTINCT` statements.
pub fn is_aggregate_query(query: &QuerySpec) -> bool {
    query.distinct
        || !query.group_by.is_empty()
        || query.select.iter().any(|item| match item {
            SelectItem::Wildcard => false,
            SelectItem::Expr { expr, .. } => expr.is_aggregate(),
        })
}

/// Replace `*` with the columns of `schema`, by name.
pub fn expand_wildcard(query: &mut QuerySpec, schema: &[ColumnModel]) {
    if !query.has_wildcard() {
        return;
    }
    query.select = std::mem::take(&mut query.select)
        .into_iter()
        .flat_map(|item| match item {
            SelectItem::Wildcard => schema
                .iter()
                .map(|c| SelectItem::expr(Expr::column(c.name())))
                .collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect();
}

struct TranslatedLevel {
    query: QuerySpec,
    select_columns: Vec<SelectColumn>,
    includes_row_metadata: bool,
    is_aggregate: bool,
}

struct Translator<'a> {
    tables: &'a ResolvedTables,
    binder: ParameterBinder,
    ctes: Vec<CommonTableExpression>,
    expanding: BTreeSet<IdAndVersion>,
}

/// Name resolution for one level of the statement.
struct ColumnScope<'a> {
    schema: &'a [ColumnModel],
    aliases: BTreeSet<String>,
}

impl<'a> ColumnScope<'a> {
    fn new(schema: &'a [ColumnModel], query: &QuerySpec) -> Self {
        Self {
            schema,
            aliases: select_aliases(query),
        }
    }

    fn find(&self, name: &str) -> Option<&'a ColumnModel> {
        self.schema.iter().find(|c| c.name() == name)
    }

    fn physical(&self, column: &ColumnRef, allow_aliases: bool) -> EngineResult<String> {
        if let Some(model) = self.find(&column.name) {
            return Ok(model.physical_name());
        }
        if is_reserved_column_name(&column.name) {
            return Ok(column.name.trim().to_ascii_uppercase());
        }
        if allow_aliases && self.aliases.contains(&column.name) {
            return Ok(column.name.clone());
        }
        Err(EngineError::invalid_argument(format!(
            "Column does not exist: {}",
            column.name
        )))
    }

    fn column_type(&self, expr: &Expr) -> Option<ColumnType> {
        match expr {
            Expr::Column(c) => self.find(&c.name).map(ColumnModel::column_type),
            Expr::Nested(inner) => self.column_type(inner),
            _ => None,
        }
    }

    fn referenced_column_ids(&self, query: &QuerySpec) -> BTreeSet<u64> {
        let mut ids = BTreeSet::new();
        query.visit_columns(&mut |c| {
            if let Some(model) = self.find(&c.name) {
                ids.insert(model.id);
            }
        });
        ids
    }

    fn describe(&self, item: &SelectItem) -> Option<SelectColumn> {
        let SelectItem::Expr { expr, alias } = item else {
            return None;
        };
        let (column_type, column_id) = match expr {
            Expr::Column(c) => match self.find(&c.name) {
                Some(model) => (Some(model.column_type()), Some(model.id)),
                None => (None, None),
            },
            Expr::CountStar => (Some(ColumnType::Integer), None),
            Expr::Function { name, args, .. } => match name.as_str() {
                "COUNT" => (Some(ColumnType::Integer), None),
                "MIN" | "MAX" => (args.first().and_then(|a| self.column_type(a)), None),
                _ => (None, None),
            },
            _ => (None, None),
        };
        Some(SelectColumn {
            name: alias.clone().unwrap_or_else(|| expr.to_string()),
            column_type,
            column_id,
        })
    }
}

fn select_aliases(query: &QuerySpec) -> BTreeSet<String> {
    query
        .select
        .iter()
        .filter_map(|item| match item {
            SelectItem::Expr { alias: Some(alias), .. } => Some(alias.clone()),
            _ => None,
        })
        .collect()
}

/// Aliases referenced by grouping, filtering on groups or ordering.
fn aliases_used_after_projection(query: &QuerySpec) -> BTreeSet<String> {
    let aliases = select_aliases(query);
    let mut used = BTreeSet::new();
    let mut note = |c: &ColumnRef| {
        if aliases.contains(&c.name) {
            used.insert(c.name.clone());
        }
    };
    query.group_by.iter().for_each(|e| e.visit_columns(&mut note));
    if let Some(having) = &query.having {
        having.visit_columns(&mut note);
    }
    query.order_by.iter().for_each(|o| o.expr.visit_columns(&mut note));
    used
}

fn is_comparison(op: BinaryOp) -> bool {
    matches!(
        op,
        BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq
            | BinaryOp::Like
            | BinaryOp::NotLike
    )
}

fn is_integral(column_type: ColumnType) -> bool {
    matches!(
        column_type,
        ColumnType::Integer
            | ColumnType::Date
            | ColumnType::FileHandleId
            | ColumnType::EntityId
            | ColumnType::SubmissionId
            | ColumnType::EvaluationId
            | ColumnType::UserId
    ) || column_type.element_type().is_some_and(is_integral)
}

fn number_value(text: &str) -> Option<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

/// Parameter value of `literal`, converted to the type of the column it is
/// compared with when the text allows it.
fn typed_value(literal: &Literal, hint: Option<ColumnType>) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Boolean(b) => Value::Bool(*b),
        Literal::Number(n) => number_value(n).unwrap_or_else(|| Value::String(n.clone())),
        Literal::String(s) => {
            let converted = match hint {
                Some(t) if is_integral(t) => parse_long(s).map(Value::from),
                Some(ColumnType::Double) => number_value(s),
                Some(ColumnType::Boolean) => match s.to_ascii_lowercase().as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            };
            converted.unwrap_or_else(|| Value::String(s.clone()))
        }
    }
}

impl Translator<'_> {
    fn translate_select(&mut self, mut query: QuerySpec, outer: bool) -> EngineResult<TranslatedLevel> {
        if !query.with.is_empty() {
            return Err(EngineError::invalid_argument("WITH is not supported in queries"));
        }
        if !query.joins.is_empty() {
            return Err(EngineError::invalid_argument("JOIN is not supported in queries"));
        }
        let tables = self.tables;
        let table: IdAndVersion = defining_table(&query)?;
        let resolved = tables.get(&table)?;
        expand_wildcard(&mut query, &resolved.schema);
        if query.select.is_empty() {
            return Err(EngineError::invalid_argument(format!(
                "{table} has no columns to select"
            )));
        }

        let scope = ColumnScope::new(&resolved.schema, &query);
        let select_columns: Vec<SelectColumn> = query.select.iter().filter_map(|i| scope.describe(i)).collect();
        if let IndexShapeDescription::VirtualTable { defining_sql, .. } = &resolved.shape {
            let needed = scope.referenced_column_ids(&query);
            self.push_virtual_table(table, defining_sql, &resolved.schema, &needed)?;
        }
        let is_aggregate = is_aggregate_query(&query);

        let mut physical = QuerySpec::select(Vec::with_capacity(query.select.len()), table.index_table_name());
        physical.distinct = query.distinct;
        physical.limit = query.limit;
        physical.offset = query.offset;
        for item in query.select {
            let SelectItem::Expr { expr, alias } = item else {
                continue;
            };
            let expr = self.translate_expr(expr, &scope, false, None)?;
            physical.select.push(SelectItem::Expr { expr, alias });
        }

        let user_where = match query.where_clause {
            Some(condition) => Some(self.translate_expr(condition, &scope, false, None)?),
            None => None,
        };
        let filters: Vec<Expr> = resolved
            .benefactor_filters
            .iter()
            .map(|f| f.to_condition(&mut self.binder))
            .collect();
        physical.where_clause = conjoin_if_any(user_where, filters);

        for key in query.group_by {
            let key = self.translate_expr(key, &scope, true, None)?;
            physical.group_by.push(key);
        }
        if let Some(having) = query.having {
            physical.having = Some(self.translate_expr(having, &scope, true, None)?);
        }
        for order in query.order_by {
            physical.order_by.push(OrderByItem {
                expr: self.translate_expr(order.expr, &scope, true, None)?,
                ascending: order.ascending,
            });
        }

        let includes_row_metadata = outer && resolved.shape.has_physical_index() && !is_aggregate;
        if includes_row_metadata {
            physical.select.push(SelectItem::expr(Expr::column(ROW_ID)));
            physical.select.push(SelectItem::expr(Expr::column(ROW_VERSION)));
        }
        Ok(TranslatedLevel {
            query: physical,
            select_columns,
            includes_row_metadata,
            is_aggregate,
        })
    }

    /// Emit the CTE for virtual table `table`, keeping only the projected
    /// columns whose ids are in `needed`.
    fn push_virtual_table(
        &mut self,
        table: IdAndVersion,
        defining: &QuerySpec,
        schema: &[ColumnModel],
        needed: &BTreeSet<u64>,
    ) -> EngineResult<()> {
        if !self.expanding.insert(table) {
            return Err(EngineError::invalid_argument(format!(
                "The definition of {table} is cyclic: {table} is reached more than once"
            )));
        }
        let tables = self.tables;
        let source = tables.get(&defining_table(defining)?)?;
        let mut inner = defining.clone();
        expand_wildcard(&mut inner, &source.schema);
        if schema.is_empty() || inner.select.len() != schema.len() {
            return Err(EngineError::invalid_argument(format!(
                "The defining query of {table} selects {} columns but the table has {} columns",
                inner.select.len(),
                schema.len()
            )));
        }

        let used_aliases = aliases_used_after_projection(&inner);
        let items = std::mem::take(&mut inner.select);
        let mut columns = Vec::new();
        for (item, column) in items.iter().zip(schema) {
            let alias_used = matches!(item, SelectItem::Expr { alias: Some(a), .. } if used_aliases.contains(a));
            if needed.contains(&column.id) || alias_used {
                columns.push(column.physical_name());
                inner.select.push(item.clone());
            }
        }
        if inner.select.is_empty() {
            columns.push(schema[0].physical_name());
            inner.select.push(items[0].clone());
        }

        let level = self.translate_select(inner, false)?;
        self.ctes.push(CommonTableExpression {
            name: table.index_table_name(),
            columns,
            query: Box::new(level.query),
        });
        self.expanding.remove(&table);
        Ok(())
    }

    fn translate_expr(
        &mut self,
        expr: Expr,
        scope: &ColumnScope<'_>,
        allow_aliases: bool,
        hint: Option<ColumnType>,
    ) -> EngineResult<Expr> {
        Ok(match expr {
            Expr::Column(column) => Expr::Column(ColumnRef {
                table: None,
                name: scope.physical(&column, allow_aliases)?,
            }),
            Expr::Literal(Literal::Null) => Expr::Literal(Literal::Null),
            Expr::Literal(literal) => self.binder.bind(typed_value(&literal, hint)),
            Expr::Parameter(name) => {
                return Err(EngineError::invalid_argument(format!(
                    "Unexpected bind parameter :{name} in query"
                )));
            }
            Expr::Binary { left, op, right } => {
                let hint = if is_comparison(op) {
                    scope.column_type(&left).or_else(|| scope.column_type(&right))
                } else {
                    None
                };
                let left = self.translate_expr(*left, scope, allow_aliases, hint)?;
                let right = self.translate_expr(*right, scope, allow_aliases, hint)?;
                left.binary(op, right)
            }
            Expr::Not(inner) => Expr::Not(Box::new(self.translate_expr(*inner, scope, allow_aliases, None)?)),
            Expr::Nested(inner) => Expr::Nested(Box::new(self.translate_expr(*inner, scope, allow_aliases, hint)?)),
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(self.translate_expr(*expr, scope, allow_aliases, None)?),
                negated,
            },
            Expr::InList { expr, list, negated } => {
                let hint = scope.column_type(&expr);
                let expr = Box::new(self.translate_expr(*expr, scope, allow_aliases, None)?);
                let list = list
                    .into_iter()
                    .map(|e| self.translate_expr(e, scope, allow_aliases, hint))
                    .collect::<EngineResult<_>>()?;
                Expr::InList { expr, list, negated }
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let hint = scope.column_type(&expr);
                Expr::Between {
                    expr: Box::new(self.translate_expr(*expr, scope, allow_aliases, None)?),
                    low: Box::new(self.translate_expr(*low, scope, allow_aliases, hint)?),
                    high: Box::new(self.translate_expr(*high, scope, allow_aliases, hint)?),
                    negated,
                }
            }
            Expr::Function { name, args, distinct } => Expr::Function {
                name,
                args: args
                    .into_iter()
                    .map(|e| self.translate_expr(e, scope, allow_aliases, None))
                    .collect::<EngineResult<_>>()?,
                distinct,
            },
            Expr::CountStar => Expr::CountStar,
        })
    }
}

fn conjoin_if_any(where_clause: Option<Expr>, filters: Vec<Expr>) -> Option<Expr> {
    if filters.is_empty() {
        where_clause
    } else {
        conjoin(where_clause, filters)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::super::test_util::*;
    use super::*;
    use crate::model::ColumnDefinition;
    use crate::query::security::BenefactorFilter;
    use crate::query::shape::ResolvedTable;

    fn syn2_over_syn1() -> ResolvedTables {
        ResolvedTables::new(
            IdAndVersion::current(2),
            vec![
                plain_table(1, i_schema()),
                virtual_table(
                    2,
                    QuerySpec::select_columns(&["i0", "i2"], "syn1"),
                    vec![column(0, "i0"), column(2, "i2")],
                ),
            ],
        )
        .expect("valid chain")
    }

    // ==================== Plain table tests ====================

    #[test]
    fn renames_tables_columns_and_binds_literals() -> TestResult {
        let tables = ResolvedTables::new(IdAndVersion::current(1), vec![plain_table(1, i_schema())])?;
        let query = QuerySpec::select_columns(&["i0", "i2"], "syn1").with_where(
            Expr::column("i0")
                .gt(Expr::number(100))
                .and(Expr::column("i1").eq(Expr::string("7"))),
        );

        let translated = translate(&query, &tables)?;
        let sql = translated.to_bound_sql();

        assert_eq!(
            sql.sql,
            "SELECT _C0_, _C2_, ROW_ID, ROW_VERSION FROM T1 WHERE _C0_ > :b0 AND _C1_ = :b1"
        );
        assert_eq!(sql.parameters["b0"], json!(100));
        assert_eq!(sql.parameters["b1"], json!(7));
        assert!(translated.includes_row_metadata);
        assert_eq!(translated.user_select().len(), 2);
        Ok(())
    }

    #[test]
    fn snapshots_read_their_versioned_index() -> TestResult {
        let snapshot = IdAndVersion::versioned(1, 3);
        let tables = ResolvedTables::new(
            snapshot,
            vec![ResolvedTable::new(
                snapshot,
                crate::model::IndexShapeDescription::PlainTable { table: snapshot },
                i_schema(),
            )],
        )?;
        let translated = translate(&QuerySpec::select_columns(&["i1"], "syn1.3"), &tables)?;
        assert_eq!(
            translated.to_bound_sql().sql,
            "SELECT _C1_, ROW_ID, ROW_VERSION FROM T1_3"
        );
        Ok(())
    }

    #[test]
    fn entity_ids_drop_their_prefix() -> TestResult {
        let schema = vec![ColumnModel::new(
            4,
            ColumnDefinition::new("parent", ColumnType::EntityId),
        )];
        let tables = ResolvedTables::new(IdAndVersion::current(1), vec![plain_table(1, schema)])?;
        let query = QuerySpec::select_star("syn1").with_where(Expr::InList {
            expr: Box::new(Expr::column("parent")),
            list: vec![Expr::string("syn12"), Expr::string("syn13")],
            negated: false,
        });

        let sql = translate(&query, &tables)?.to_bound_sql();

        assert_eq!(
            sql.sql,
            "SELECT _C4_, ROW_ID, ROW_VERSION FROM T1 WHERE _C4_ IN (:b0, :b1)"
        );
        assert_eq!(sql.parameters["b0"], json!(12));
        assert_eq!(sql.parameters["b1"], json!(13));
        Ok(())
    }

    #[test]
    fn aliases_are_usable_in_order_by() -> TestResult {
        let tables = ResolvedTables::new(IdAndVersion::current(1), vec![plain_table(1, i_schema())])?;
        let query = QuerySpec::select(vec![SelectItem::aliased(Expr::column("i0"), "x")], "syn1")
            .with_order_by(Expr::column("x"), false);

        let translated = translate(&query, &tables)?;

        assert_eq!(
            translated.to_bound_sql().sql,
            "SELECT _C0_ AS x, ROW_ID, ROW_VERSION FROM T1 ORDER BY x DESC"
        );
        assert_eq!(translated.select_columns[0].name, "x");
        assert_eq!(translated.select_columns[0].column_id, Some(0));
        Ok(())
    }

    #[test]
    fn aggregates_skip_row_metadata() -> TestResult {
        let tables = ResolvedTables::new(IdAndVersion::current(1), vec![plain_table(1, i_schema())])?;
        let query = QuerySpec::select(vec![SelectItem::expr(Expr::CountStar)], "syn1");

        let translated = translate(&query, &tables)?;

        assert_eq!(translated.to_bound_sql().sql, "SELECT COUNT(*) FROM T1");
        assert!(translated.is_aggregate);
        assert_eq!(translated.select_columns[0].column_type, Some(ColumnType::Integer));
        Ok(())
    }

    #[test]
    fn unknown_columns_are_rejected() -> TestResult {
        let tables = ResolvedTables::new(IdAndVersion::current(1), vec![plain_table(1, i_schema())])?;
        let err = translate(&QuerySpec::select_columns(&["nope"], "syn1"), &tables).expect_err("unknown");
        assert_eq!(err.to_string(), "Column does not exist: nope");
        Ok(())
    }

    // ==================== Virtual table tests ====================

    #[test]
    fn virtual_table_compiles_to_one_cte() -> TestResult {
        let query = QuerySpec::select_star("syn2")
            .with_where(Expr::column("i0").gt(Expr::number(100)))
            .with_order_by(Expr::column("i2"), true);

        let translated = translate(&query, &syn2_over_syn1())?;
        let sql = translated.to_bound_sql();

        assert_eq!(
            sql.sql,
            "WITH T2 (_C0_, _C2_) AS (SELECT _C0_, _C2_ FROM T1) \
             SELECT _C0_, _C2_ FROM T2 WHERE _C0_ > :b0 ORDER BY _C2_"
        );
        assert_eq!(sql.parameters["b0"], json!(100));
        assert!(!translated.includes_row_metadata);
        Ok(())
    }

    #[test]
    fn unread_columns_are_not_projected() -> TestResult {
        let translated = translate(&QuerySpec::select_columns(&["i2"], "syn2"), &syn2_over_syn1())?;
        assert_eq!(
            translated.to_bound_sql().sql,
            "WITH T2 (_C2_) AS (SELECT _C2_ FROM T1) SELECT _C2_ FROM T2"
        );
        Ok(())
    }

    #[test]
    fn nested_virtual_tables_chain_innermost_first() -> TestResult {
        let tables = ResolvedTables::new(
            IdAndVersion::current(3),
            vec![
                plain_table(1, i_schema()),
                virtual_table(
                    2,
                    QuerySpec::select_columns(&["i0", "i2"], "syn1"),
                    vec![column(0, "i0"), column(2, "i2")],
                ),
                virtual_table(
                    3,
                    QuerySpec::select_columns(&["i2"], "syn2").with_where(Expr::column("i0").gt(Expr::number(5))),
                    vec![column(2, "i2")],
                ),
            ],
        )?;

        let sql = translate(&QuerySpec::select_star("syn3"), &tables)?.to_bound_sql();

        assert_eq!(
            sql.sql,
            "WITH T2 (_C0_, _C2_) AS (SELECT _C0_, _C2_ FROM T1), \
             T3 (_C2_) AS (SELECT _C2_ FROM T2 WHERE _C0_ > :b0) \
             SELECT _C2_ FROM T3"
        );
        assert_eq!(sql.parameters["b0"], json!(5));
        Ok(())
    }

    #[test]
    fn definition_width_must_match_schema() -> TestResult {
        let tables = ResolvedTables::new(
            IdAndVersion::current(2),
            vec![
                plain_table(1, i_schema()),
                virtual_table(2, QuerySpec::select_star("syn1"), vec![column(0, "i0")]),
            ],
        )?;
        let err = translate(&QuerySpec::select_star("syn2"), &tables).expect_err("width mismatch");
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
        Ok(())
    }

    // ==================== Security tests ====================

    #[test]
    fn view_filter_wraps_the_user_condition() -> TestResult {
        let view = IdAndVersion::current(5);
        let mut resolved = ResolvedTable::new(
            view,
            crate::model::IndexShapeDescription::View {
                view,
                scope: crate::model::ViewScope {
                    object_type: crate::model::ViewObjectType::Entity,
                    container_ids: BTreeSet::from([1]),
                    type_mask: crate::model::ViewTypeMask::FILE,
                },
            },
            i_schema(),
        );
        resolved.benefactor_filters.push(BenefactorFilter {
            column: "ROW_BENEFACTOR".to_string(),
            allowed: BTreeSet::from([20]),
        });
        let tables = ResolvedTables::new(view, vec![resolved])?;
        let query = QuerySpec::select_columns(&["i0"], "syn5").with_where(
            Expr::column("i0")
                .eq(Expr::number(1))
                .or(Expr::column("i1").eq(Expr::number(2))),
        );

        let sql = translate(&query, &tables)?.to_bound_sql();

        assert_eq!(
            sql.sql,
            "SELECT _C0_, ROW_ID, ROW_VERSION FROM T5 \
             WHERE (_C0_ = :b0 OR _C1_ = :b1) AND ROW_BENEFACTOR IN (:b2, -1)"
        );
        assert_eq!(sql.parameters["b2"], json!(20));
        Ok(())
    }
}
