//! Faceted aggregation.
//!
//! Every column that declares a facet (and every faceted JSON sub-column)
//! contributes one query alongside the main query:
//!
//! - **Range** facets compute `MIN(col) AS minimum, MAX(col) AS maximum`.
//! - **Enumeration** facets count distinct values:
//!   `col AS value, COUNT(*) AS frequency ... GROUP BY col ORDER BY frequency DESC, value`
//!   capped at the configured number of values.
//!
//! A facet query keeps the user's `WHERE` and the filters of every *other*
//! selected facet, never its own, so a caller can see what a selection on
//! one facet leaves available on the others. JSON sub-columns are read
//! through `JSON_UNQUOTE(JSON_EXTRACT(col, :path))`; list columns are
//! joined to their unnest table and grouped on the unnested element.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collaborators::{BoundSql, RowSet};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    ColumnModel, FacetType, IdAndVersion,
    column::{row_id_ref_column_name, unnest_column_name},
};
use crate::query::ast::{BinaryOp, Expr, Join, JoinKind, OrderByItem, QuerySpec, SelectItem, TableRef};
use crate::query::shape::ResolvedTables;
use crate::query::translator::{ROW_ID, translate};

/// Selection value standing for SQL `NULL`.
pub const NULL_VALUE_KEYWORD: &str = "__UNDEFINED_NULL_NOTSET__";

const MIN_ALIAS: &str = "minimum";
const MAX_ALIAS: &str = "maximum";
const VALUE_ALIAS: &str = "value";
const COUNT_ALIAS: &str = "frequency";

/// What the caller selected on one facet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "concreteType")]
pub enum FacetSelection {
    /// Bounds on a range facet; either side may be open.
    Range {
        /// Inclusive lower bound.
        min: Option<String>,
        /// Inclusive upper bound.
        max: Option<String>,
    },
    /// Accepted values of an enumeration facet.
    Values {
        /// Values; [`NULL_VALUE_KEYWORD`] selects `NULL`.
        values: BTreeSet<String>,
    },
}

/// A selection on one facet column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetColumnRequest {
    /// Name of the faceted column.
    pub column_name: String,
    /// JSON path, when the facet is declared on a JSON sub-column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    /// The selection.
    pub selection: FacetSelection,
}

impl FacetColumnRequest {
    /// A range selection on `column_name`.
    pub fn range(column_name: impl Into<String>, min: Option<&str>, max: Option<&str>) -> Self {
        Self {
            column_name: column_name.into(),
            json_path: None,
            selection: FacetSelection::Range {
                min: min.map(str::to_string),
                max: max.map(str::to_string),
            },
        }
    }

    /// A value selection on `column_name`.
    pub fn values<'a>(column_name: impl Into<String>, values: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            column_name: column_name.into(),
            json_path: None,
            selection: FacetSelection::Values {
                values: values.into_iter().map(str::to_string).collect(),
            },
        }
    }

    /// Scope the selection to a JSON sub-column.
    pub fn at_json_path(mut self, json_path: impl Into<String>) -> Self {
        self.json_path = Some(json_path.into());
        self
    }
}

/// One distinct value and how often it occurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetValueCount {
    /// The value, or [`NULL_VALUE_KEYWORD`].
    pub value: String,
    /// Number of matching rows.
    pub count: u64,
    /// True when the caller selected this value.
    pub is_selected: bool,
}

/// Aggregates of one facet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "facetType")]
pub enum FacetColumnResult {
    /// Result of a range facet.
    Range {
        /// Faceted column.
        column_name: String,
        /// JSON path of a sub-column facet.
        json_path: Option<String>,
        /// Smallest value, `None` when no row matched.
        column_min: Option<String>,
        /// Largest value, `None` when no row matched.
        column_max: Option<String>,
        /// Lower bound the caller selected.
        selected_min: Option<String>,
        /// Upper bound the caller selected.
        selected_max: Option<String>,
    },
    /// Result of an enumeration facet.
    Enumeration {
        /// Faceted column.
        column_name: String,
        /// JSON path of a sub-column facet.
        json_path: Option<String>,
        /// Values by descending frequency.
        facet_values: Vec<FacetValueCount>,
    },
}

/// A facet a table exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetColumn {
    /// The column holding the data; a JSON column for sub-column facets.
    pub column: ColumnModel,
    /// JSON path of a sub-column facet.
    pub json_path: Option<String>,
    /// Declared facet.
    pub facet_type: FacetType,
}

impl FacetColumn {
    fn matches(&self, request: &FacetColumnRequest) -> bool {
        self.column.name() == request.column_name && self.json_path == request.json_path
    }

    /// Logical expression read by the facet.
    fn logical_expr(&self) -> Expr {
        let column = Expr::column(self.column.name());
        match &self.json_path {
            Some(path) => json_extract(column, Expr::string(path.as_str())),
            None => column,
        }
    }

    /// Filter for `selection`, or `None` when it does not restrict anything.
    fn filter(&self, selection: &FacetSelection) -> Option<Expr> {
        let target = self.logical_expr();
        match selection {
            FacetSelection::Range { min, max } => {
                if min.as_deref() == Some(NULL_VALUE_KEYWORD) || max.as_deref() == Some(NULL_VALUE_KEYWORD) {
                    return Some(is_null(target));
                }
                match (min, max) {
                    (Some(min), Some(max)) => Some(Expr::Between {
                        expr: Box::new(target),
                        low: Box::new(Expr::string(min.as_str())),
                        high: Box::new(Expr::string(max.as_str())),
                        negated: false,
                    }),
                    (Some(min), None) => Some(target.binary(BinaryOp::GtEq, Expr::string(min.as_str()))),
                    (None, Some(max)) => Some(target.binary(BinaryOp::LtEq, Expr::string(max.as_str()))),
                    (None, None) => None,
                }
            }
            FacetSelection::Values { values } if self.column.column_type().is_list() => {
                let (nulls, present): (Vec<&String>, Vec<&String>) =
                    values.iter().partition(|v| v.as_str() == NULL_VALUE_KEYWORD);
                let mut terms = Vec::new();
                if !present.is_empty() {
                    let array = Value::from(present.into_iter().cloned().collect::<Vec<_>>()).to_string();
                    terms.push(Expr::function("JSON_OVERLAPS", vec![target.clone(), Expr::string(array)]));
                }
                if !nulls.is_empty() {
                    terms.push(is_null(target));
                }
                any_of(terms)
            }
            FacetSelection::Values { values } => any_of(
                values
                    .iter()
                    .map(|value| {
                        if value == NULL_VALUE_KEYWORD {
                            is_null(target.clone())
                        } else {
                            target.clone().eq(Expr::string(value.as_str()))
                        }
                    })
                    .collect(),
            ),
        }
    }
}

fn json_extract(column: Expr, path: Expr) -> Expr {
    Expr::function("JSON_UNQUOTE", vec![Expr::function("JSON_EXTRACT", vec![column, path])])
}

fn is_null(expr: Expr) -> Expr {
    Expr::IsNull {
        expr: Box::new(expr),
        negated: false,
    }
}

fn any_of(terms: Vec<Expr>) -> Option<Expr> {
    terms.into_iter().reduce(Expr::or)
}

/// Facets declared by `schema`, in schema order.
pub fn facet_columns(schema: &[ColumnModel]) -> Vec<FacetColumn> {
    let mut facets = Vec::new();
    for column in schema {
        if let Some(facet_type) = column.facet_type() {
            facets.push(FacetColumn {
                column: column.clone(),
                json_path: None,
                facet_type,
            });
        }
        for sub in &column.definition.json_sub_columns {
            if let Some(facet_type) = sub.facet_type {
                facets.push(FacetColumn {
                    column: column.clone(),
                    json_path: Some(sub.json_path.clone()),
                    facet_type,
                });
            }
        }
    }
    facets
}

/// The facets of a query together with the caller's selections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetPlan {
    facets: Vec<FacetColumn>,
    selections: Vec<FacetColumnRequest>,
}

impl FacetPlan {
    /// Validate `selections` against the facets of `schema`.
    ///
    /// Fails with `InvalidArgument` when a selection names a column without
    /// a facet, or selects a range on an enumeration facet (or the reverse).
    pub fn new(schema: &[ColumnModel], selections: &[FacetColumnRequest]) -> EngineResult<Self> {
        let facets = facet_columns(schema);
        for selection in selections {
            let facet = facets.iter().find(|f| f.matches(selection)).ok_or_else(|| {
                EngineError::invalid_argument(format!(
                    "Facet selection on column '{}' but that column is not faceted",
                    display_name(&selection.column_name, selection.json_path.as_deref())
                ))
            })?;
            let compatible = matches!(
                (&selection.selection, facet.facet_type),
                (FacetSelection::Range { .. }, FacetType::Range) | (FacetSelection::Values { .. }, FacetType::Enumeration)
            );
            if !compatible {
                return Err(EngineError::invalid_argument(format!(
                    "Column '{}' has a {} facet; the selection does not match it",
                    display_name(&selection.column_name, selection.json_path.as_deref()),
                    facet.facet_type
                )));
            }
        }
        Ok(Self {
            facets,
            selections: selections.to_vec(),
        })
    }

    /// Facets of the table.
    pub fn facets(&self) -> &[FacetColumn] {
        &self.facets
    }

    /// `query` restricted by every selected facet.
    pub fn filter_query(&self, query: &QuerySpec) -> QuerySpec {
        self.filtered(query, None)
    }

    /// `query` restricted by every selected facet except `excluded`.
    fn filtered(&self, query: &QuerySpec, excluded: Option<&FacetColumn>) -> QuerySpec {
        let filters: Vec<Expr> = self
            .selections
            .iter()
            .filter(|s| excluded.is_none_or(|e| !e.matches(s)))
            .filter_map(|s| {
                let facet = self.facets.iter().find(|f| f.matches(s))?;
                facet.filter(&s.selection)
            })
            .map(Expr::nested)
            .collect();
        let mut filtered = query.clone();
        if let Some(combined) = filters.into_iter().reduce(Expr::and) {
            let combined = combined.nested();
            filtered.where_clause = Some(match filtered.where_clause.take() {
                Some(user) => user.nested().and(combined),
                None => combined,
            });
        }
        filtered
    }

    /// One aggregation query per facet.
    ///
    /// `query` is the caller's query before facet filtering; only its
    /// `FROM` and `WHERE` are used. `value_limit` caps the values returned
    /// by enumeration facets.
    pub fn facet_queries(
        &self,
        query: &QuerySpec,
        tables: &ResolvedTables,
        value_limit: u64,
    ) -> EngineResult<Vec<FacetQuery>> {
        let root = tables.root_table()?;
        let mut queries = Vec::with_capacity(self.facets.len());
        for facet in &self.facets {
            if facet.column.column_type().is_list() && !root.shape.has_physical_index() {
                return Err(EngineError::invalid_argument(format!(
                    "Facets on list column '{}' are not supported for {}",
                    facet.column.name(),
                    root.table
                )));
            }
            let mut logical = QuerySpec::select_columns(&[facet.column.name()], query.from.name.clone());
            logical.where_clause = query.where_clause.clone();
            let logical = self.filtered(&logical, Some(facet));
            let mut translated = translate(&logical, tables)?;

            let physical = &mut translated.query;
            physical.distinct = false;
            physical.limit = None;
            physical.offset = None;
            let target = if facet.column.column_type().is_list() {
                physical.joins.push(unnest_join(&root.table, facet.column.id));
                Expr::column(unnest_column_name(facet.column.id))
            } else {
                let column = Expr::column(facet.column.physical_name());
                match &facet.json_path {
                    Some(path) => json_extract(column, translated.binder.bind(Value::String(path.clone()))),
                    None => column,
                }
            };
            match facet.facet_type {
                FacetType::Range => {
                    physical.select = vec![
                        SelectItem::aliased(Expr::function("MIN", vec![target.clone()]), MIN_ALIAS),
                        SelectItem::aliased(Expr::function("MAX", vec![target]), MAX_ALIAS),
                    ];
                }
                FacetType::Enumeration => {
                    physical.select = vec![
                        SelectItem::aliased(target.clone(), VALUE_ALIAS),
                        SelectItem::aliased(Expr::CountStar, COUNT_ALIAS),
                    ];
                    physical.group_by = vec![target];
                    physical.order_by = vec![
                        OrderByItem {
                            expr: Expr::column(COUNT_ALIAS),
                            ascending: false,
                        },
                        OrderByItem {
                            expr: Expr::column(VALUE_ALIAS),
                            ascending: true,
                        },
                    ];
                    physical.limit = Some(value_limit);
                }
            }
            queries.push(FacetQuery {
                facet: facet.clone(),
                selection: self
                    .selections
                    .iter()
                    .find(|s| facet.matches(s))
                    .map(|s| s.selection.clone()),
                sql: translated.to_bound_sql(),
            });
        }
        Ok(queries)
    }
}

fn unnest_join(table: &IdAndVersion, column_id: u64) -> Join {
    Join {
        kind: JoinKind::Left,
        table: TableRef::named(table.list_index_table_name(column_id)),
        on: Expr::column(ROW_ID).eq(Expr::column(row_id_ref_column_name(column_id))),
    }
}

fn display_name(column: &str, json_path: Option<&str>) -> String {
    match json_path {
        Some(path) => format!("{column} {path}"),
        None => column.to_string(),
    }
}

/// The aggregation query of one facet.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetQuery {
    /// The facet.
    pub facet: FacetColumn,
    /// The caller's selection on this facet.
    pub selection: Option<FacetSelection>,
    /// Compiled aggregation.
    pub sql: BoundSql,
}

impl FacetQuery {
    /// Map the driver's result into a facet result.
    ///
    /// Fails with `InvalidArgument` when the headers or row shape are not
    /// what the query selects.
    pub fn to_result(&self, rows: &RowSet) -> EngineResult<FacetColumnResult> {
        let column_name = self.facet.column.name().to_string();
        let json_path = self.facet.json_path.clone();
        match self.facet.facet_type {
            FacetType::Range => {
                expect_headers(rows, MIN_ALIAS, MAX_ALIAS)?;
                let [row] = rows.rows.as_slice() else {
                    return Err(EngineError::invalid_argument(format!(
                        "Expected one row for the range facet on {column_name} but got {}",
                        rows.rows.len()
                    )));
                };
                let (column_min, column_max) = pair(row)?;
                let (selected_min, selected_max) = match &self.selection {
                    Some(FacetSelection::Range { min, max }) => (min.clone(), max.clone()),
                    _ => (None, None),
                };
                Ok(FacetColumnResult::Range {
                    column_name,
                    json_path,
                    column_min,
                    column_max,
                    selected_min,
                    selected_max,
                })
            }
            FacetType::Enumeration => {
                expect_headers(rows, VALUE_ALIAS, COUNT_ALIAS)?;
                let selected = match &self.selection {
                    Some(FacetSelection::Values { values }) => values.clone(),
                    _ => BTreeSet::new(),
                };
                let facet_values = rows
                    .rows
                    .iter()
                    .map(|row| {
                        let (value, count) = pair(row)?;
                        let value = value.unwrap_or_else(|| NULL_VALUE_KEYWORD.to_string());
                        let count = count
                            .as_deref()
                            .and_then(|c| c.parse().ok())
                            .ok_or_else(|| EngineError::invalid_argument(format!("Invalid facet frequency for {value}")))?;
                        Ok(FacetValueCount {
                            is_selected: selected.contains(&value),
                            value,
                            count,
                        })
                    })
                    .collect::<EngineResult<_>>()?;
                Ok(FacetColumnResult::Enumeration {
                    column_name,
                    json_path,
                    facet_values,
                })
            }
        }
    }
}

fn expect_headers(rows: &RowSet, first: &str, second: &str) -> EngineResult<()> {
    if rows.headers.len() == 2 && rows.headers[0] == first && rows.headers[1] == second {
        Ok(())
    } else {
        Err(EngineError::invalid_argument(format!(
            "Expected facet headers [{first}, {second}] but got {:?}",
            rows.headers
        )))
    }
}

fn pair(row: &[Option<String>]) -> EngineResult<(Option<String>, Option<String>)> {
    match row {
        [a, b] => Ok((a.clone(), b.clone())),
        _ => Err(EngineError::invalid_argument(format!(
            "Expected two values per facet row but got {}",
            row.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_util::*;
    use super::*;
    use crate::model::{ColumnDefinition, ColumnType, JsonSubColumn};
    use crate::query::count::{CountPlan, count_plan};

    fn faceted_schema() -> Vec<ColumnModel> {
        vec![
            column(0, "i0"),
            column(1, "i1"),
            ColumnModel::new(2, ColumnDefinition::new("i2", ColumnType::Integer).with_facet(FacetType::Range)),
            ColumnModel::new(
                3,
                ColumnDefinition::new("s", ColumnType::String).with_facet(FacetType::Enumeration),
            ),
        ]
    }

    fn tables(schema: Vec<ColumnModel>) -> ResolvedTables {
        ResolvedTables::new(IdAndVersion::current(1), vec![plain_table(1, schema)]).expect("plain table")
    }

    fn user_query() -> QuerySpec {
        QuerySpec::select_star("syn1").with_where(
            Expr::column("i0")
                .not_eq(Expr::column("i1"))
                .and(Expr::column("i0").lt(Expr::string("x"))),
        )
    }

    fn selections() -> Vec<FacetColumnRequest> {
        vec![
            FacetColumnRequest::range("i2", Some("1"), Some("5")),
            FacetColumnRequest::values("s", ["a", NULL_VALUE_KEYWORD]),
        ]
    }

    // ==================== Filter tests ====================

    #[test]
    fn selected_facets_restrict_the_count_query() -> TestResult {
        let plan = FacetPlan::new(&faceted_schema(), &selections())?;
        let filtered = plan.filter_query(&user_query());

        let translated = translate(&filtered, &tables(faceted_schema()))?;
        let CountPlan::Query(count) = count_plan(&translated) else {
            panic!("expected a count query");
        };

        assert_eq!(
            count.sql,
            "SELECT COUNT(*) FROM T1 WHERE (_C0_ <> _C1_ AND _C0_ < :b0) \
             AND ((_C2_ BETWEEN :b1 AND :b2) AND (_C3_ IS NULL OR _C3_ = :b3))"
        );
        assert_eq!(count.parameters["b1"], json!(1));
        assert_eq!(count.parameters["b3"], json!("a"));
        Ok(())
    }

    #[test]
    fn open_ranges_use_one_comparison() -> TestResult {
        let plan = FacetPlan::new(&faceted_schema(), &[FacetColumnRequest::range("i2", None, Some("9"))])?;
        let filtered = plan.filter_query(&QuerySpec::select_star("syn1"));
        assert_eq!(filtered.where_clause.map(|w| w.to_string()).as_deref(), Some("((i2 <= '9'))"));
        Ok(())
    }

    #[test]
    fn selections_must_target_faceted_columns() {
        let err = FacetPlan::new(&faceted_schema(), &[FacetColumnRequest::values("i0", ["1"])]).expect_err("not faceted");
        assert!(matches!(err, EngineError::InvalidArgument { .. }));

        let err = FacetPlan::new(&faceted_schema(), &[FacetColumnRequest::values("i2", ["1"])]).expect_err("wrong kind");
        assert!(err.to_string().contains("range facet"));
    }

    // ==================== Query tests ====================

    #[test]
    fn each_facet_ignores_its_own_selection() -> TestResult {
        let plan = FacetPlan::new(&faceted_schema(), &selections())?;
        let queries = plan.facet_queries(&user_query(), &tables(faceted_schema()), 100)?;

        assert_eq!(queries.len(), 2);
        assert_eq!(
            queries[0].sql.sql,
            "SELECT MIN(_C2_) AS minimum, MAX(_C2_) AS maximum FROM T1 \
             WHERE (_C0_ <> _C1_ AND _C0_ < :b0) AND ((_C3_ IS NULL OR _C3_ = :b1))"
        );
        assert_eq!(
            queries[1].sql.sql,
            "SELECT _C3_ AS value, COUNT(*) AS frequency FROM T1 \
             WHERE (_C0_ <> _C1_ AND _C0_ < :b0) AND ((_C2_ BETWEEN :b1 AND :b2)) \
             GROUP BY _C3_ ORDER BY frequency DESC, value LIMIT 100"
        );
        Ok(())
    }

    #[test]
    fn json_sub_columns_extract_their_path() -> TestResult {
        let schema = vec![ColumnModel::new(
            7,
            ColumnDefinition::new("doc", ColumnType::Json).with_json_sub_columns(vec![JsonSubColumn {
                name: "size".to_string(),
                json_path: "$.size".to_string(),
                column_type: ColumnType::Integer,
                facet_type: Some(FacetType::Range),
            }]),
        )];
        let plan = FacetPlan::new(&schema, &[])?;
        let queries = plan.facet_queries(&QuerySpec::select_star("syn1"), &tables(schema), 10)?;

        assert_eq!(
            queries[0].sql.sql,
            "SELECT MIN(JSON_UNQUOTE(JSON_EXTRACT(_C7_, :b0))) AS minimum, \
             MAX(JSON_UNQUOTE(JSON_EXTRACT(_C7_, :b0))) AS maximum FROM T1"
        );
        assert_eq!(queries[0].sql.parameters["b0"], json!("$.size"));
        Ok(())
    }

    #[test]
    fn list_columns_group_on_the_unnest_table() -> TestResult {
        let schema = vec![ColumnModel::new(
            4,
            ColumnDefinition::new("tags", ColumnType::StringList).with_facet(FacetType::Enumeration),
        )];
        let plan = FacetPlan::new(&schema, &[])?;
        let queries = plan.facet_queries(&QuerySpec::select_star("syn1"), &tables(schema), 10)?;

        assert_eq!(
            queries[0].sql.sql,
            "SELECT _C4__UNNEST AS value, COUNT(*) AS frequency FROM T1 \
             LEFT JOIN T1_INDEX_C4_ ON ROW_ID = ROW_ID_REF_C4_ \
             GROUP BY _C4__UNNEST ORDER BY frequency DESC, value LIMIT 10"
        );
        Ok(())
    }

    #[test]
    fn list_selections_use_json_overlaps() -> TestResult {
        let schema = vec![ColumnModel::new(
            4,
            ColumnDefinition::new("tags", ColumnType::StringList).with_facet(FacetType::Enumeration),
        )];
        let plan = FacetPlan::new(&schema, &[FacetColumnRequest::values("tags", ["a", "b"])])?;
        let filtered = plan.filter_query(&QuerySpec::select_star("syn1"));
        assert_eq!(
            filtered.where_clause.map(|w| w.to_string()).as_deref(),
            Some(r#"((JSON_OVERLAPS(tags, '["a","b"]')))"#)
        );
        Ok(())
    }

    // ==================== Result tests ====================

    fn query_for(facet_type: FacetType, selection: Option<FacetSelection>) -> FacetQuery {
        let column = match facet_type {
            FacetType::Range => faceted_schema()[2].clone(),
            FacetType::Enumeration => faceted_schema()[3].clone(),
        };
        FacetQuery {
            facet: FacetColumn {
                column,
                json_path: None,
                facet_type,
            },
            selection,
            sql: BoundSql::default(),
        }
    }

    #[test]
    fn range_results_carry_the_selection() -> TestResult {
        let query = query_for(
            FacetType::Range,
            Some(FacetSelection::Range {
                min: Some("2".to_string()),
                max: None,
            }),
        );
        let rows = RowSet::new(
            vec!["minimum", "maximum"],
            vec![vec![Some("1".to_string()), Some("40".to_string())]],
        );

        assert_eq!(
            query.to_result(&rows)?,
            FacetColumnResult::Range {
                column_name: "i2".to_string(),
                json_path: None,
                column_min: Some("1".to_string()),
                column_max: Some("40".to_string()),
                selected_min: Some("2".to_string()),
                selected_max: None,
            }
        );
        Ok(())
    }

    #[test]
    fn null_values_come_back_as_the_null_keyword() -> TestResult {
        let query = query_for(
            FacetType::Enumeration,
            Some(FacetSelection::Values {
                values: BTreeSet::from([NULL_VALUE_KEYWORD.to_string()]),
            }),
        );
        let rows = RowSet::new(
            vec!["value", "frequency"],
            vec![
                vec![Some("a".to_string()), Some("3".to_string())],
                vec![None, Some("1".to_string())],
            ],
        );

        let FacetColumnResult::Enumeration { facet_values, .. } = query.to_result(&rows)? else {
            panic!("expected an enumeration result");
        };
        assert_eq!(facet_values.len(), 2);
        assert!(!facet_values[0].is_selected);
        assert_eq!(facet_values[1].value, NULL_VALUE_KEYWORD);
        assert!(facet_values[1].is_selected);
        Ok(())
    }

    #[test]
    fn mismatched_result_shapes_are_rejected() {
        let range = query_for(FacetType::Range, None);
        let wrong_headers = RowSet::new(vec!["value", "frequency"], vec![]);
        assert!(matches!(
            range.to_result(&wrong_headers),
            Err(EngineError::InvalidArgument { .. })
        ));
        let two_rows = RowSet::new(vec!["minimum", "maximum"], vec![vec![None, None], vec![None, None]]);
        assert!(range.to_result(&two_rows).is_err());
    }
}
