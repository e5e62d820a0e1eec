//! Populating materialized view indices from their defining query.

use log::info;

use crate::collaborators::{BoundSql, IndexMutation};
use crate::error::{EngineError, EngineResult};
use crate::index::IndexBuilder;
use crate::model::shape::BENEFACTOR_COLUMN;
use crate::model::{ColumnModel, IdAndVersion, IndexShapeDescription};
use crate::query::ast::{Expr, QuerySpec, SelectItem};
use crate::query::shape::{defining_table, resolve_tables};
use crate::query::translator::translate;

/// Insert statement parts for one materialized view.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedViewInsert {
    /// Physical select over the source indices.
    pub select: BoundSql,
    /// Benefactor columns filled after the view's own columns.
    pub benefactor_columns: Vec<String>,
}

impl IndexBuilder {
    /// Translate the defining query of `view` into the select that fills it.
    ///
    /// Each source view read by the query contributes its `ROW_BENEFACTOR`
    /// under the per-source column name, so reads of the view can be
    /// filtered per source.
    pub async fn materialized_view_insert(
        &self,
        view: &IdAndVersion,
        sources: &[IdAndVersion],
        defining_sql: &QuerySpec,
        schema: &[ColumnModel],
    ) -> EngineResult<MaterializedViewInsert> {
        let read = defining_table(defining_sql)?;
        let tables = resolve_tables(self.support.catalog().as_ref(), self.schema(), &read).await?;
        let translated = translate(defining_sql, &tables)?;
        if translated.select_columns.len() != schema.len() {
            return Err(EngineError::invalid_argument(format!(
                "The defining query of {view} selects {} columns but the view has {}",
                translated.select_columns.len(),
                schema.len()
            )));
        }

        let mut benefactor_columns = Vec::new();
        for source in sources {
            if !matches!(tables.get(source).map(|t| &t.shape), Ok(IndexShapeDescription::View { .. })) {
                if matches!(
                    self.support.catalog().shape(source).await?,
                    IndexShapeDescription::View { .. }
                ) {
                    return Err(EngineError::invalid_argument(format!(
                        "The defining query of {view} must read the view {source} directly"
                    )));
                }
                continue;
            }
            benefactor_columns.push(IndexShapeDescription::benefactor_column_for_source(source));
        }
        if translated.is_aggregate && !benefactor_columns.is_empty() {
            return Err(EngineError::invalid_argument(format!(
                "The defining query of {view} cannot aggregate rows of a view"
            )));
        }

        let mut query = translated.query.clone();
        query.select = translated.user_select().to_vec();
        query.select.extend(
            benefactor_columns
                .iter()
                .map(|column| SelectItem::aliased(Expr::column(BENEFACTOR_COLUMN), column.clone())),
        );
        Ok(MaterializedViewInsert {
            select: BoundSql {
                sql: query.to_string(),
                parameters: translated.binder.parameters().clone(),
            },
            benefactor_columns,
        })
    }

    /// Rebuild the rows of `view` from its defining query.
    ///
    /// Returns the number of rows the view now holds.
    pub async fn populate_materialized_view(
        &self,
        view: &IdAndVersion,
        sources: &[IdAndVersion],
        defining_sql: &QuerySpec,
        schema: &[ColumnModel],
    ) -> EngineResult<u64> {
        let insert = self.materialized_view_insert(view, sources, defining_sql, schema).await?;
        self.set_index_schema(view, schema).await?;
        self.driver.truncate_table(view).await?;
        self.driver
            .apply_in_write_transaction(
                view,
                vec![IndexMutation::InsertFromQuery {
                    columns: schema.to_vec(),
                    select: insert.select,
                    benefactor_columns: insert.benefactor_columns,
                }],
            )
            .await?;
        let lists: Vec<ColumnModel> = schema
            .iter()
            .filter(|c| c.column_type().is_list())
            .cloned()
            .collect();
        self.populate_list_column_index_tables(view, &lists, None).await?;

        let count = BoundSql::new(format!("SELECT COUNT(*) FROM {}", view.index_table_name()));
        let rows = self.driver.count(&count).await?;
        info!("{view} populated with {rows} rows from its defining query");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RowSet;
    use crate::index::test_util::*;
    use crate::index::{IndexBuildState, NoopProgress};
    use crate::model::{ColumnDefinition, ColumnType, SparseRow, ViewObjectType, ViewScope, ViewTypeMask};

    fn scope() -> ViewScope {
        ViewScope {
            object_type: ViewObjectType::Entity,
            container_ids: [9].into(),
            type_mask: ViewTypeMask::FILE,
        }
    }

    // ==================== Population tests ====================

    #[tokio::test]
    async fn built_view_holds_the_rows_of_its_source() -> TestResult {
        let f = fixture();
        let source = IdAndVersion::current(1);
        let view = IdAndVersion::current(20);
        let columns = f
            .schema
            .create_column_models(vec![
                ColumnDefinition::new("name", ColumnType::String).with_max_size(10),
                ColumnDefinition::new("size", ColumnType::Integer),
            ])
            .await?;
        f.set_schema(&source, &columns).await?;
        f.append_rows(
            &source,
            &columns,
            vec![
                SparseRow::update(0, 1, [(columns[0].id, Some("a".to_string())), (columns[1].id, Some("1".to_string()))]),
                SparseRow::update(1, 1, [(columns[0].id, Some("b".to_string())), (columns[1].id, Some("2".to_string()))]),
            ],
        )
        .await?;
        f.builder.build_index_to_change_number(&source, &NoopProgress).await?;

        f.schema.bind_columns_to_table(&view, &[columns[0].id]).await?;
        f.catalog.register(IndexShapeDescription::MaterializedView {
            view,
            sources: vec![source],
            defining_sql: QuerySpec::select_columns(&["name"], "syn1"),
        });
        let source_rows = f.driver.rows(&source);
        let name_id = columns[0].id;
        f.driver.set_query_handler(move |query| {
            Ok(if query.sql.starts_with("SELECT COUNT(") {
                RowSet::new(vec!["COUNT(*)"], vec![vec![Some(source_rows.len().to_string())]])
            } else {
                let rows = source_rows
                    .values()
                    .map(|row| vec![row.values.get(&name_id).cloned().flatten()])
                    .collect();
                RowSet::new(vec!["_C1_"], rows)
            })
        });

        let outcome = f.builder.build_index_to_change_number(&view, &NoopProgress).await?;

        assert_eq!(outcome.state, IndexBuildState::Available);
        let select = format!("SELECT _C{name_id}_ FROM T1");
        assert!(f.driver.queries().iter().any(|q| q.sql == select));
        let names: Vec<Option<String>> = f
            .driver
            .rows(&view)
            .values()
            .map(|row| row.values.get(&name_id).cloned().flatten())
            .collect();
        assert_eq!(names, vec![Some("a".to_string()), Some("b".to_string())]);
        Ok(())
    }

    #[tokio::test]
    async fn source_views_contribute_benefactor_columns() -> TestResult {
        let f = fixture();
        let source = IdAndVersion::current(5);
        let view = IdAndVersion::current(20);
        let name = f
            .schema
            .create_column_model(ColumnDefinition::new("name", ColumnType::String).with_max_size(10))
            .await?;
        f.schema.bind_columns_to_table(&source, &[name.id]).await?;
        f.schema.bind_columns_to_table(&view, &[name.id]).await?;
        f.catalog.register(IndexShapeDescription::View { view: source, scope: scope() });
        let defining_sql = QuerySpec::select_columns(&["name"], "syn5");

        let insert = f
            .builder
            .materialized_view_insert(&view, &[source], &defining_sql, &[name.clone()])
            .await?;

        assert_eq!(insert.benefactor_columns, vec!["ROW_BENEFACTOR_T5".to_string()]);
        assert_eq!(
            insert.select.sql,
            format!("SELECT _C{}_, ROW_BENEFACTOR AS ROW_BENEFACTOR_T5 FROM T5", name.id)
        );
        Ok(())
    }

    #[tokio::test]
    async fn projection_must_match_the_view_schema() -> TestResult {
        let f = fixture();
        let view = IdAndVersion::current(20);
        let columns = f
            .schema
            .create_column_models(vec![
                ColumnDefinition::new("a", ColumnType::Integer),
                ColumnDefinition::new("b", ColumnType::Integer),
            ])
            .await?;
        f.set_schema(&IdAndVersion::current(1), &columns).await?;

        let err = f
            .builder
            .materialized_view_insert(
                &view,
                &[IdAndVersion::current(1)],
                &QuerySpec::select_star("syn1"),
                &columns[..1],
            )
            .await
            .expect_err("two columns for one");
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
        Ok(())
    }
}
