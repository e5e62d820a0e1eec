use std::sync::Arc;

use crate::collaborators::InMemoryAuthorizationService;
use crate::config::EngineConfig;
use crate::index::NoopProgress;
use crate::index::test_util::{Fixture, fixture_with_config};
use crate::model::{ColumnDefinition, ColumnModel, ColumnType, IdAndVersion, IndexShapeDescription, SparseRow};
use crate::query::ast::QuerySpec;
use crate::query::engine::QueryEngine;
use crate::query::shape::ResolvedTable;

pub(crate) type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Integer column `name` with model id `id`.
pub(crate) fn column(id: u64, name: &str) -> ColumnModel {
    ColumnModel::new(id, ColumnDefinition::new(name, ColumnType::Integer))
}

/// Three integer columns `i0`, `i1`, `i2` with ids 0, 1 and 2.
pub(crate) fn i_schema() -> Vec<ColumnModel> {
    vec![column(0, "i0"), column(1, "i1"), column(2, "i2")]
}

pub(crate) fn plain_table(id: u64, schema: Vec<ColumnModel>) -> ResolvedTable {
    let table = IdAndVersion::current(id);
    ResolvedTable::new(table, IndexShapeDescription::PlainTable { table }, schema)
}

pub(crate) fn virtual_table(id: u64, defining_sql: QuerySpec, schema: Vec<ColumnModel>) -> ResolvedTable {
    let table = IdAndVersion::current(id);
    ResolvedTable::new(table, IndexShapeDescription::VirtualTable { table, defining_sql }, schema)
}

/// A query engine over the index fixture, which registers `syn1` as a plain table.
pub(crate) struct EngineFixture {
    pub(crate) engine: QueryEngine,
    pub(crate) index: Fixture,
    pub(crate) auth: Arc<InMemoryAuthorizationService>,
}

pub(crate) fn engine_fixture() -> EngineFixture {
    engine_fixture_with_config(EngineConfig::default())
}

pub(crate) fn engine_fixture_with_config(config: EngineConfig) -> EngineFixture {
    let index = fixture_with_config(config.clone());
    let auth = Arc::new(InMemoryAuthorizationService::allow_all());
    let engine = QueryEngine::new(
        index.builder.support().clone(),
        index.driver.clone(),
        auth.clone(),
        index.locks.clone(),
        Arc::new(config),
    );
    EngineFixture { engine, index, auth }
}

impl EngineFixture {
    /// Create `definitions` as column models of `syn1`, write one row per
    /// entry of `values` (row ids from 0) and build the index.
    pub(crate) async fn available_table(
        &self,
        definitions: Vec<ColumnDefinition>,
        values: Vec<Vec<Option<&str>>>,
    ) -> Result<Vec<ColumnModel>, Box<dyn std::error::Error>> {
        let table = IdAndVersion::current(1);
        let schema = self.index.schema.create_column_models(definitions).await?;
        self.index.set_schema(&table, &schema).await?;
        let rows = values
            .into_iter()
            .enumerate()
            .map(|(row_id, row)| {
                SparseRow::update(
                    row_id as u64,
                    0,
                    schema
                        .iter()
                        .zip(row)
                        .map(|(model, value)| (model.id, value.map(str::to_string))),
                )
            })
            .collect();
        self.index.append_rows(&table, &schema, rows).await?;
        self.index
            .builder
            .build_index_to_change_number(&table, &NoopProgress)
            .await?;
        Ok(schema)
    }
}
