//! Column-model management and schema diffing.
//!
//! [`SchemaManager`] owns the lifecycle of column definitions:
//!
//! - Creating immutable column models (validated, content de-duplicated).
//! - Resolving ordered id lists into models while rejecting unknown ids,
//!   duplicate ids and duplicate names.
//! - Computing the next schema of a table from a list of column changes
//!   (`diff` module) and checking the result against the column-count,
//!   row-size and large-text budgets (`size` module).
//! - Column-level rules for names, facets and type changes (`validation`
//!   module).
pub mod diff;
pub mod size;
pub mod store;
pub mod validation;

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{ColumnChange, ColumnChangeKind, ColumnDefinition, ColumnModel, IdAndVersion};

pub use diff::{changes_from_old_schema_to_new, diff_schema};
pub use store::{ColumnModelStore, InMemoryColumnModelStore};

/// Checksum of an ordered schema, recorded on the index when it is built.
///
/// Two schemas hash equal only when they hold the same models in the same order.
pub fn schema_checksum(schema: &[ColumnModel]) -> String {
    let mut hasher = Sha256::new();
    for column in schema {
        hasher.update(column.id.to_be_bytes());
        hasher.update(column.name().as_bytes());
        hasher.update([0u8]);
        hasher.update(column.column_type().to_string().as_bytes());
        hasher.update(column.definition.max_size.unwrap_or(0).to_be_bytes());
        hasher.update(column.definition.max_list_length.unwrap_or(0).to_be_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// CRUD and diffing over column definitions.
#[derive(Clone)]
pub struct SchemaManager {
    store: Arc<dyn ColumnModelStore>,
    config: Arc<EngineConfig>,
}

impl SchemaManager {
    /// Create a manager over `store` enforcing the budgets in `config`.
    pub fn new(store: Arc<dyn ColumnModelStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// The configuration in force.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `definition` and assign it an id (identical definitions share one).
    pub async fn create_column_model(&self, definition: ColumnDefinition) -> EngineResult<ColumnModel> {
        validation::validate_column_definition(&definition)?;
        self.store.create_column_model(definition).await
    }

    /// Create several column models, in order.
    pub async fn create_column_models(
        &self,
        definitions: Vec<ColumnDefinition>,
    ) -> EngineResult<Vec<ColumnModel>> {
        let mut models = Vec::with_capacity(definitions.len());
        for definition in definitions {
            models.push(self.create_column_model(definition).await?);
        }
        Ok(models)
    }

    /// Look up one column model.
    pub async fn get_column_model(&self, id: u64) -> EngineResult<ColumnModel> {
        self.store
            .get_column_models(&[id])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::not_found(format!("Column does not exist for id: {id}")))
    }

    /// Resolve `ids` into models in the same order.
    ///
    /// Fails with `NotFound` for unknown ids and `InvalidArgument` for
    /// duplicate ids or duplicate names.
    pub async fn get_and_validate_column_models(&self, ids: &[u64]) -> EngineResult<Vec<ColumnModel>> {
        let found = self.store.get_column_models(ids).await?;
        let mut models = Vec::with_capacity(ids.len());
        let mut seen_ids = HashSet::new();
        let mut seen_names = HashSet::new();
        for id in ids {
            let model = found
                .iter()
                .find(|m| m.id == *id)
                .cloned()
                .ok_or_else(|| EngineError::not_found(format!("Column does not exist for id: {id}")))?;
            if !seen_ids.insert(model.id) {
                return Err(EngineError::invalid_argument(format!(
                    "Duplicate column: '{}'",
                    model.name()
                )));
            }
            if !seen_names.insert(model.name().to_string()) {
                return Err(EngineError::invalid_argument(format!(
                    "Duplicate column name: '{}'",
                    model.name()
                )));
            }
            models.push(model);
        }
        Ok(models)
    }

    /// Enforce the column-count, row-size and large-text budgets.
    pub fn validate_size(&self, schema: &[ColumnModel]) -> EngineResult<()> {
        size::validate_size(schema, &self.config)
    }

    /// Rows of `schema` that fit in one page of results.
    pub fn max_rows_per_page(&self, schema: &[ColumnModel]) -> u64 {
        size::max_rows_per_page(
            schema,
            self.config.max_bytes_per_request,
            self.config.default_max_string_size,
        )
    }

    /// Ordered schema ids bound to `table`.
    pub async fn get_table_schema_ids(&self, table: &IdAndVersion) -> EngineResult<Vec<u64>> {
        self.store.get_column_ids_for_table(table).await
    }

    /// Ordered models bound to `table`.
    pub async fn get_bound_column_models(&self, table: &IdAndVersion) -> EngineResult<Vec<ColumnModel>> {
        let ids = self.get_table_schema_ids(table).await?;
        self.get_and_validate_column_models(&ids).await
    }

    /// Validate and bind `ids` as the schema of `table`.
    pub async fn bind_columns_to_table(
        &self,
        table: &IdAndVersion,
        ids: &[u64],
    ) -> EngineResult<Vec<ColumnModel>> {
        let models = self.get_and_validate_column_models(ids).await?;
        self.validate_size(&models)?;
        self.store.bind_columns_to_table(table, ids).await?;
        Ok(models)
    }

    /// Compute and validate the schema of `table` after `changes`.
    ///
    /// Besides the id arithmetic this rejects unknown or duplicate columns,
    /// budget violations and disallowed type changes on updated columns.
    pub async fn calculate_new_schema_ids_and_validate(
        &self,
        table: &IdAndVersion,
        changes: &[ColumnChange],
        ordered_ids: Option<&[u64]>,
    ) -> EngineResult<Vec<u64>> {
        let current = self.get_table_schema_ids(table).await?;
        let new_ids = diff_schema(table, &current, changes, ordered_ids)?;
        let models = self.get_and_validate_column_models(&new_ids).await?;
        self.validate_size(&models)?;

        for change in changes {
            if let ColumnChangeKind::Update { old, new } = change.kind()? {
                if old == new {
                    continue;
                }
                let old_model = self.get_column_model(old).await?;
                let new_model = self.get_column_model(new).await?;
                validation::validate_column_type_change(&old_model, &new_model)?;
            }
        }
        Ok(new_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnType, FacetType};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn manager() -> SchemaManager {
        SchemaManager::new(
            Arc::new(InMemoryColumnModelStore::new()),
            Arc::new(EngineConfig::default()),
        )
    }

    // ==================== Creation tests ====================

    #[tokio::test]
    async fn create_rejects_invalid_definitions() {
        let m = manager();
        let reserved = m
            .create_column_model(ColumnDefinition::new("ROW_VERSION", ColumnType::Integer))
            .await;
        assert!(matches!(reserved, Err(EngineError::InvalidArgument { .. })));

        let bad_facet = m
            .create_column_model(
                ColumnDefinition::new("flag", ColumnType::Boolean).with_facet(FacetType::Range),
            )
            .await;
        assert!(matches!(bad_facet, Err(EngineError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn get_unknown_column_is_not_found() {
        let err = manager().get_column_model(404).await.expect_err("missing");
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert_eq!(err.to_string(), "Column does not exist for id: 404");
    }

    // ==================== Validation tests ====================

    #[tokio::test]
    async fn duplicate_ids_and_names_are_rejected() -> TestResult {
        let m = manager();
        let a = m
            .create_column_model(ColumnDefinition::new("a", ColumnType::Integer))
            .await?;
        let a_string = m
            .create_column_model(ColumnDefinition::new("a", ColumnType::String))
            .await?;

        let dup_id = m
            .get_and_validate_column_models(&[a.id, a.id])
            .await
            .expect_err("dup id");
        assert_eq!(dup_id.to_string(), "Duplicate column: 'a'");

        let dup_name = m
            .get_and_validate_column_models(&[a.id, a_string.id])
            .await
            .expect_err("dup name");
        assert_eq!(dup_name.to_string(), "Duplicate column name: 'a'");
        Ok(())
    }

    #[tokio::test]
    async fn new_schema_is_computed_and_bound_schema_unchanged() -> TestResult {
        let m = manager();
        let table = IdAndVersion::current(1);
        let cols = m
            .create_column_models(vec![
                ColumnDefinition::new("a", ColumnType::Integer),
                ColumnDefinition::new("b", ColumnType::String),
                ColumnDefinition::new("c", ColumnType::Double),
            ])
            .await?;
        m.bind_columns_to_table(&table, &[cols[0].id, cols[1].id]).await?;

        let next = m
            .calculate_new_schema_ids_and_validate(
                &table,
                &[ColumnChange::remove(cols[0].id), ColumnChange::add(cols[2].id)],
                None,
            )
            .await?;

        assert_eq!(next, vec![cols[1].id, cols[2].id]);
        assert_eq!(
            m.get_table_schema_ids(&table).await?,
            vec![cols[0].id, cols[1].id]
        );
        Ok(())
    }

    #[tokio::test]
    async fn adding_a_bound_column_again_is_rejected() -> TestResult {
        let m = manager();
        let table = IdAndVersion::current(1);
        let a = m
            .create_column_model(ColumnDefinition::new("a", ColumnType::Integer))
            .await?;
        m.bind_columns_to_table(&table, &[a.id]).await?;

        let err = m
            .calculate_new_schema_ids_and_validate(&table, &[ColumnChange::add(a.id)], None)
            .await
            .expect_err("duplicate add");
        assert_eq!(err.to_string(), "Duplicate column: 'a'");
        assert_eq!(m.get_table_schema_ids(&table).await?, vec![a.id]);
        Ok(())
    }

    #[tokio::test]
    async fn update_across_list_boundary_is_rejected() -> TestResult {
        let m = manager();
        let table = IdAndVersion::current(1);
        let scalar = m
            .create_column_model(ColumnDefinition::new("a", ColumnType::String))
            .await?;
        let list = m
            .create_column_model(ColumnDefinition::new("a", ColumnType::StringList))
            .await?;
        m.bind_columns_to_table(&table, &[scalar.id]).await?;

        let err = m
            .calculate_new_schema_ids_and_validate(
                &table,
                &[ColumnChange::update(scalar.id, list.id)],
                None,
            )
            .await
            .expect_err("list change");
        assert_eq!(err.to_string(), "A STRING column cannot be changed to STRING_LIST");
        Ok(())
    }

    #[test]
    fn checksum_depends_on_order_and_content() {
        let a = ColumnModel::new(1, ColumnDefinition::new("a", ColumnType::Integer));
        let b = ColumnModel::new(2, ColumnDefinition::new("b", ColumnType::Integer));
        let ab = schema_checksum(&[a.clone(), b.clone()]);
        assert_eq!(ab, schema_checksum(&[a.clone(), b.clone()]));
        assert_ne!(ab, schema_checksum(&[b, a]));
        assert_ne!(ab, schema_checksum(&[]));
    }
}
