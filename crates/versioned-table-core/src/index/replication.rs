//! Populating view indices from replicated object metadata.

use log::{info, warn};

use crate::collaborators::IndexMutation;
use crate::error::{EngineError, EngineResult};
use crate::index::IndexBuilder;
use crate::model::{ColumnModel, ColumnType, IdAndVersion, ViewScope};
use crate::schema::size::{DEFAULT_LIST_STRING_SIZE, MEDIUM_TEXT_CHARS};

/// Characters a column can hold, when it is bounded.
fn column_capacity(column: &ColumnModel, default_max_string_size: u64) -> Option<u64> {
    let column_type = column.column_type();
    if column_type.is_sized_string() {
        return Some(column.definition.max_size.unwrap_or(default_max_string_size));
    }
    match column_type {
        ColumnType::MediumText => Some(MEDIUM_TEXT_CHARS),
        ColumnType::StringList => Some(column.definition.max_size.unwrap_or(DEFAULT_LIST_STRING_SIZE)),
        _ => None,
    }
}

impl IndexBuilder {
    /// Rebuild a view's rows from every replicated object in `scope`.
    ///
    /// Returns the replication checksum the view now reflects.
    pub async fn populate_view_from_replication(
        &self,
        view: &IdAndVersion,
        scope: &ViewScope,
        schema: &[ColumnModel],
    ) -> EngineResult<u64> {
        self.set_index_schema(view, schema).await?;
        self.driver.truncate_table(view).await?;

        let copy = vec![IndexMutation::CopyFromReplication {
            scope: scope.clone(),
            schema: schema.to_vec(),
            row_ids: None,
        }];
        if let Err(err) = self.driver.apply_in_write_transaction(view, copy).await {
            return Err(self.classify_replication_failure(scope, schema, err).await);
        }
        let lists: Vec<ColumnModel> = schema
            .iter()
            .filter(|c| c.column_type().is_list())
            .cloned()
            .collect();
        self.populate_list_column_index_tables(view, &lists, None).await?;

        let checksum = self.driver.replication_checksum(scope).await?;
        info!("{view} populated from replication at checksum {checksum}");
        Ok(checksum)
    }

    /// Replace the rows `row_ids` of a view with fresh copies.
    ///
    /// The delete, the copy and the list-column refresh share one write
    /// transaction.
    pub async fn update_view_rows(
        &self,
        view: &IdAndVersion,
        row_ids: &[u64],
        scope: &ViewScope,
        schema: &[ColumnModel],
    ) -> EngineResult<()> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let mut mutations = vec![
            IndexMutation::DeleteRows {
                row_ids: row_ids.to_vec(),
            },
            IndexMutation::CopyFromReplication {
                scope: scope.clone(),
                schema: schema.to_vec(),
                row_ids: Some(row_ids.to_vec()),
            },
        ];
        mutations.extend(
            schema
                .iter()
                .filter(|c| c.column_type().is_list())
                .map(|column| IndexMutation::PopulateListColumn {
                    column: column.clone(),
                    row_ids: Some(row_ids.to_vec()),
                }),
        );
        match self.driver.apply_in_write_transaction(view, mutations).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.classify_replication_failure(scope, schema, err).await),
        }
    }

    /// Turn a failed copy into a "column too small" error when a replicated
    /// value does not fit its column; otherwise return `original`.
    pub async fn classify_replication_failure(
        &self,
        scope: &ViewScope,
        schema: &[ColumnModel],
        original: EngineError,
    ) -> EngineError {
        let sizes = match self.driver.replication_max_value_sizes(scope).await {
            Ok(sizes) => sizes,
            Err(lookup) => {
                warn!("Could not inspect replicated value sizes: {lookup}");
                return original;
            }
        };
        for column in schema {
            let Some(capacity) = column_capacity(column, self.config.default_max_string_size) else {
                continue;
            };
            match sizes.get(column.name()) {
                Some(&needed) if needed > capacity => {
                    warn!("Replication copy failed because column '{}' is too small", column.name());
                    return EngineError::invalid_argument(format!(
                        "The size of the column '{}' is too small.  The column size needs to be at least {needed} characters.",
                        column.name()
                    ));
                }
                _ => {}
            }
        }
        original
    }
}
