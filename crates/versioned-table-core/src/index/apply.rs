//! Applying change records to an index.

use std::collections::BTreeSet;

use log::{debug, warn};

use crate::collaborators::IndexMutation;
use crate::error::EngineResult;
use crate::index::progress::{BuildProgress, ProgressReporter};
use crate::index::{FILE_HANDLE_BATCH_SIZE, IndexBuilder};
use crate::model::{
    ColumnChangeDetails, ColumnModel, DatabaseColumnInfo, IdAndVersion, IndexShapeDescription, RowGroup,
    SchemaChange, SparseChangeSet,
};
use crate::schema::changes_from_old_schema_to_new;

fn group_mutations(group: RowGroup) -> Vec<IndexMutation> {
    if group.columns.is_empty() && group.rows.iter().all(|r| r.is_delete()) {
        return vec![IndexMutation::DeleteRows {
            row_ids: group.rows.iter().filter_map(|r| r.row_id).collect(),
        }];
    }
    let row_ids: Vec<u64> = group.rows.iter().filter_map(|r| r.row_id).collect();
    let list_columns: Vec<ColumnModel> = group
        .columns
        .iter()
        .filter(|c| c.column_type().is_list())
        .cloned()
        .collect();
    let mut mutations = vec![IndexMutation::UpsertRows {
        columns: group.columns,
        rows: group.rows,
    }];
    mutations.extend(list_columns.into_iter().map(|column| IndexMutation::PopulateListColumn {
        column,
        row_ids: Some(row_ids.clone()),
    }));
    mutations
}

impl IndexBuilder {
    /// Write one ROW record to the index.
    ///
    /// Rows are grouped by the set of columns holding valid values; each
    /// group (with its list-column rows) is one write transaction. File
    /// handles referenced by the rows are applied afterwards in batches.
    /// `progress` is consulted between groups.
    pub async fn apply_change_set_to_index(
        &self,
        table: &IdAndVersion,
        change_set: &SparseChangeSet,
        change_number: u64,
        target: u64,
        progress: &dyn ProgressReporter,
    ) -> EngineResult<()> {
        let groups = change_set.group_by_valid_values(self.config.default_max_string_size);
        let group_count = groups.len();
        for (i, group) in groups.into_iter().enumerate() {
            if !group.invalid_cells.is_empty() {
                warn!(
                    "{table} change {change_number}: {} cells failed validation and were left empty",
                    group.invalid_cells.len()
                );
            }
            self.driver
                .apply_in_write_transaction(table, group_mutations(group))
                .await?;
            progress.report(&BuildProgress {
                table: *table,
                current: change_number,
                total: target,
                message: format!("Applied row group {} of {group_count}", i + 1),
            })?;
        }

        let file_handles: Vec<u64> = change_set.file_handle_ids().into_iter().collect();
        for batch in file_handles.chunks(FILE_HANDLE_BATCH_SIZE) {
            self.driver.apply_file_handle_ids(table, batch).await?;
        }
        Ok(())
    }

    /// Apply one COLUMN record.
    ///
    /// The record's own changes are applied, so an update moves the values
    /// of the old column into its replacement. Removes of columns the index
    /// does not hold are ignored.
    pub async fn update_table_schema(
        &self,
        table: &IdAndVersion,
        change: &SchemaChange,
    ) -> EngineResult<Vec<ColumnChangeDetails>> {
        let schema = self
            .schema()
            .get_and_validate_column_models(&change.new_schema_ids)
            .await?;
        self.ensure_index_table(table).await?;
        let details = self
            .column_change_details(table, &change.changes)
            .await?
            .into_iter()
            .filter_map(|mut details| {
                if details.old_column_info.is_none() {
                    details.old_column = None;
                }
                (details.old_column.is_some() || details.new_column.is_some()).then_some(details)
            })
            .collect();
        self.alter_index_schema(table, &schema, details).await
    }

    /// Make the physical index match `schema` and return the changes made.
    ///
    /// Columns missing from `schema` are dropped, new ones added; an empty
    /// schema truncates the table. Unnest tables follow the list columns.
    pub async fn set_index_schema(
        &self,
        table: &IdAndVersion,
        schema: &[ColumnModel],
    ) -> EngineResult<Vec<ColumnChangeDetails>> {
        let infos = self.ensure_index_table(table).await?;
        let current_ids: Vec<u64> = infos.iter().filter_map(|i| i.column_id()).collect();
        let new_ids: Vec<u64> = schema.iter().map(|c| c.id).collect();

        let mut details = Vec::new();
        for change in changes_from_old_schema_to_new(&current_ids, &new_ids) {
            let old_column = match change.old_column_id {
                Some(id) => Some(self.schema().get_column_model(id).await?),
                None => None,
            };
            let old_column_info = change
                .old_column_id
                .and_then(|id| infos.iter().find(|i| i.column_id() == Some(id)).cloned());
            let new_column = change
                .new_column_id
                .and_then(|id| schema.iter().find(|c| c.id == id).cloned());
            details.push(ColumnChangeDetails {
                old_column,
                old_column_info,
                new_column,
            });
        }
        self.alter_index_schema(table, schema, details).await
    }

    /// Create the index table when missing and describe its columns.
    async fn ensure_index_table(&self, table: &IdAndVersion) -> EngineResult<Vec<DatabaseColumnInfo>> {
        let with_benefactor = !matches!(
            self.support.catalog().shape(table).await,
            Ok(IndexShapeDescription::PlainTable { .. })
        );
        self.driver
            .create_table_if_not_exists(table, with_benefactor)
            .await?;
        self.driver.get_database_info(table).await
    }

    async fn alter_index_schema(
        &self,
        table: &IdAndVersion,
        schema: &[ColumnModel],
        details: Vec<ColumnChangeDetails>,
    ) -> EngineResult<Vec<ColumnChangeDetails>> {
        if !details.is_empty() {
            self.driver.alter_table(table, &details).await?;
        }
        if schema.is_empty() {
            self.driver.truncate_table(table).await?;
        }
        self.update_list_index_tables(table, schema).await?;
        Ok(details)
    }

    /// Create, drop and fill unnest tables so they match the list columns of
    /// `schema`. Newly created tables are populated from all rows.
    pub async fn update_list_index_tables(&self, table: &IdAndVersion, schema: &[ColumnModel]) -> EngineResult<()> {
        let existing = self.driver.list_index_tables(table).await?;
        let wanted: BTreeSet<u64> = schema
            .iter()
            .filter(|c| c.column_type().is_list())
            .map(|c| c.id)
            .collect();

        for stale in existing.difference(&wanted) {
            self.driver.delete_list_index_table(table, *stale).await?;
        }
        let created: Vec<ColumnModel> = schema
            .iter()
            .filter(|c| wanted.contains(&c.id) && !existing.contains(&c.id))
            .cloned()
            .collect();
        for column in &created {
            self.driver.create_list_index_table(table, column).await?;
        }
        self.populate_list_column_index_tables(table, &created, None).await
    }

    /// Fill the unnest tables of `columns`, for all rows or only `row_ids`.
    pub async fn populate_list_column_index_tables(
        &self,
        table: &IdAndVersion,
        columns: &[ColumnModel],
        row_ids: Option<&[u64]>,
    ) -> EngineResult<()> {
        if columns.is_empty() {
            return Ok(());
        }
        debug!("{table}: populating {} list index tables", columns.len());
        let mutations = columns
            .iter()
            .filter(|c| c.column_type().is_list())
            .map(|column| IndexMutation::PopulateListColumn {
                column: column.clone(),
                row_ids: row_ids.map(<[u64]>::to_vec),
            })
            .collect();
        self.driver.apply_in_write_transaction(table, mutations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDefinition, ColumnType, SparseRow};

    fn column(id: u64, t: ColumnType) -> ColumnModel {
        ColumnModel::new(id, ColumnDefinition::new(format!("c{id}"), t))
    }

    #[test]
    fn delete_groups_become_row_deletes() {
        let group = RowGroup {
            columns: vec![],
            rows: vec![SparseRow::delete(4, 1), SparseRow::delete(5, 1)],
            invalid_cells: vec![],
        };
        assert_eq!(
            group_mutations(group),
            vec![IndexMutation::DeleteRows { row_ids: vec![4, 5] }]
        );
    }

    #[test]
    fn list_columns_are_repopulated_for_the_group_rows() {
        let list = column(2, ColumnType::IntegerList);
        let group = RowGroup {
            columns: vec![column(1, ColumnType::Integer), list.clone()],
            rows: vec![SparseRow::update(9, 0, [(1, Some("1".to_string()))])],
            invalid_cells: vec![],
        };
        let mutations = group_mutations(group);
        assert_eq!(mutations.len(), 2);
        assert_eq!(
            mutations[1],
            IndexMutation::PopulateListColumn {
                column: list,
                row_ids: Some(vec![9])
            }
        );
    }
}
