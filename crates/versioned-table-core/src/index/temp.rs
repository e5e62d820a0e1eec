//! Temporary index copies used to validate schema changes.
//!
//! Narrowing a column can only be checked against the data already in the
//! index, so the change is first applied to a full copy of the table. The
//! copy is thrown away whether or not the change turned out to be valid.

use log::debug;

use crate::error::{EngineError, EngineResult};
use crate::index::IndexBuilder;
use crate::model::{ColumnChange, ColumnChangeDetails, ColumnModel, ColumnType, IdAndVersion};
use crate::schema::size::MEDIUM_TEXT_CHARS;

impl IndexBuilder {
    /// Copy the index of `table` into its temporary table.
    pub async fn create_temporary_table_copy(&self, table: &IdAndVersion) -> EngineResult<()> {
        debug!("{table}: creating {}", table.temp_table_name());
        self.driver.create_temporary_table_copy(table).await
    }

    /// Drop the temporary table of `table`.
    pub async fn delete_temporary_table_copy(&self, table: &IdAndVersion) -> EngineResult<()> {
        self.driver.delete_temporary_table_copy(table).await
    }

    /// Resolve `changes` into the models and physical columns they touch.
    pub async fn column_change_details(
        &self,
        table: &IdAndVersion,
        changes: &[ColumnChange],
    ) -> EngineResult<Vec<ColumnChangeDetails>> {
        let infos = self.driver.get_database_info(table).await?;
        let mut details = Vec::with_capacity(changes.len());
        for change in changes {
            let old_column = match change.old_column_id {
                Some(id) => Some(self.schema().get_column_model(id).await?),
                None => None,
            };
            let new_column = match change.new_column_id {
                Some(id) => Some(self.schema().get_column_model(id).await?),
                None => None,
            };
            let old_column_info = change
                .old_column_id
                .and_then(|id| infos.iter().find(|i| i.column_id() == Some(id)).cloned());
            details.push(ColumnChangeDetails {
                old_column,
                old_column_info,
                new_column,
            });
        }
        Ok(details)
    }

    /// Check `changes` against the data in the temporary copy, then apply
    /// them to it.
    ///
    /// Rejected: shrinking a list below its longest value, LARGETEXT to
    /// MEDIUMTEXT when a value is over the MEDIUMTEXT limit, and shrinking a
    /// string below its longest value.
    pub async fn alter_temp_table_schema(
        &self,
        table: &IdAndVersion,
        changes: &[ColumnChangeDetails],
    ) -> EngineResult<()> {
        for change in changes {
            let (Some(old), Some(new)) = (&change.old_column, &change.new_column) else {
                continue;
            };
            self.validate_list_length_change(table, old, new).await?;
            self.validate_change_to_medium_text(table, old, new).await?;
            self.validate_string_size_change(table, old, new).await?;
        }
        self.driver.alter_temporary_table(table, changes).await
    }

    async fn validate_list_length_change(
        &self,
        table: &IdAndVersion,
        old: &ColumnModel,
        new: &ColumnModel,
    ) -> EngineResult<()> {
        if !(old.column_type().is_list() && new.column_type().is_list()) {
            return Ok(());
        }
        let Some(new_max) = new.definition.max_list_length else {
            return Ok(());
        };
        if old.definition.max_list_length.is_some_and(|old_max| old_max <= new_max) {
            return Ok(());
        }
        match self.driver.temporary_column_max_length(table, old.id).await? {
            Some(longest) if new_max < longest => Err(EngineError::invalid_argument(format!(
                "maximumListLength for ColumnModel \"{}\" must be at least: {longest}",
                new.name()
            ))),
            _ => Ok(()),
        }
    }

    async fn validate_change_to_medium_text(
        &self,
        table: &IdAndVersion,
        old: &ColumnModel,
        new: &ColumnModel,
    ) -> EngineResult<()> {
        if old.column_type() != ColumnType::LargeText || new.column_type() != ColumnType::MediumText {
            return Ok(());
        }
        match self.driver.temporary_column_max_length(table, old.id).await? {
            Some(longest) if longest > MEDIUM_TEXT_CHARS => Err(EngineError::invalid_argument(format!(
                "Cannot change column \"{}\" to MEDIUMTEXT: The data exceeds the MEDIUMTEXT limit of {MEDIUM_TEXT_CHARS} characters.",
                old.name()
            ))),
            _ => Ok(()),
        }
    }

    async fn validate_string_size_change(
        &self,
        table: &IdAndVersion,
        old: &ColumnModel,
        new: &ColumnModel,
    ) -> EngineResult<()> {
        if !new.column_type().is_sized_string() {
            return Ok(());
        }
        let new_max = new
            .definition
            .max_size
            .unwrap_or(self.config.default_max_string_size);
        match self.driver.temporary_column_max_length(table, old.id).await? {
            Some(longest) if new_max < longest => Err(EngineError::invalid_argument(format!(
                "The size of the column '{}' is too small.  The column size needs to be at least {longest} characters.",
                new.name()
            ))),
            _ => Ok(()),
        }
    }
}
