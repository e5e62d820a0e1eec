//! Driving an index to the latest change.

use futures::TryStreamExt;
use log::{debug, info, warn};

use crate::collaborators::with_exclusive_lock;
use crate::error::{EngineError, EngineResult};
use crate::index::IndexBuilder;
use crate::index::progress::{BuildProgress, ProgressReporter};
use crate::index::state::{BuildStateTracker, IndexBuildState};
use crate::model::{ChangePayload, IdAndVersion, IndexShapeDescription, TableState, TableStatus};
use crate::schema::schema_checksum;

/// Result of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Table that was built.
    pub table: IdAndVersion,
    /// Final state of the build.
    pub state: IndexBuildState,
    /// States entered, in order.
    pub transitions: Vec<IndexBuildState>,
    /// Highest change number applied by this attempt.
    pub applied_through: Option<u64>,
    /// Number of change records applied by this attempt.
    pub changes_applied: usize,
    /// Table status written at the end, if any.
    pub status: Option<TableStatus>,
}

impl BuildOutcome {
    fn new(table: IdAndVersion, tracker: &BuildStateTracker) -> Self {
        Self {
            table,
            state: tracker.current(),
            transitions: tracker.transitions().to_vec(),
            applied_through: None,
            changes_applied: 0,
            status: None,
        }
    }
}

impl IndexBuilder {
    /// Bring the index of `table` up to date under its exclusive lock.
    ///
    /// Lock timeouts, unavailable tables, interruptions and I/O failures
    /// come back as a single [`EngineError::Recoverable`] for the caller to
    /// requeue. Any other failure marks the table `PROCESSING_FAILED` and
    /// is reported through the returned outcome.
    pub async fn build_index_to_change_number(
        &self,
        table: &IdAndVersion,
        progress: &dyn ProgressReporter,
    ) -> EngineResult<BuildOutcome> {
        with_exclusive_lock(
            self.locks.as_ref(),
            &table.lock_key(),
            self.config.exclusive_lock_timeout,
            || self.build_under_lock(table, progress),
        )
        .await
        .map_err(EngineError::into_recoverable)
    }

    async fn build_under_lock(
        &self,
        table: &IdAndVersion,
        progress: &dyn ProgressReporter,
    ) -> EngineResult<BuildOutcome> {
        let mut tracker = BuildStateTracker::new(*table);
        if !self.support.is_index_work_required(table).await? {
            tracker.enter(IndexBuildState::NoWorkNeeded)?;
            return Ok(BuildOutcome::new(*table, &tracker));
        }
        if !self.support.catalog().exists(table).await? {
            info!("{table} no longer exists; deleting its index");
            self.delete_table_index(table).await?;
            tracker.enter(IndexBuildState::NoWorkNeeded)?;
            return Ok(BuildOutcome::new(*table, &tracker));
        }

        let status = self.support.get_table_status_or_create_if_not_exists(table).await?;
        let token = if status.state == TableState::Processing {
            status.reset_token
        } else {
            self.support.start_table_processing(table).await?
        };

        match self.build_shape(table, &token, progress, &mut tracker).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_recoverable() => Err(err),
            Err(err) => {
                warn!("Build of {table} failed: {err}");
                let failed = self.support.attempt_to_set_table_status_to_failed(table, &err).await?;
                if tracker.current().can_transition_to(IndexBuildState::Failed) {
                    tracker.enter(IndexBuildState::Failed)?;
                }
                let mut outcome = BuildOutcome::new(*table, &tracker);
                outcome.state = IndexBuildState::Failed;
                outcome.status = Some(failed);
                Ok(outcome)
            }
        }
    }

    async fn build_shape(
        &self,
        table: &IdAndVersion,
        token: &str,
        progress: &dyn ProgressReporter,
        tracker: &mut BuildStateTracker,
    ) -> EngineResult<BuildOutcome> {
        match self.support.catalog().shape(table).await? {
            IndexShapeDescription::PlainTable { .. } => {
                self.build_to_latest_change(table, token, progress, tracker).await
            }
            IndexShapeDescription::View { scope, .. } => {
                tracker.enter(IndexBuildState::SchemaAlterationPending)?;
                let schema = self.support.get_table_schema(table).await?;
                tracker.enter(IndexBuildState::RowBatchesPending)?;
                let checksum = self.populate_view_from_replication(table, &scope, &schema).await?;
                self.finish(table, token, None, tracker, Some(checksum), 0).await
            }
            IndexShapeDescription::MaterializedView {
                sources, defining_sql, ..
            } => {
                tracker.enter(IndexBuildState::SchemaAlterationPending)?;
                let schema = self.support.get_table_schema(table).await?;
                tracker.enter(IndexBuildState::RowBatchesPending)?;
                self.populate_materialized_view(table, &sources, &defining_sql, &schema)
                    .await?;
                self.finish(table, token, None, tracker, None, 0).await
            }
            IndexShapeDescription::VirtualTable { .. } => {
                tracker.enter(IndexBuildState::Optimizing)?;
                tracker.enter(IndexBuildState::Available)?;
                let status = self
                    .support
                    .attempt_to_set_table_status_to_available(table, token, None)
                    .await?;
                let mut outcome = BuildOutcome::new(*table, tracker);
                outcome.status = Some(status);
                Ok(outcome)
            }
        }
    }

    /// Apply every change after the last applied one, then finish the build.
    ///
    /// Records at or below the applied change number are skipped, so a
    /// replayed log never writes the same change twice. After the records
    /// the physical schema is forced to the bound schema; any correction is
    /// logged as a warning.
    pub async fn build_to_latest_change(
        &self,
        table: &IdAndVersion,
        token: &str,
        progress: &dyn ProgressReporter,
        tracker: &mut BuildStateTracker,
    ) -> EngineResult<BuildOutcome> {
        let target = self.support.truth_version(table).await?;
        let applied = self.driver.get_max_current_complete_version(table).await?;
        let mut changes = self
            .support
            .change_log()
            .iterate_changes_since(table.id, applied)
            .await?;

        let mut last_etag = None;
        let mut applied_through = applied;
        let mut count = 0usize;
        while let Some(record) = changes.try_next().await? {
            if target.is_some_and(|t| record.change_number > t) {
                break;
            }
            if applied.is_some_and(|a| record.change_number <= a) {
                debug!("{table}: skipping already applied change {}", record.change_number);
                continue;
            }
            let total = target.unwrap_or(record.change_number);
            match &record.payload {
                ChangePayload::Column(change) => {
                    tracker.enter(IndexBuildState::SchemaAlterationPending)?;
                    self.update_table_schema(table, change).await?;
                }
                ChangePayload::Row(change_set) => {
                    tracker.enter(IndexBuildState::RowBatchesPending)?;
                    self.apply_change_set_to_index(table, change_set, record.change_number, total, progress)
                        .await?;
                }
            }
            self.driver
                .set_max_current_complete_version(table, record.change_number)
                .await?;
            applied_through = Some(record.change_number);
            last_etag = Some(record.etag.clone());
            count += 1;

            let checkpoint = BuildProgress {
                table: *table,
                current: record.change_number,
                total,
                message: format!("Applied change {} of {total}", record.change_number),
            };
            self.support
                .attempt_to_update_table_progress(table, token, &checkpoint.message, checkpoint.current, total)
                .await?;
            progress.report(&checkpoint)?;
        }

        if last_etag.is_none() {
            last_etag = self.support.last_change_etag(table).await?;
        }
        let mut outcome = self
            .finish(table, token, last_etag, tracker, None, count)
            .await?;
        outcome.applied_through = applied_through;
        Ok(outcome)
    }

    async fn finish(
        &self,
        table: &IdAndVersion,
        token: &str,
        last_etag: Option<String>,
        tracker: &mut BuildStateTracker,
        version: Option<u64>,
        changes_applied: usize,
    ) -> EngineResult<BuildOutcome> {
        let schema = self.support.get_table_schema(table).await?;
        if tracker.current() == IndexBuildState::NoWorkNeeded {
            tracker.enter(IndexBuildState::SchemaAlterationPending)?;
        }
        let corrections = self.set_index_schema(table, &schema).await?;
        if corrections.iter().any(|c| !c.is_no_op()) {
            warn!(
                "{table}: {} schema changes applied after catch-up",
                corrections.len()
            );
        }
        self.driver
            .set_schema_hash(table, &schema_checksum(&schema))
            .await?;
        if let Some(version) = version {
            self.driver.set_max_current_complete_version(table, version).await?;
        }

        tracker.enter(IndexBuildState::Optimizing)?;
        self.optimize_table_indices(table).await?;

        let status = self
            .support
            .attempt_to_set_table_status_to_available(table, token, last_etag)
            .await?;
        tracker.enter(IndexBuildState::Available)?;
        info!("{table} is available after applying {changes_applied} changes");

        let mut outcome = BuildOutcome::new(*table, tracker);
        outcome.changes_applied = changes_applied;
        outcome.status = Some(status);
        Ok(outcome)
    }

    /// Drop the index and restart processing from the first change.
    pub async fn reset_table_index(&self, table: &IdAndVersion) -> EngineResult<String> {
        self.driver.delete_table(table).await?;
        self.support.start_table_processing(table).await
    }

    /// Drop the index and forget the table's status.
    pub async fn delete_table_index(&self, table: &IdAndVersion) -> EngineResult<()> {
        self.driver.delete_table(table).await?;
        self.support.delete_table_status(table).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::test_util::*;
    use super::*;
    use crate::changelog::ChangeLog;
    use crate::collaborators::{IndexDriver, IndexMutation, LockService};
    use crate::config::EngineConfig;
    use crate::index::progress::NoopProgress;
    use crate::model::{ColumnChange, ColumnDefinition, ColumnModel, ColumnType, SchemaChange, SparseRow};

    async fn int_column(f: &Fixture) -> Result<ColumnModel, Box<dyn std::error::Error>> {
        Ok(f
            .schema
            .create_column_model(ColumnDefinition::new("count", ColumnType::Integer))
            .await?)
    }

    fn cell(column: &ColumnModel, value: &str) -> (u64, Option<String>) {
        (column.id, Some(value.to_string()))
    }

    // ==================== Build tests ====================

    #[tokio::test]
    async fn catch_up_applies_every_change_and_marks_available() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        let column = int_column(&f).await?;
        f.set_schema(&table, std::slice::from_ref(&column)).await?;
        let last = f
            .append_rows(
                &table,
                std::slice::from_ref(&column),
                vec![
                    SparseRow::update(0, 0, [cell(&column, "5")]),
                    SparseRow::update(1, 0, [cell(&column, "7")]),
                ],
            )
            .await?;

        let outcome = f.builder.build_index_to_change_number(&table, &NoopProgress).await?;

        assert_eq!(outcome.state, IndexBuildState::Available);
        assert_eq!(
            outcome.transitions,
            vec![
                IndexBuildState::SchemaAlterationPending,
                IndexBuildState::RowBatchesPending,
                IndexBuildState::Optimizing,
                IndexBuildState::Available,
            ]
        );
        assert_eq!(outcome.changes_applied, 2);
        assert_eq!(outcome.applied_through, Some(1));
        let status = outcome.status.expect("status written");
        assert_eq!(status.last_table_change_etag, Some(last.etag));
        assert_eq!(f.driver.rows(&table).len(), 2);
        assert_eq!(f.driver.get_max_current_complete_version(&table).await?, Some(1));
        assert!(!f.builder.support().is_index_work_required(&table).await?);
        Ok(())
    }

    #[tokio::test]
    async fn replay_never_reapplies_an_applied_change() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        let column = int_column(&f).await?;
        f.set_schema(&table, std::slice::from_ref(&column)).await?;
        f.append_rows(&table, std::slice::from_ref(&column), vec![SparseRow::update(0, 0, [cell(&column, "1")])])
            .await?;
        f.builder.build_index_to_change_number(&table, &NoopProgress).await?;

        // Remove the row behind the builder's back; only a re-apply could restore it.
        f.driver
            .apply_in_write_transaction(&table, vec![IndexMutation::DeleteRows { row_ids: vec![0] }])
            .await?;
        f.append_rows(&table, std::slice::from_ref(&column), vec![SparseRow::update(1, 0, [cell(&column, "2")])])
            .await?;

        let outcome = f.builder.build_index_to_change_number(&table, &NoopProgress).await?;

        assert_eq!(outcome.changes_applied, 1);
        let rows = f.driver.rows(&table);
        assert!(!rows.contains_key(&0));
        assert!(rows.contains_key(&1));
        Ok(())
    }

    #[tokio::test]
    async fn column_updates_carry_values_into_the_new_column() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        let narrow = f
            .schema
            .create_column_model(ColumnDefinition::new("name", ColumnType::String).with_max_size(10))
            .await?;
        let wide = f
            .schema
            .create_column_model(ColumnDefinition::new("name", ColumnType::String).with_max_size(20))
            .await?;
        f.set_schema(&table, std::slice::from_ref(&narrow)).await?;
        f.append_rows(&table, std::slice::from_ref(&narrow), vec![SparseRow::update(0, 1, [cell(&narrow, "abc")])])
            .await?;
        f.builder.build_index_to_change_number(&table, &NoopProgress).await?;

        f.schema.bind_columns_to_table(&table, &[wide.id]).await?;
        f.log
            .append_change(
                table.id,
                "tester",
                None,
                ChangePayload::Column(SchemaChange {
                    changes: vec![ColumnChange::update(narrow.id, wide.id)],
                    new_schema_ids: vec![wide.id],
                }),
            )
            .await?;
        let outcome = f.builder.build_index_to_change_number(&table, &NoopProgress).await?;

        assert_eq!(outcome.state, IndexBuildState::Available);
        let rows = f.driver.rows(&table);
        assert_eq!(rows[&0].values.get(&wide.id), Some(&Some("abc".to_string())));
        assert!(!rows[&0].values.contains_key(&narrow.id));
        let columns: Vec<u64> = f
            .driver
            .get_database_info(&table)
            .await?
            .iter()
            .filter_map(|i| i.column_id())
            .collect();
        assert_eq!(columns, vec![wide.id]);
        Ok(())
    }

    #[tokio::test]
    async fn synchronized_table_needs_no_work() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        let column = int_column(&f).await?;
        f.set_schema(&table, std::slice::from_ref(&column)).await?;
        f.builder.build_index_to_change_number(&table, &NoopProgress).await?;

        let outcome = f.builder.build_index_to_change_number(&table, &NoopProgress).await?;
        assert_eq!(outcome.state, IndexBuildState::NoWorkNeeded);
        assert!(outcome.status.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unclassified_failure_marks_table_failed() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        let column = int_column(&f).await?;
        f.set_schema(&table, std::slice::from_ref(&column)).await?;
        f.driver.fail_next_alter_with("boom");

        let outcome = f.builder.build_index_to_change_number(&table, &NoopProgress).await?;

        assert_eq!(outcome.state, IndexBuildState::Failed);
        let status = outcome.status.expect("failed status");
        assert_eq!(status.state, TableState::ProcessingFailed);
        assert_eq!(status.error_message.as_deref(), Some("Index driver failure: boom"));
        Ok(())
    }

    #[tokio::test]
    async fn held_lock_surfaces_as_recoverable() -> TestResult {
        let f = fixture_with_config(EngineConfig {
            exclusive_lock_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        });
        let table = IdAndVersion::current(1);
        let _held = f
            .locks
            .acquire_exclusive(&table.lock_key(), Duration::from_millis(20))
            .await?;

        let err = f
            .builder
            .build_index_to_change_number(&table, &NoopProgress)
            .await
            .expect_err("lock held");
        assert!(matches!(err, EngineError::Recoverable { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn deleted_table_index_is_torn_down() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        let column = int_column(&f).await?;
        f.set_schema(&table, std::slice::from_ref(&column)).await?;
        f.builder.build_index_to_change_number(&table, &NoopProgress).await?;
        f.catalog.remove(&table);

        let outcome = f.builder.build_index_to_change_number(&table, &NoopProgress).await?;

        assert_eq!(outcome.state, IndexBuildState::NoWorkNeeded);
        assert!(!f.driver.table_exists(&table).await?);
        assert!(f.builder.support().get_table_status(&table).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn reset_drops_the_index_and_restarts_processing() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        let column = int_column(&f).await?;
        f.set_schema(&table, std::slice::from_ref(&column)).await?;
        f.builder.build_index_to_change_number(&table, &NoopProgress).await?;

        let token = f.builder.reset_table_index(&table).await?;

        let status = f.builder.support().get_table_status(&table).await?.expect("status");
        assert_eq!(status.state, TableState::Processing);
        assert_eq!(status.reset_token, token);
        assert!(!f.driver.table_exists(&table).await?);
        assert!(
            f.notifier
                .events()
                .iter()
                .any(|e| matches!(e, crate::collaborators::EngineEvent::TableStateChanged { state: TableState::Available, .. }))
        );
        Ok(())
    }
}
