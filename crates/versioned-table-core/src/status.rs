//! Table status bookkeeping shared by the index builder, the query engine
//! and the write path.
//!
//! [`TableManagerSupport`] is the only component that mutates a
//! [`TableStatus`]. It answers three questions:
//!
//! - Does this table need index work? (object deleted, status not
//!   available, or index out of sync with the change log)
//! - Is the index synchronized? (applied change number and schema checksum
//!   match the truth)
//! - Which processing attempt owns the status? (reset tokens; finishing a
//!   build with a stale token is rejected)
pub mod store;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info};

use crate::changelog::ChangeLog;
use crate::collaborators::{EngineEvent, IndexDriver, Notifier, TableCatalog};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{ColumnModel, IdAndVersion, IndexShapeDescription, TableState, TableStatus};
use crate::schema::{SchemaManager, schema_checksum};

pub use store::{InMemoryTableStatusStore, TableStatusStore};

/// Status transitions and synchronization checks for tables.
#[derive(Clone)]
pub struct TableManagerSupport {
    statuses: Arc<dyn TableStatusStore>,
    change_log: Arc<dyn ChangeLog>,
    driver: Arc<dyn IndexDriver>,
    catalog: Arc<dyn TableCatalog>,
    notifier: Arc<dyn Notifier>,
    schema: SchemaManager,
    config: Arc<EngineConfig>,
}

impl TableManagerSupport {
    /// Wire the support over its collaborators.
    pub fn new(
        statuses: Arc<dyn TableStatusStore>,
        change_log: Arc<dyn ChangeLog>,
        driver: Arc<dyn IndexDriver>,
        catalog: Arc<dyn TableCatalog>,
        notifier: Arc<dyn Notifier>,
        schema: SchemaManager,
    ) -> Self {
        let config = Arc::new(schema.config().clone());
        Self {
            statuses,
            change_log,
            driver,
            catalog,
            notifier,
            schema,
            config,
        }
    }

    /// The schema manager in use.
    pub fn schema_manager(&self) -> &SchemaManager {
        &self.schema
    }

    /// The change log in use.
    pub fn change_log(&self) -> &Arc<dyn ChangeLog> {
        &self.change_log
    }

    /// The catalog in use.
    pub fn catalog(&self) -> &Arc<dyn TableCatalog> {
        &self.catalog
    }

    /// The notifier in use.
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Current status, if any.
    pub async fn get_table_status(&self, table: &IdAndVersion) -> EngineResult<Option<TableStatus>> {
        self.statuses.get(table).await
    }

    /// Current status; a missing, timed out or out-of-sync table is moved
    /// to `PROCESSING` first.
    pub async fn get_table_status_or_create_if_not_exists(&self, table: &IdAndVersion) -> EngineResult<TableStatus> {
        let Some(status) = self.statuses.get(table).await? else {
            return self.set_table_to_processing_and_trigger_update(table).await;
        };
        match status.state {
            TableState::Processing if self.is_processing_timed_out(&status) => {
                info!("Processing of {table} timed out; restarting");
                self.set_table_to_processing_and_trigger_update(table).await
            }
            TableState::Available if !self.is_index_synchronized(table).await? => {
                self.set_table_to_processing_and_trigger_update(table).await
            }
            _ => Ok(status),
        }
    }

    fn is_processing_timed_out(&self, status: &TableStatus) -> bool {
        let timeout = ChronoDuration::from_std(self.config.table_processing_timeout)
            .unwrap_or(ChronoDuration::MAX);
        Utc::now().signed_duration_since(status.changed_on) > timeout
    }

    /// Fail with `TableUnavailable` or `TableFailed` unless `table` is available.
    pub async fn validate_table_is_available(&self, table: &IdAndVersion) -> EngineResult<TableStatus> {
        let status = self.get_table_status_or_create_if_not_exists(table).await?;
        match status.state {
            TableState::Available => Ok(status),
            TableState::Processing => Err(EngineError::TableUnavailable {
                table: *table,
                status: Box::new(status),
            }),
            TableState::ProcessingFailed => Err(EngineError::TableFailed {
                table: *table,
                status: Box::new(status),
            }),
        }
    }

    /// Ordered models bound to `table`.
    pub async fn get_table_schema(&self, table: &IdAndVersion) -> EngineResult<Vec<ColumnModel>> {
        self.schema.get_bound_column_models(table).await
    }

    /// Change number the index should reach: the snapshot's captured change
    /// for versioned tables, the latest change otherwise.
    pub async fn truth_version(&self, table: &IdAndVersion) -> EngineResult<Option<u64>> {
        match self.catalog.shape(table).await? {
            IndexShapeDescription::View { scope, .. } => Ok(Some(self.driver.replication_checksum(&scope).await?)),
            IndexShapeDescription::VirtualTable { .. } | IndexShapeDescription::MaterializedView { .. } => Ok(None),
            IndexShapeDescription::PlainTable { .. } => match table.version {
                Some(version) => self.change_log.snapshot_change_number(table.id, version).await,
                None => self.change_log.last_change_number(table.id).await,
            },
        }
    }

    /// True when the index has applied the truth version and was built for
    /// the current schema.
    pub async fn is_index_synchronized(&self, table: &IdAndVersion) -> EngineResult<bool> {
        let shape = self.catalog.shape(table).await?;
        if !shape.has_physical_index() {
            return Ok(true);
        }
        let truth = self.truth_version(table).await?;
        if truth.is_some() && self.driver.get_max_current_complete_version(table).await? != truth {
            return Ok(false);
        }
        let expected = schema_checksum(&self.get_table_schema(table).await?);
        Ok(self.driver.get_schema_hash(table).await?.as_deref() == Some(expected.as_str()))
    }

    /// True when the index needs a build or a teardown.
    pub async fn is_index_work_required(&self, table: &IdAndVersion) -> EngineResult<bool> {
        if !self.catalog.exists(table).await? {
            return self.driver.table_exists(table).await;
        }
        match self.statuses.get(table).await? {
            Some(status) if status.is_available() => Ok(!self.is_index_synchronized(table).await?),
            _ => Ok(true),
        }
    }

    /// Move `table` to `PROCESSING` under a fresh reset token and return the token.
    pub async fn start_table_processing(&self, table: &IdAndVersion) -> EngineResult<String> {
        let status = self.set_table_to_processing_and_trigger_update(table).await?;
        Ok(status.reset_token)
    }

    /// Move `table` to `PROCESSING` and announce the change.
    pub async fn set_table_to_processing_and_trigger_update(&self, table: &IdAndVersion) -> EngineResult<TableStatus> {
        let status = TableStatus::new(*table, TableState::Processing, uuid::Uuid::new_v4().to_string());
        self.statuses.put(status.clone()).await?;
        debug!("{table} set to {}", status.state);
        self.notifier.notify(EngineEvent::TableStateChanged {
            table: *table,
            state: TableState::Processing,
        });
        Ok(status)
    }

    /// Finish the build owning `reset_token`; a stale token is `InvalidStatusToken`.
    pub async fn attempt_to_set_table_status_to_available(
        &self,
        table: &IdAndVersion,
        reset_token: &str,
        last_change_etag: Option<String>,
    ) -> EngineResult<TableStatus> {
        let mut status = TableStatus::new(*table, TableState::Available, reset_token);
        if let Some(current) = self.statuses.get(table).await? {
            status.started_on = current.started_on;
        }
        status.last_table_change_etag = last_change_etag;
        if !self.statuses.compare_and_put(status.clone(), reset_token).await? {
            return Err(EngineError::InvalidStatusToken {
                table: *table,
                token: reset_token.to_string(),
            });
        }
        self.notifier.notify(EngineEvent::TableStateChanged {
            table: *table,
            state: TableState::Available,
        });
        Ok(status)
    }

    /// Mark `table` as failed with `error`.
    pub async fn attempt_to_set_table_status_to_failed(
        &self,
        table: &IdAndVersion,
        error: &EngineError,
    ) -> EngineResult<TableStatus> {
        let mut status = TableStatus::new(*table, TableState::ProcessingFailed, uuid::Uuid::new_v4().to_string());
        status.error_message = Some(error.to_string());
        status.error_details = Some(format!("{error:?}"));
        self.statuses.put(status.clone()).await?;
        self.notifier.notify(EngineEvent::TableStateChanged {
            table: *table,
            state: TableState::ProcessingFailed,
        });
        Ok(status)
    }

    /// Record progress of the build owning `reset_token`.
    pub async fn attempt_to_update_table_progress(
        &self,
        table: &IdAndVersion,
        reset_token: &str,
        message: &str,
        current: u64,
        total: u64,
    ) -> EngineResult<()> {
        let Some(mut status) = self.statuses.get(table).await? else {
            return Ok(());
        };
        status.progress_message = Some(message.to_string());
        status.progress_current = Some(current);
        status.progress_total = Some(total);
        status.changed_on = Utc::now();
        if !self.statuses.compare_and_put(status, reset_token).await? {
            return Err(EngineError::InvalidStatusToken {
                table: *table,
                token: reset_token.to_string(),
            });
        }
        Ok(())
    }

    /// Record that `table` was just used.
    pub async fn touch(&self, table: &IdAndVersion) -> EngineResult<()> {
        self.statuses.touch(table, Utc::now()).await
    }

    /// Forget the status of `table`.
    pub async fn delete_table_status(&self, table: &IdAndVersion) -> EngineResult<()> {
        self.statuses.delete(table).await
    }

    /// Etag of the most recent change of `table`.
    pub async fn last_change_etag(&self, table: &IdAndVersion) -> EngineResult<Option<String>> {
        Ok(self.change_log.last_change(table.id).await?.map(|c| c.etag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::InMemoryChangeLog;
    use crate::collaborators::{InMemoryIndexDriver, InMemoryTableCatalog, RecordingNotifier};
    use crate::model::{ChangePayload, SchemaChange};
    use crate::schema::InMemoryColumnModelStore;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    struct Fixture {
        support: TableManagerSupport,
        log: Arc<InMemoryChangeLog>,
        driver: Arc<InMemoryIndexDriver>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(InMemoryChangeLog::new());
        let driver = Arc::new(InMemoryIndexDriver::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let catalog = Arc::new(InMemoryTableCatalog::new());
        catalog.register(IndexShapeDescription::PlainTable {
            table: IdAndVersion::current(1),
        });
        let schema = SchemaManager::new(
            Arc::new(InMemoryColumnModelStore::new()),
            Arc::new(EngineConfig::default()),
        );
        let support = TableManagerSupport::new(
            Arc::new(InMemoryTableStatusStore::new()),
            log.clone(),
            driver.clone(),
            catalog,
            notifier.clone(),
            schema,
        );
        Fixture {
            support,
            log,
            driver,
            notifier,
        }
    }

    // ==================== Status tests ====================

    #[tokio::test]
    async fn missing_status_is_created_as_processing() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        let status = f.support.get_table_status_or_create_if_not_exists(&table).await?;

        assert_eq!(status.state, TableState::Processing);
        assert_eq!(
            f.notifier.events(),
            vec![EngineEvent::TableStateChanged {
                table,
                state: TableState::Processing
            }]
        );
        let err = f.support.validate_table_is_available(&table).await.expect_err("processing");
        assert!(matches!(err, EngineError::TableUnavailable { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn stale_reset_token_cannot_finish_a_build() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        let first = f.support.start_table_processing(&table).await?;
        let second = f.support.start_table_processing(&table).await?;

        let err = f
            .support
            .attempt_to_set_table_status_to_available(&table, &first, None)
            .await
            .expect_err("stale");
        assert!(matches!(err, EngineError::InvalidStatusToken { .. }));
        assert!(err.is_recoverable());

        let status = f
            .support
            .attempt_to_set_table_status_to_available(&table, &second, Some("e1".into()))
            .await?;
        assert!(status.is_available());
        Ok(())
    }

    #[tokio::test]
    async fn failed_tables_report_their_error() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        f.support
            .attempt_to_set_table_status_to_failed(&table, &EngineError::driver("bad alter"))
            .await?;

        let err = f.support.validate_table_is_available(&table).await.expect_err("failed");
        assert_eq!(
            err.to_string(),
            "Table syn1 failed to build: Index driver failure: bad alter"
        );
        Ok(())
    }

    // ==================== Synchronization tests ====================

    #[tokio::test]
    async fn index_behind_the_log_needs_work() -> TestResult {
        let f = fixture();
        let table = IdAndVersion::current(1);
        f.log
            .append_change(
                1,
                "u",
                None,
                ChangePayload::Column(SchemaChange {
                    changes: vec![],
                    new_schema_ids: vec![],
                }),
            )
            .await?;
        f.driver.create_table_if_not_exists(&table, false).await?;
        f.driver.set_schema_hash(&table, &schema_checksum(&[])).await?;
        let token = f.support.start_table_processing(&table).await?;
        f.support
            .attempt_to_set_table_status_to_available(&table, &token, None)
            .await?;

        assert!(f.support.is_index_work_required(&table).await?);
        f.driver.set_max_current_complete_version(&table, 0).await?;
        assert!(!f.support.is_index_work_required(&table).await?);
        Ok(())
    }

    #[tokio::test]
    async fn deleted_object_with_index_needs_teardown() -> TestResult {
        let f = fixture();
        let gone = IdAndVersion::current(9);
        assert!(!f.support.is_index_work_required(&gone).await?);
        f.driver.create_table_if_not_exists(&gone, false).await?;
        assert!(f.support.is_index_work_required(&gone).await?);
        Ok(())
    }
}
