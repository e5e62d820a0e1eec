//! Transactional update pipeline.
//!
//! [`TransactionManager::update_table`] applies a list of schema and row
//! changes, plus an optional snapshot, as one logical transaction:
//!
//! - **Validation**: schema changes are diffed and validated up front. A
//!   change that replaces a column with another is also checked against a
//!   temporary copy of the index, under the table's exclusive lock; the
//!   copy is dropped whatever the outcome.
//! - **Transaction ids** (`context` module): the log transaction is only
//!   started when a step actually appends something.
//! - **Conflicts** (`conflict` module): updates of rows changed since they
//!   were read fail with `ConflictingUpdate`. Appends to a table's log
//!   are serialized by its write lock, so the check and the append see
//!   the same log.
//! - **Completion**: the table is touched and moved to `PROCESSING` so the
//!   index builder picks the changes up.
//!
//! Every write path checks the stack status first and fails with `ReadOnly`
//! in maintenance mode.
pub mod conflict;
pub mod context;
pub mod request;

use std::future::Future;
use std::sync::Arc;

use log::{debug, info};
use snafu::prelude::*;

use crate::changelog::ChangeLog;
use crate::collaborators::authorization::ensure_can_update;
use crate::collaborators::{AuthorizationService, LockService, with_exclusive_lock};
use crate::config::EngineConfig;
use crate::error::{CorruptStateSnafu, EngineError, EngineResult, ReadOnlySnafu};
use crate::index::IndexBuilder;
use crate::model::{ChangePayload, ColumnChange, ColumnModel, IdAndVersion, SchemaChange, SparseChangeSet, SparseRow};
use crate::status::TableManagerSupport;

pub use conflict::check_for_row_level_conflict;
pub use context::TransactionContext;
pub use request::{
    AppendRowsRequest, RowReference, RowReferenceSet, TableSchemaChangeRequest, TableUpdateRequest,
    TableUpdateResponse, TableUpdateTransactionRequest, TableUpdateTransactionResponse,
};

/// Message of the error raised when a table has used up its versions.
pub const MAXIMUM_TABLE_SIZE_EXCEEDED: &str = "Maximum table size exceeded.";

/// Applies schema and row changes to tables.
#[derive(Clone)]
pub struct TransactionManager {
    builder: IndexBuilder,
    auth: Arc<dyn AuthorizationService>,
    locks: Arc<dyn LockService>,
    config: Arc<EngineConfig>,
}

impl TransactionManager {
    /// Wire a manager over its collaborators.
    pub fn new(
        builder: IndexBuilder,
        auth: Arc<dyn AuthorizationService>,
        locks: Arc<dyn LockService>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            builder,
            auth,
            locks,
            config,
        }
    }

    fn support(&self) -> &TableManagerSupport {
        self.builder.support()
    }

    fn log(&self) -> &Arc<dyn ChangeLog> {
        self.support().change_log()
    }

    /// Fail with `ReadOnly` unless the stack accepts writes.
    pub fn ensure_writable(&self) -> EngineResult<()> {
        ensure!(
            self.config.is_writable(),
            ReadOnlySnafu {
                stack_status: self.config.stack_status
            }
        );
        Ok(())
    }

    /// Run `f` with a lazily started transaction on `table_id`.
    ///
    /// On success the table is touched and moved to `PROCESSING`.
    pub async fn execute_in_transaction<T, F, Fut>(&self, user: &str, table_id: u64, f: F) -> EngineResult<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let ctx = TransactionContext::new(self.log().clone(), table_id, user);
        let result = f(ctx.clone()).await?;
        let table = IdAndVersion::current(table_id);
        self.support().touch(&table).await?;
        self.support().set_table_to_processing_and_trigger_update(&table).await?;
        if ctx.is_started() {
            info!("Committed transaction {} on {table}", ctx.transaction_id().await?);
        }
        Ok(result)
    }

    /// Apply every step of `request` for `user`.
    pub async fn update_table(
        &self,
        user: &str,
        request: &TableUpdateTransactionRequest,
    ) -> EngineResult<TableUpdateTransactionResponse> {
        self.ensure_writable()?;
        if request.changes.is_empty() && !request.create_snapshot {
            return Err(EngineError::invalid_argument(
                "Must include at least one change or create a snapshot",
            ));
        }
        let table_id = request.table_id;
        ensure_can_update(self.auth.as_ref(), user, &IdAndVersion::current(table_id)).await?;
        for change in &request.changes {
            if let TableUpdateRequest::Schema(schema_change) = change {
                self.validate_schema_update_request(table_id, schema_change).await?;
            }
        }

        self.execute_in_transaction(user, table_id, |ctx| async move {
            let mut results = Vec::with_capacity(request.changes.len());
            for change in &request.changes {
                let result = match change {
                    TableUpdateRequest::Schema(schema_change) => TableUpdateResponse::Schema {
                        schema: self.update_table_schema(user, table_id, schema_change, &ctx).await?,
                    },
                    TableUpdateRequest::AppendRows(rows) => TableUpdateResponse::Rows(
                        self.append_rows(user, table_id, rows.rows.clone(), rows.etag.as_deref(), &ctx)
                            .await?,
                    ),
                };
                results.push(result);
            }
            let snapshot_version = if request.create_snapshot {
                let transaction_id = ctx.transaction_id().await?;
                Some(self.log().create_snapshot(table_id, user, Some(transaction_id)).await?)
            } else {
                None
            };
            let transaction_id = if ctx.is_started() {
                Some(ctx.transaction_id().await?)
            } else {
                None
            };
            Ok(TableUpdateTransactionResponse {
                results,
                snapshot_version,
                transaction_id,
            })
        })
        .await
    }

    /// Delete rows read at the given versions.
    pub async fn delete_rows(&self, user: &str, table_id: u64, rows: &[RowReference]) -> EngineResult<RowReferenceSet> {
        self.ensure_writable()?;
        ensure_can_update(self.auth.as_ref(), user, &IdAndVersion::current(table_id)).await?;
        let deletes: Vec<SparseRow> = rows
            .iter()
            .map(|r| SparseRow::delete(r.row_id, r.version_number))
            .collect();
        self.execute_in_transaction(user, table_id, |ctx| async move {
            self.append_rows(user, table_id, deletes, None, &ctx).await
        })
        .await
    }

    /// Compute the new schema ids of `request` and validate them.
    ///
    /// When a column is replaced by another, the change is also applied to
    /// a temporary copy of the index so the existing data can be checked.
    pub async fn validate_schema_update_request(
        &self,
        table_id: u64,
        request: &TableSchemaChangeRequest,
    ) -> EngineResult<Vec<u64>> {
        let table = IdAndVersion::current(table_id);
        let new_ids = self
            .support()
            .schema_manager()
            .calculate_new_schema_ids_and_validate(&table, &request.changes, request.ordered_column_ids.as_deref())
            .await?;
        if request.contains_column_update() {
            with_exclusive_lock(
                self.locks.as_ref(),
                &table.lock_key(),
                self.config.exclusive_lock_timeout,
                || self.validate_against_temporary_copy(&table, &request.changes),
            )
            .await?;
        }
        Ok(new_ids)
    }

    async fn validate_against_temporary_copy(&self, table: &IdAndVersion, changes: &[ColumnChange]) -> EngineResult<()> {
        if !self.builder.driver().table_exists(table).await? {
            debug!("{table} has no index yet; nothing to check column updates against");
            return Ok(());
        }
        self.builder.create_temporary_table_copy(table).await?;
        let validated = async {
            let details = self.builder.column_change_details(table, changes).await?;
            self.builder.alter_temp_table_schema(table, &details).await
        }
        .await;
        let deleted = self.builder.delete_temporary_table_copy(table).await;
        validated?;
        deleted
    }

    /// Apply a validated schema change; appends a COLUMN change only when
    /// the schema ids actually change. Returns the resulting schema.
    pub async fn update_table_schema(
        &self,
        user: &str,
        table_id: u64,
        request: &TableSchemaChangeRequest,
        ctx: &TransactionContext,
    ) -> EngineResult<Vec<ColumnModel>> {
        self.ensure_writable()?;
        let table = IdAndVersion::current(table_id);
        with_exclusive_lock(
            self.locks.as_ref(),
            &table.write_lock_key(),
            self.config.exclusive_lock_timeout,
            || self.update_table_schema_under_lock(user, &table, request, ctx),
        )
        .await
    }

    async fn update_table_schema_under_lock(
        &self,
        user: &str,
        table: &IdAndVersion,
        request: &TableSchemaChangeRequest,
        ctx: &TransactionContext,
    ) -> EngineResult<Vec<ColumnModel>> {
        let schema = self.support().schema_manager();
        let new_ids = schema
            .calculate_new_schema_ids_and_validate(table, &request.changes, request.ordered_column_ids.as_deref())
            .await?;
        if schema.get_table_schema_ids(table).await? == new_ids {
            debug!("Schema of {table} is unchanged");
            return schema.get_bound_column_models(table).await;
        }
        let models = schema.bind_columns_to_table(table, &new_ids).await?;
        let transaction_id = ctx.transaction_id().await?;
        let record = self
            .log()
            .append_change(
                table.id,
                user,
                Some(transaction_id),
                ChangePayload::Column(SchemaChange {
                    changes: request.changes.clone(),
                    new_schema_ids: new_ids,
                }),
            )
            .await?;
        debug!("{table}: schema change {} appended", record.change_number);
        Ok(models)
    }

    /// Append `rows` to `table_id` as one ROW change.
    ///
    /// Inserts get fresh ids and every row gets the version of the new
    /// change. Updates are checked for conflicts first, against `etag` when
    /// it is given. The check and the append run under the table's write
    /// lock, so the version stamped on the rows is the change number the
    /// log assigns.
    pub async fn append_rows(
        &self,
        user: &str,
        table_id: u64,
        rows: Vec<SparseRow>,
        etag: Option<&str>,
        ctx: &TransactionContext,
    ) -> EngineResult<RowReferenceSet> {
        self.ensure_writable()?;
        if rows.is_empty() {
            return Err(EngineError::invalid_argument("Rows to append cannot be empty"));
        }
        let table = IdAndVersion::current(table_id);
        let schema = self.support().get_table_schema(&table).await?;
        validate_cells(&table, &schema, &rows)?;
        with_exclusive_lock(
            self.locks.as_ref(),
            &table.write_lock_key(),
            self.config.exclusive_lock_timeout,
            || self.append_rows_under_lock(user, &table, schema, rows, etag, ctx),
        )
        .await
    }

    async fn append_rows_under_lock(
        &self,
        user: &str,
        table: &IdAndVersion,
        schema: Vec<ColumnModel>,
        rows: Vec<SparseRow>,
        etag: Option<&str>,
        ctx: &TransactionContext,
    ) -> EngineResult<RowReferenceSet> {
        let log = self.log();
        let inserts = rows.iter().filter(|r| r.row_id.is_none()).count();
        let version = log.last_change_number(table.id).await?.map_or(0, |n| n + 1);
        if version > self.config.max_versions_per_table {
            return Err(EngineError::invalid_argument(MAXIMUM_TABLE_SIZE_EXCEEDED));
        }
        if inserts < rows.len() {
            check_for_row_level_conflict(log.as_ref(), table.id, &rows, etag).await?;
        }
        let range = log.reserve_id_range(table.id, inserts as u64).await?;

        let mut new_ids = range.ids();
        let mut set = SparseChangeSet::new(table.id, schema);
        let mut references = Vec::with_capacity(rows.len());
        for mut row in rows {
            let row_id = match row.row_id {
                Some(id) => id,
                None => new_ids
                    .next()
                    .ok_or_else(|| EngineError::invalid_argument("Reserved row id range is too small"))?,
            };
            row.row_id = Some(row_id);
            row.version_number = Some(version);
            references.push(RowReference {
                row_id,
                version_number: version,
            });
            set.add_row(row);
        }

        let transaction_id = ctx.transaction_id().await?;
        let record = log
            .append_change(table.id, user, Some(transaction_id), ChangePayload::Row(set))
            .await?;
        ensure!(
            record.change_number == version,
            CorruptStateSnafu {
                msg: format!(
                    "{table}: rows stamped with version {version} were appended as change {}",
                    record.change_number
                ),
            }
        );
        debug!("{table}: {} rows appended as change {}", references.len(), record.change_number);
        Ok(RowReferenceSet {
            table_id: table.id,
            etag: record.etag,
            rows: references,
        })
    }
}

/// Every cell must belong to a column of the schema.
fn validate_cells(table: &IdAndVersion, schema: &[ColumnModel], rows: &[SparseRow]) -> EngineResult<()> {
    for row in rows {
        if let Some(id) = row.values.keys().find(|id| !schema.iter().any(|c| c.id == **id)) {
            return Err(EngineError::invalid_argument(format!(
                "Column {id} is not part of the schema of {table}"
            )));
        }
    }
    Ok(())
}
