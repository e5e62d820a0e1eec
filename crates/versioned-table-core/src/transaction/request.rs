//! Request and response types of table updates.

use serde::{Deserialize, Serialize};

use crate::model::{ColumnChange, ColumnModel, SparseRow};

/// Change the schema of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchemaChangeRequest {
    /// Adds, removes and updates, applied in order.
    pub changes: Vec<ColumnChange>,
    /// Desired order of the resulting ids; must be a permutation of them.
    #[serde(default)]
    pub ordered_column_ids: Option<Vec<u64>>,
}

impl TableSchemaChangeRequest {
    /// A request applying `changes` in their natural order.
    pub fn new(changes: Vec<ColumnChange>) -> Self {
        Self {
            changes,
            ordered_column_ids: None,
        }
    }

    /// True when a column is replaced by another, which needs the data
    /// already in the index to validate.
    pub fn contains_column_update(&self) -> bool {
        self.changes.iter().any(ColumnChange::is_real_update)
    }
}

/// Insert, update or delete rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRowsRequest {
    /// Rows; those without an id are inserts.
    pub rows: Vec<SparseRow>,
    /// Etag of the table version the rows were read at.
    #[serde(default)]
    pub etag: Option<String>,
}

/// One step of a table update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TableUpdateRequest {
    /// Schema change.
    Schema(TableSchemaChangeRequest),
    /// Row change.
    AppendRows(AppendRowsRequest),
}

/// Every step of one logical update of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableUpdateTransactionRequest {
    /// Table being updated.
    pub table_id: u64,
    /// Steps, applied in order.
    #[serde(default)]
    pub changes: Vec<TableUpdateRequest>,
    /// Snapshot the table once every step has been applied.
    #[serde(default)]
    pub create_snapshot: bool,
}

impl TableUpdateTransactionRequest {
    /// An update of `table_id` with no steps yet.
    pub fn new(table_id: u64) -> Self {
        Self {
            table_id,
            ..Self::default()
        }
    }

    /// Add a step.
    pub fn with_change(mut self, change: TableUpdateRequest) -> Self {
        self.changes.push(change);
        self
    }

    /// Request a snapshot.
    pub fn with_snapshot(mut self) -> Self {
        self.create_snapshot = true;
        self
    }
}

/// Where a written row ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowReference {
    /// Assigned or existing row id.
    pub row_id: u64,
    /// Version the row was written at.
    pub version_number: u64,
}

/// Rows written by one ROW change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowReferenceSet {
    /// Table written.
    pub table_id: u64,
    /// Etag of the appended change.
    pub etag: String,
    /// Rows in request order.
    pub rows: Vec<RowReference>,
}

/// Result of one [`TableUpdateRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TableUpdateResponse {
    /// Schema after a schema change.
    Schema {
        /// Ordered column models.
        schema: Vec<ColumnModel>,
    },
    /// Rows written by a row change.
    Rows(RowReferenceSet),
}

/// Result of a [`TableUpdateTransactionRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableUpdateTransactionResponse {
    /// One result per step, in order.
    pub results: Vec<TableUpdateResponse>,
    /// Version of the snapshot, when one was requested.
    pub snapshot_version: Option<u64>,
    /// Transaction the steps were appended under; `None` when nothing was appended.
    pub transaction_id: Option<u64>,
}
