//! Build status of a table's materialized index.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::identity::IdAndVersion;

/// State of a table's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableState {
    /// A build is pending or running.
    Processing,
    /// The index is caught up with the change log and can be queried.
    Available,
    /// The last build failed with an unrecoverable error.
    ProcessingFailed,
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableState::Processing => f.write_str("PROCESSING"),
            TableState::Available => f.write_str("AVAILABLE"),
            TableState::ProcessingFailed => f.write_str("PROCESSING_FAILED"),
        }
    }
}

/// Status row of one table.
///
/// Transitions:
/// - any -> `Processing` on a new change or a restart (new reset token),
/// - `Processing` -> `Available` when the build that owns the reset token
///   catches up,
/// - any -> `ProcessingFailed` on an unrecoverable build error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatus {
    /// Table this status describes.
    pub table: IdAndVersion,
    /// Current state.
    pub state: TableState,
    /// Identifies the processing attempt that owns this status.
    pub reset_token: String,
    /// Etag of the last change applied to the index.
    pub last_table_change_etag: Option<String>,
    /// Human readable progress message.
    pub progress_message: Option<String>,
    /// Progress numerator.
    pub progress_current: Option<u64>,
    /// Progress denominator.
    pub progress_total: Option<u64>,
    /// Failure message when `state` is `ProcessingFailed`.
    pub error_message: Option<String>,
    /// Failure details when `state` is `ProcessingFailed`.
    pub error_details: Option<String>,
    /// When the current processing attempt started.
    pub started_on: DateTime<Utc>,
    /// Last time the status changed.
    pub changed_on: DateTime<Utc>,
}

impl TableStatus {
    /// A fresh status in `state` owned by `reset_token`.
    pub fn new(table: IdAndVersion, state: TableState, reset_token: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            table,
            state,
            reset_token: reset_token.into(),
            last_table_change_etag: None,
            progress_message: None,
            progress_current: None,
            progress_total: None,
            error_message: None,
            error_details: None,
            started_on: now,
            changed_on: now,
        }
    }

    /// True when the index can be queried.
    pub fn is_available(&self) -> bool {
        self.state == TableState::Available
    }
}
