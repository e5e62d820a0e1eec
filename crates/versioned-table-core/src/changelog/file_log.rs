//! Durable change log kept as one JSON file per change.
//!
//! Layout under the log root:
//!
//! ```text
//! <root>/TRANSACTIONS            last issued transaction id
//! <root>/T<id>/CURRENT           number of committed changes
//! <root>/T<id>/0000000000.json   change number 0
//! <root>/T<id>/SEQUENCE          next unreserved row id
//! <root>/T<id>/SNAPSHOTS         JSON array of snapshot change numbers
//! ```
//!
//! A change is committed by creating its file with create-only-if-absent
//! semantics and then moving `CURRENT` forward with an atomic rename. Readers
//! only consider change files below `CURRENT`, so a file orphaned by a crash
//! between the two steps is ignored.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use snafu::{Backtrace, prelude::*};
use tokio::sync::Mutex;

use crate::changelog::{ChangeLog, ChangeStream, IdRange, new_etag};
use crate::error::{
    ConflictingUpdateSnafu, CorruptStateSnafu, EngineError, EngineResult, SerializationSnafu,
    StorageSnafu,
};
use crate::model::{ChangePayload, ChangeRecord};
use crate::storage::{self, LogLocation, StorageError};

/// A [`ChangeLog`] persisted under a local directory.
#[derive(Debug)]
pub struct FileChangeLog {
    location: LogLocation,
    gate: Mutex<()>,
}

impl FileChangeLog {
    /// Name of the per-table file holding the committed change count.
    pub const CURRENT_FILE_NAME: &str = "CURRENT";
    /// Name of the per-table file holding the next row id.
    pub const SEQUENCE_FILE_NAME: &str = "SEQUENCE";
    /// Name of the per-table file holding snapshot change numbers.
    pub const SNAPSHOTS_FILE_NAME: &str = "SNAPSHOTS";
    /// Name of the root file holding the last transaction id.
    pub const TRANSACTIONS_FILE_NAME: &str = "TRANSACTIONS";
    /// Digits used in zero-padded change file names.
    pub const CHANGE_FILENAME_DIGITS: usize = 10;

    /// Open (or lazily create) a log rooted at `location`.
    pub fn new(location: LogLocation) -> Self {
        Self {
            location,
            gate: Mutex::new(()),
        }
    }

    /// The root of the log.
    pub fn location(&self) -> &LogLocation {
        &self.location
    }

    fn table_dir(table: u64) -> PathBuf {
        PathBuf::from(format!("T{table}"))
    }

    fn change_rel_path(table: u64, change_number: u64) -> PathBuf {
        Self::table_dir(table).join(format!(
            "{:0width$}.json",
            change_number,
            width = Self::CHANGE_FILENAME_DIGITS
        ))
    }

    /// Read a counter file; a missing file counts as `0`.
    async fn load_counter(location: &LogLocation, rel: &Path) -> EngineResult<u64> {
        let contents = match storage::read_to_string(location, rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(EngineError::Storage { source }),
        };
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return CorruptStateSnafu {
                msg: format!("{} has empty content", rel.display()),
            }
            .fail();
        }
        trimmed.parse::<u64>().map_err(|e| EngineError::CorruptState {
            msg: format!("{} has invalid content {trimmed:?}: {e}", rel.display()),
            backtrace: Backtrace::capture(),
        })
    }

    async fn store_counter(&self, rel: &Path, value: u64) -> EngineResult<()> {
        storage::write_atomic(&self.location, rel, format!("{value}\n").as_bytes())
            .await
            .context(StorageSnafu)
    }

    /// Number of committed changes of `table`.
    pub async fn load_current_version(&self, table: u64) -> EngineResult<u64> {
        let rel = Self::table_dir(table).join(Self::CURRENT_FILE_NAME);
        Self::load_counter(&self.location, &rel).await
    }

    async fn load_change(location: &LogLocation, table: u64, change_number: u64) -> EngineResult<ChangeRecord> {
        let json = storage::read_to_string(location, &Self::change_rel_path(table, change_number))
            .await
            .context(StorageSnafu)?;
        serde_json::from_str(&json).map_err(|e| EngineError::CorruptState {
            msg: format!("failed to parse change {change_number} of table {table}: {e}"),
            backtrace: Backtrace::capture(),
        })
    }

    async fn load_snapshots(&self, table: u64) -> EngineResult<Vec<u64>> {
        let rel = Self::table_dir(table).join(Self::SNAPSHOTS_FILE_NAME);
        match storage::read_to_string(&self.location, &rel).await {
            Ok(json) => serde_json::from_str(&json).map_err(|e| EngineError::CorruptState {
                msg: format!("failed to parse snapshots of table {table}: {e}"),
                backtrace: Backtrace::capture(),
            }),
            Err(StorageError::NotFound { .. }) => Ok(Vec::new()),
            Err(source) => Err(EngineError::Storage { source }),
        }
    }

    /// Commit `record` as change number `expected`.
    ///
    /// Fails with `ConflictingUpdate` when `CURRENT` no longer equals
    /// `expected`. The create-only write of the change file is the actual
    /// guard between racing writers; its `AlreadyExists` failure surfaces as
    /// a storage error.
    pub async fn commit_with_expected_version(
        &self,
        table: u64,
        expected: u64,
        record: &ChangeRecord,
    ) -> EngineResult<u64> {
        let current = self.load_current_version(table).await?;
        if current != expected {
            return ConflictingUpdateSnafu {
                message: format!("Commit conflict: expected version {expected}, but CURRENT is {current}"),
            }
            .fail();
        }
        let next = expected.checked_add(1).context(CorruptStateSnafu {
            msg: "change counter overflow".to_string(),
        })?;

        let json = serde_json::to_vec(record).context(SerializationSnafu {
            what: format!("change {expected} of table {table}"),
        })?;
        storage::write_new(&self.location, &Self::change_rel_path(table, expected), &json)
            .await
            .context(StorageSnafu)?;

        self.store_counter(&Self::table_dir(table).join(Self::CURRENT_FILE_NAME), next)
            .await?;
        Ok(next)
    }
}

#[async_trait]
impl ChangeLog for FileChangeLog {
    async fn reserve_id_range(&self, table: u64, count: u64) -> EngineResult<IdRange> {
        let _gate = self.gate.lock().await;
        let rel = Self::table_dir(table).join(Self::SEQUENCE_FILE_NAME);
        let start = Self::load_counter(&self.location, &rel).await?;
        self.store_counter(&rel, start + count).await?;
        Ok(IdRange { start, count })
    }

    async fn start_transaction(&self, _table: u64, _user: &str) -> EngineResult<u64> {
        let _gate = self.gate.lock().await;
        let rel = PathBuf::from(Self::TRANSACTIONS_FILE_NAME);
        let id = Self::load_counter(&self.location, &rel).await? + 1;
        self.store_counter(&rel, id).await?;
        Ok(id)
    }

    async fn append_change(
        &self,
        table: u64,
        user: &str,
        transaction_id: Option<u64>,
        payload: ChangePayload,
    ) -> EngineResult<ChangeRecord> {
        let _gate = self.gate.lock().await;
        let change_number = self.load_current_version(table).await?;
        let record = ChangeRecord {
            table_id: table,
            change_number,
            etag: new_etag(),
            created_on: Utc::now(),
            created_by: user.to_string(),
            transaction_id,
            payload,
        };
        self.commit_with_expected_version(table, change_number, &record)
            .await?;
        Ok(record)
    }

    async fn iterate_changes_since(&self, table: u64, after: Option<u64>) -> EngineResult<ChangeStream> {
        let end = self.load_current_version(table).await?;
        let start = after.map_or(0, |a| a.saturating_add(1));
        let location = self.location.clone();
        let stream = futures::stream::iter(start..end.max(start)).then(move |n| {
            let location = location.clone();
            async move { Self::load_change(&location, table, n).await }
        });
        Ok(stream.boxed())
    }

    async fn last_change(&self, table: u64) -> EngineResult<Option<ChangeRecord>> {
        match self.load_current_version(table).await? {
            0 => Ok(None),
            count => Self::load_change(&self.location, table, count - 1)
                .await
                .map(Some),
        }
    }

    async fn create_snapshot(&self, table: u64, _user: &str, _transaction_id: Option<u64>) -> EngineResult<u64> {
        let _gate = self.gate.lock().await;
        let change_number = self.load_current_version(table).await?.saturating_sub(1);
        let mut snapshots = self.load_snapshots(table).await?;
        snapshots.push(change_number);
        let json = serde_json::to_vec(&snapshots).context(SerializationSnafu {
            what: format!("snapshots of table {table}"),
        })?;
        storage::write_atomic(
            &self.location,
            &Self::table_dir(table).join(Self::SNAPSHOTS_FILE_NAME),
            &json,
        )
        .await
        .context(StorageSnafu)?;
        Ok(snapshots.len() as u64)
    }

    async fn snapshot_change_number(&self, table: u64, version: u64) -> EngineResult<Option<u64>> {
        let snapshots = self.load_snapshots(table).await?;
        Ok(version
            .checked_sub(1)
            .and_then(|i| snapshots.get(i as usize).copied()))
    }

    async fn table_ids(&self) -> EngineResult<Vec<u64>> {
        let names = storage::list_dir_names(&self.location, Path::new(""))
            .await
            .context(StorageSnafu)?;
        let mut ids: Vec<u64> = names
            .iter()
            .filter_map(|n| n.strip_prefix('T').and_then(|id| id.parse().ok()))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
