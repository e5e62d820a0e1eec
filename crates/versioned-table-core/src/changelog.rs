//! The append-only change log ("truth") consumed by the engine.
//!
//! The log is the single source of truth for the content of every table:
//!
//! - **Append-only**: records are never mutated once written.
//! - **Monotonically versioned**: change numbers start at `0` for each table
//!   and increase by one per record, without gaps.
//! - **Etag addressed**: every record carries an opaque etag that clients
//!   use as an optimistic-concurrency token.
//!
//! The engine only needs the operations of [`ChangeLog`]. Two
//! implementations ship with the crate: [`InMemoryChangeLog`] for tests and
//! embedding, and [`FileChangeLog`], which keeps one JSON file per change
//! next to a `CURRENT` pointer and guards commits with a version check.
pub mod file_log;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::model::{ChangePayload, ChangeRecord};

pub use file_log::FileChangeLog;
pub use memory::InMemoryChangeLog;

/// Ordered stream of change records.
pub type ChangeStream = BoxStream<'static, EngineResult<ChangeRecord>>;

/// A contiguous block of reserved row ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    /// First reserved id.
    pub start: u64,
    /// Number of reserved ids.
    pub count: u64,
}

impl IdRange {
    /// Iterate the reserved ids.
    pub fn ids(&self) -> std::ops::Range<u64> {
        self.start..self.start + self.count
    }

    /// True when nothing was reserved.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Operations the engine needs from the change log.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Reserve `count` new row ids for `table`.
    async fn reserve_id_range(&self, table: u64, count: u64) -> EngineResult<IdRange>;

    /// Start a logical transaction and return its id.
    async fn start_transaction(&self, table: u64, user: &str) -> EngineResult<u64>;

    /// Append a change and return the stored record (with change number and etag).
    async fn append_change(
        &self,
        table: u64,
        user: &str,
        transaction_id: Option<u64>,
        payload: ChangePayload,
    ) -> EngineResult<ChangeRecord>;

    /// Records of `table` with a change number strictly greater than `after`
    /// (all records when `after` is `None`), in order.
    async fn iterate_changes_since(&self, table: u64, after: Option<u64>) -> EngineResult<ChangeStream>;

    /// The most recent record of `table`.
    async fn last_change(&self, table: u64) -> EngineResult<Option<ChangeRecord>>;

    /// Record a snapshot of the current state of `table`; returns the snapshot version.
    async fn create_snapshot(&self, table: u64, user: &str, transaction_id: Option<u64>) -> EngineResult<u64>;

    /// Change number captured by snapshot `version` of `table`.
    async fn snapshot_change_number(&self, table: u64, version: u64) -> EngineResult<Option<u64>>;

    /// Ids of every table with at least one record or reservation.
    async fn table_ids(&self) -> EngineResult<Vec<u64>>;

    /// Change number of the most recent record.
    async fn last_change_number(&self, table: u64) -> EngineResult<Option<u64>> {
        Ok(self.last_change(table).await?.map(|c| c.change_number))
    }

    /// Change number of the record carrying `etag`.
    async fn version_for_etag(&self, table: u64, etag: &str) -> EngineResult<u64> {
        let mut stream = self.iterate_changes_since(table, None).await?;
        while let Some(record) = stream.try_next().await? {
            if record.etag == etag {
                return Ok(record.change_number);
            }
        }
        Err(EngineError::not_found(format!(
            "No change found for etag: {etag} on table: syn{table}"
        )))
    }

    /// Schema ids recorded by the most recent COLUMN change, if any.
    async fn latest_schema_ids(&self, table: u64) -> EngineResult<Option<Vec<u64>>> {
        let records: Vec<ChangeRecord> = self
            .iterate_changes_since(table, None)
            .await?
            .try_collect()
            .await?;
        Ok(records.into_iter().rev().find_map(|r| match r.payload {
            ChangePayload::Column(change) => Some(change.new_schema_ids),
            ChangePayload::Row(_) => None,
        }))
    }
}

/// Collect the records of `table` after `after`, capped at `limit`.
pub async fn collect_changes(
    log: &dyn ChangeLog,
    table: u64,
    after: Option<u64>,
    limit: usize,
) -> EngineResult<Vec<ChangeRecord>> {
    log.iterate_changes_since(table, after)
        .await?
        .take(limit)
        .try_collect()
        .await
}

/// Fresh opaque etag.
pub fn new_etag() -> String {
    uuid::Uuid::new_v4().to_string()
}
