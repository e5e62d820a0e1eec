//! In-memory change log.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;

use crate::changelog::{ChangeLog, ChangeStream, IdRange, new_etag};
use crate::error::EngineResult;
use crate::model::{ChangePayload, ChangeRecord};

#[derive(Debug, Default)]
struct TableLog {
    changes: Vec<ChangeRecord>,
    next_row_id: u64,
    snapshots: Vec<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<u64, TableLog>,
    next_transaction_id: u64,
    started_transactions: Vec<(u64, u64, String)>,
}

/// A [`ChangeLog`] held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryChangeLog {
    inner: Mutex<Inner>,
}

impl InMemoryChangeLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions started so far.
    pub fn transaction_count(&self) -> usize {
        self.inner.lock().started_transactions.len()
    }
}

#[async_trait]
impl ChangeLog for InMemoryChangeLog {
    async fn reserve_id_range(&self, table: u64, count: u64) -> EngineResult<IdRange> {
        let mut inner = self.inner.lock();
        let log = inner.tables.entry(table).or_default();
        let range = IdRange {
            start: log.next_row_id,
            count,
        };
        log.next_row_id += count;
        Ok(range)
    }

    async fn start_transaction(&self, table: u64, user: &str) -> EngineResult<u64> {
        let mut inner = self.inner.lock();
        inner.next_transaction_id += 1;
        let id = inner.next_transaction_id;
        inner.started_transactions.push((id, table, user.to_string()));
        Ok(id)
    }

    async fn append_change(
        &self,
        table: u64,
        user: &str,
        transaction_id: Option<u64>,
        payload: ChangePayload,
    ) -> EngineResult<ChangeRecord> {
        let mut inner = self.inner.lock();
        let log = inner.tables.entry(table).or_default();
        let record = ChangeRecord {
            table_id: table,
            change_number: log.changes.len() as u64,
            etag: new_etag(),
            created_on: Utc::now(),
            created_by: user.to_string(),
            transaction_id,
            payload,
        };
        log.changes.push(record.clone());
        Ok(record)
    }

    async fn iterate_changes_since(&self, table: u64, after: Option<u64>) -> EngineResult<ChangeStream> {
        let records: Vec<ChangeRecord> = {
            let inner = self.inner.lock();
            inner
                .tables
                .get(&table)
                .map(|log| {
                    log.changes
                        .iter()
                        .filter(|c| after.is_none_or(|a| c.change_number > a))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(futures::stream::iter(records.into_iter().map(Ok)).boxed())
    }

    async fn last_change(&self, table: u64) -> EngineResult<Option<ChangeRecord>> {
        let inner = self.inner.lock();
        Ok(inner.tables.get(&table).and_then(|log| log.changes.last().cloned()))
    }

    async fn create_snapshot(&self, table: u64, _user: &str, _transaction_id: Option<u64>) -> EngineResult<u64> {
        let mut inner = self.inner.lock();
        let log = inner.tables.entry(table).or_default();
        let change_number = log.changes.len().saturating_sub(1) as u64;
        log.snapshots.push(change_number);
        Ok(log.snapshots.len() as u64)
    }

    async fn snapshot_change_number(&self, table: u64, version: u64) -> EngineResult<Option<u64>> {
        let inner = self.inner.lock();
        Ok(inner.tables.get(&table).and_then(|log| {
            version
                .checked_sub(1)
                .and_then(|i| log.snapshots.get(i as usize).copied())
        }))
    }

    async fn table_ids(&self) -> EngineResult<Vec<u64>> {
        Ok(self.inner.lock().tables.keys().copied().collect())
    }
}
