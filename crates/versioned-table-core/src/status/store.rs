//! Persistence seam for table status rows.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::EngineResult;
use crate::model::{IdAndVersion, TableStatus};

/// Stores one [`TableStatus`] per table plus a last-touched timestamp.
#[async_trait]
pub trait TableStatusStore: Send + Sync {
    /// Current status of `table`.
    async fn get(&self, table: &IdAndVersion) -> EngineResult<Option<TableStatus>>;

    /// Unconditionally replace the status of `status.table`.
    async fn put(&self, status: TableStatus) -> EngineResult<()>;

    /// Replace the status only when the stored reset token equals
    /// `expected_token`; returns false when it does not.
    async fn compare_and_put(&self, status: TableStatus, expected_token: &str) -> EngineResult<bool>;

    /// Forget `table`.
    async fn delete(&self, table: &IdAndVersion) -> EngineResult<()>;

    /// Record that `table` was used at `at`.
    async fn touch(&self, table: &IdAndVersion, at: DateTime<Utc>) -> EngineResult<()>;

    /// Last time `table` was touched.
    async fn last_touched(&self, table: &IdAndVersion) -> EngineResult<Option<DateTime<Utc>>>;
}

#[derive(Debug, Default)]
struct Inner {
    statuses: HashMap<IdAndVersion, TableStatus>,
    touched: HashMap<IdAndVersion, DateTime<Utc>>,
}

/// In-memory [`TableStatusStore`].
#[derive(Debug, Default)]
pub struct InMemoryTableStatusStore {
    inner: Mutex<Inner>,
}

impl InMemoryTableStatusStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableStatusStore for InMemoryTableStatusStore {
    async fn get(&self, table: &IdAndVersion) -> EngineResult<Option<TableStatus>> {
        Ok(self.inner.lock().statuses.get(table).cloned())
    }

    async fn put(&self, status: TableStatus) -> EngineResult<()> {
        self.inner.lock().statuses.insert(status.table, status);
        Ok(())
    }

    async fn compare_and_put(&self, status: TableStatus, expected_token: &str) -> EngineResult<bool> {
        let mut inner = self.inner.lock();
        let matches = inner
            .statuses
            .get(&status.table)
            .is_some_and(|current| current.reset_token == expected_token);
        if matches {
            inner.statuses.insert(status.table, status);
        }
        Ok(matches)
    }

    async fn delete(&self, table: &IdAndVersion) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner.statuses.remove(table);
        inner.touched.remove(table);
        Ok(())
    }

    async fn touch(&self, table: &IdAndVersion, at: DateTime<Utc>) -> EngineResult<()> {
        self.inner.lock().touched.insert(*table, at);
        Ok(())
    }

    async fn last_touched(&self, table: &IdAndVersion) -> EngineResult<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().touched.get(table).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableState;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn compare_and_put_requires_the_current_token() -> TestResult {
        let store = InMemoryTableStatusStore::new();
        let table = IdAndVersion::current(1);
        store
            .put(TableStatus::new(table, TableState::Processing, "first"))
            .await?;

        let stale = store
            .compare_and_put(TableStatus::new(table, TableState::Available, "x"), "other")
            .await?;
        let fresh = store
            .compare_and_put(TableStatus::new(table, TableState::Available, "first"), "first")
            .await?;

        assert!(!stale);
        assert!(fresh);
        assert_eq!(store.get(&table).await?.map(|s| s.state), Some(TableState::Available));
        Ok(())
    }
}
