//! Persistence seam for cached query results.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// One stored query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hash of the canonical request.
    pub hash: String,
    /// The request, as JSON, so it can be re-run on refresh.
    pub request_json: String,
    /// The result, as JSON.
    pub result_json: String,
    /// How long the query took to run.
    pub runtime_millis: u64,
    /// When the entry stops being served.
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// True once `now` has reached the expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Content-addressed storage of [`CacheEntry`] rows.
///
/// Writes are last-writer-wins upserts keyed by hash.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Entry stored under `hash`, expired or not.
    async fn get(&self, hash: &str) -> EngineResult<Option<CacheEntry>>;

    /// Insert or replace the entry under `entry.hash`.
    async fn put(&self, entry: CacheEntry) -> EngineResult<()>;

    /// Forget `hash`.
    async fn remove(&self, hash: &str) -> EngineResult<()>;

    /// Up to `limit` hashes whose entries expired at or before `now`,
    /// oldest expiry first.
    async fn expired_hashes(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<String>>;
}

/// [`CacheStore`] held in a map.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCacheStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, hash: &str) -> EngineResult<Option<CacheEntry>> {
        Ok(self.entries.lock().get(hash).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> EngineResult<()> {
        self.entries.lock().insert(entry.hash.clone(), entry);
        Ok(())
    }

    async fn remove(&self, hash: &str) -> EngineResult<()> {
        self.entries.lock().remove(hash);
        Ok(())
    }

    async fn expired_hashes(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<String>> {
        let entries = self.entries.lock();
        let mut expired: Vec<&CacheEntry> = entries.values().filter(|e| e.is_expired(now)).collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.hash.cmp(&b.hash)));
        Ok(expired.into_iter().take(limit).map(|e| e.hash.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn entry(hash: &str, expires_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            hash: hash.to_string(),
            request_json: "{}".to_string(),
            result_json: "{}".to_string(),
            runtime_millis: 1,
            expires_at,
        }
    }

    #[tokio::test]
    async fn expired_hashes_are_oldest_first_and_limited() -> Result<(), Box<dyn std::error::Error>> {
        let store = InMemoryCacheStore::new();
        let now = Utc::now();
        store.put(entry("fresh", now + Duration::seconds(60))).await?;
        store.put(entry("old", now - Duration::seconds(60))).await?;
        store.put(entry("older", now - Duration::seconds(120))).await?;
        store.put(entry("now", now)).await?;

        assert_eq!(store.expired_hashes(now, 10).await?, vec!["older", "old", "now"]);
        assert_eq!(store.expired_hashes(now, 1).await?, vec!["older"]);
        Ok(())
    }

    #[tokio::test]
    async fn put_replaces_the_entry() -> Result<(), Box<dyn std::error::Error>> {
        let store = InMemoryCacheStore::new();
        let now = Utc::now();
        store.put(entry("h", now)).await?;
        let mut replacement = entry("h", now + Duration::seconds(5));
        replacement.runtime_millis = 9;
        store.put(replacement.clone()).await?;

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("h").await?, Some(replacement));
        store.remove("h").await?;
        assert!(store.is_empty());
        Ok(())
    }
}
