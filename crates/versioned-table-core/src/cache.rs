//! Content-addressed query cache.
//!
//! A cached request is keyed by the SHA-256 of its canonical JSON form:
//! object keys are sorted before hashing, so two requests that differ only
//! in field order share an entry. A miss runs the query, stores the result
//! together with the request and returns the live rows. A hit returns the
//! stored rows and publishes a cache-hit event; it never runs the query.
//! Expired entries are served as misses and are re-run in the background
//! by [`QueryCache::refresh_expired`].

pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::prelude::*;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::collaborators::{BoundSql, EngineEvent, IndexDriver, Notifier, RowSet};
use crate::error::{EngineResult, SerializationSnafu};

pub use store::{CacheEntry, CacheStore, InMemoryCacheStore};

/// A query whose result may be served from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedQueryRequest {
    /// The compiled query.
    pub query: BoundSql,
    /// Lifetime of the stored result, in seconds.
    pub expires_in_secs: u64,
}

impl CachedQueryRequest {
    /// Cache `query` for `ttl`.
    pub fn new(query: BoundSql, ttl: Duration) -> Self {
        Self {
            query,
            expires_in_secs: ttl.as_secs(),
        }
    }

    /// Hex SHA-256 of the canonical JSON form of the request.
    pub fn hash(&self) -> EngineResult<String> {
        let value = serde_json::to_value(self).context(SerializationSnafu {
            what: "cached query request",
        })?;
        Ok(canonical_hash(&value))
    }
}

fn canonical_hash(value: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(canonicalize(value).to_string().as_bytes()))
}

/// Copy of `value` with the keys of every object in sorted order.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, serde_json::Value> =
                map.iter().map(|(key, value)| (key, canonicalize(value))).collect();
            serde_json::Value::Object(sorted.into_iter().map(|(key, value)| (key.clone(), value)).collect())
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn expiry(ttl_secs: u64) -> DateTime<Utc> {
    let now = Utc::now();
    i64::try_from(ttl_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Serves query results through a [`CacheStore`].
#[derive(Clone)]
pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    driver: Arc<dyn IndexDriver>,
    notifier: Arc<dyn Notifier>,
}

impl QueryCache {
    /// A cache that runs misses against `driver`.
    pub fn new(store: Arc<dyn CacheStore>, driver: Arc<dyn IndexDriver>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            driver,
            notifier,
        }
    }

    /// Stored result for `request`, or run it and store the result.
    pub async fn get_or_execute(&self, request: &CachedQueryRequest) -> EngineResult<RowSet> {
        let hash = request.hash()?;
        let stored = self.store.get(&hash).await?;
        if let Some(entry) = stored.filter(|e| !e.is_expired(Utc::now())) {
            let rows: RowSet = serde_json::from_str(&entry.result_json).context(SerializationSnafu {
                what: "cached query result",
            })?;
            debug!("Cache hit {hash}");
            self.notifier.notify(EngineEvent::CacheHit { hash });
            return Ok(rows);
        }
        self.execute_and_store(request, hash).await
    }

    /// Re-run the request stored under `hash`; false when nothing is stored.
    pub async fn refresh(&self, hash: &str) -> EngineResult<bool> {
        let Some(entry) = self.store.get(hash).await? else {
            return Ok(false);
        };
        let request: CachedQueryRequest = serde_json::from_str(&entry.request_json).context(SerializationSnafu {
            what: "cached query request",
        })?;
        self.execute_and_store(&request, hash.to_string()).await?;
        Ok(true)
    }

    /// Refresh up to `limit` expired entries; returns how many were refreshed.
    ///
    /// A failing entry is logged and skipped.
    pub async fn refresh_expired(&self, limit: usize) -> EngineResult<usize> {
        let hashes = self.store.expired_hashes(Utc::now(), limit).await?;
        let mut refreshed = 0;
        for hash in hashes {
            match self.refresh(&hash).await {
                Ok(true) => refreshed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to refresh cached query {hash}: {e}"),
            }
        }
        if refreshed > 0 {
            info!("Refreshed {refreshed} cached queries");
        }
        Ok(refreshed)
    }

    async fn execute_and_store(&self, request: &CachedQueryRequest, hash: String) -> EngineResult<RowSet> {
        let started = Instant::now();
        let rows = self.driver.query_rows(&request.query).await?;
        let runtime_millis = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let entry = CacheEntry {
            request_json: serde_json::to_string(request).context(SerializationSnafu {
                what: "cached query request",
            })?,
            result_json: serde_json::to_string(&rows).context(SerializationSnafu {
                what: "cached query result",
            })?,
            runtime_millis,
            expires_at: expiry(request.expires_in_secs),
            hash,
        };
        debug!("Cached query {} ({runtime_millis} ms)", entry.hash);
        self.store.put(entry).await?;
        Ok(rows)
    }

    /// Refresh expired entries every `interval`, `batch` at a time, until
    /// the returned worker is stopped.
    pub fn spawn_refresh_worker(&self, interval: Duration, batch: usize) -> RefreshWorker {
        let cache = self.clone();
        let (shutdown, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.refresh_expired(batch).await {
                            warn!("Cache refresh pass failed: {e}");
                        }
                    }
                }
            }
            debug!("Cache refresh worker stopped");
        });
        RefreshWorker {
            shutdown: Some(shutdown),
            handle,
        }
    }
}

/// Handle on a background refresh task.
pub struct RefreshWorker {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RefreshWorker {
    /// Stop the worker after its current pass and wait for it.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!("Cache refresh worker ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::collaborators::{InMemoryIndexDriver, RecordingNotifier};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    struct Harness {
        cache: QueryCache,
        store: Arc<InMemoryCacheStore>,
        driver: Arc<InMemoryIndexDriver>,
        notifier: Arc<RecordingNotifier>,
        runs: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryCacheStore::new());
        let driver = Arc::new(InMemoryIndexDriver::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        driver.set_query_handler(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RowSet::new(vec!["n"], vec![vec![Some(n.to_string())]]))
        });
        Harness {
            cache: QueryCache::new(store.clone(), driver.clone(), notifier.clone()),
            store,
            driver,
            notifier,
            runs,
        }
    }

    fn request(ttl: u64) -> CachedQueryRequest {
        let mut query = BoundSql::new("SELECT _C1_ FROM T1 WHERE _C1_ > :b0");
        query.parameters.insert("b0".to_string(), json!(4));
        CachedQueryRequest::new(query, Duration::from_secs(ttl))
    }

    // ==================== Hashing tests ====================

    #[test]
    fn field_order_does_not_change_the_hash() -> TestResult {
        let a: CachedQueryRequest = serde_json::from_str(
            r#"{"query":{"sql":"SELECT 1","parameters":{"b0":{"x":1,"y":2}}},"expiresInSecs":5}"#,
        )?;
        let b: CachedQueryRequest = serde_json::from_str(
            r#"{"expiresInSecs":5,"query":{"parameters":{"b0":{"y":2,"x":1}},"sql":"SELECT 1"}}"#,
        )?;
        assert_eq!(a.hash()?, b.hash()?);
        assert_eq!(a.hash()?.len(), 64);
        Ok(())
    }

    #[test]
    fn nested_objects_are_rendered_with_sorted_keys() {
        let built = json!({"b": 1, "a": {"d": 2, "c": [{"z": 0, "y": 1}]}});
        let reordered = json!({"a": {"c": [{"y": 1, "z": 0}], "d": 2}, "b": 1});
        assert_eq!(
            canonicalize(&built).to_string(),
            r#"{"a":{"c":[{"y":1,"z":0}],"d":2},"b":1}"#
        );
        assert_eq!(canonical_hash(&built), canonical_hash(&reordered));
    }

    #[test]
    fn parameters_are_part_of_the_key() -> TestResult {
        let mut other = request(60);
        other.query.parameters.insert("b0".to_string(), json!(5));
        assert_ne!(request(60).hash()?, other.hash()?);
        Ok(())
    }

    // ==================== Lookup tests ====================

    #[tokio::test]
    async fn second_identical_request_is_a_hit() -> TestResult {
        let h = harness();
        let first = h.cache.get_or_execute(&request(60)).await?;
        let second = h.cache.get_or_execute(&request(60)).await?;

        assert_eq!(first, second);
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.notifier.events(),
            vec![EngineEvent::CacheHit {
                hash: request(60).hash()?
            }]
        );
        let stored = h.store.get(&request(60).hash()?).await?.expect("stored entry");
        assert_eq!(serde_json::from_str::<CachedQueryRequest>(&stored.request_json)?, request(60));
        Ok(())
    }

    #[tokio::test]
    async fn expired_entries_run_again() -> TestResult {
        let h = harness();
        h.cache.get_or_execute(&request(0)).await?;
        let rows = h.cache.get_or_execute(&request(0)).await?;

        assert_eq!(rows.rows[0][0].as_deref(), Some("2"));
        assert!(h.notifier.events().is_empty());
        Ok(())
    }

    // ==================== Refresh tests ====================

    #[tokio::test]
    async fn refresh_reruns_the_stored_request() -> TestResult {
        let h = harness();
        h.cache.get_or_execute(&request(0)).await?;

        assert_eq!(h.cache.refresh_expired(10).await?, 1);

        let hash = request(0).hash()?;
        let entry = h.store.get(&hash).await?.expect("refreshed entry");
        let rows: RowSet = serde_json::from_str(&entry.result_json)?;
        assert_eq!(rows.rows[0][0].as_deref(), Some("2"));
        assert_eq!(h.driver.queries().len(), 2);
        assert_eq!(h.driver.queries()[1], request(0).query);
        assert!(!h.cache.refresh("missing").await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn worker_refreshes_until_stopped() -> TestResult {
        let h = harness();
        h.cache.get_or_execute(&request(0)).await?;

        let worker = h.cache.spawn_refresh_worker(Duration::from_secs(30), 10);
        tokio::time::sleep(Duration::from_secs(45)).await;
        worker.stop().await;

        let runs = h.runs.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected at least one refresh, saw {runs} runs");
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.runs.load(Ordering::SeqCst), runs);
        Ok(())
    }
}
