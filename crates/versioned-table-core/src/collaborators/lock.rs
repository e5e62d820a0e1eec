//! Table-scoped locking.
//!
//! Exclusive leases guard schema alteration and index rebuilds; shared
//! leases let reads observe a consistent index while no rebuild runs.
//! Acquisition is bounded by a timeout and fails with `LockUnavailable`,
//! which callers treat as "retry later".

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::OptionExt;
use tokio::sync::RwLock;

use crate::error::{EngineResult, LockUnavailableSnafu};

/// A held lock; released on drop.
pub struct LockLease {
    key: String,
    exclusive: bool,
    _guard: Box<dyn Any + Send + Sync>,
}

impl LockLease {
    /// Wrap a backend guard.
    pub fn new(key: impl Into<String>, exclusive: bool, guard: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            key: key.into(),
            exclusive,
            _guard: guard,
        }
    }

    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// True for an exclusive lease.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("key", &self.key)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

/// Acquire/timeout locking API.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire an exclusive lease on `key`, waiting at most `timeout`.
    async fn acquire_exclusive(&self, key: &str, timeout: Duration) -> EngineResult<LockLease>;

    /// Acquire a shared lease on `key`, waiting at most `timeout`.
    async fn acquire_shared(&self, key: &str, timeout: Duration) -> EngineResult<LockLease>;
}

/// Run `f` while holding an exclusive lease on `key`.
pub async fn with_exclusive_lock<T, F, Fut>(
    locks: &dyn LockService,
    key: &str,
    timeout: Duration,
    f: F,
) -> EngineResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let _lease = locks.acquire_exclusive(key, timeout).await?;
    f().await
}

/// Run `f` while holding a shared lease on `key`.
pub async fn with_shared_lock<T, F, Fut>(
    locks: &dyn LockService,
    key: &str,
    timeout: Duration,
    f: F,
) -> EngineResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let _lease = locks.acquire_shared(key, timeout).await?;
    f().await
}

/// Process-local [`LockService`] backed by one tokio `RwLock` per key.
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl InMemoryLockService {
    /// An empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire_exclusive(&self, key: &str, timeout: Duration) -> EngineResult<LockLease> {
        let lock = self.lock_for(key);
        let guard = tokio::time::timeout(timeout, lock.write_owned())
            .await
            .ok()
            .context(LockUnavailableSnafu { key })?;
        Ok(LockLease::new(key, true, Box::new(guard)))
    }

    async fn acquire_shared(&self, key: &str, timeout: Duration) -> EngineResult<LockLease> {
        let lock = self.lock_for(key);
        let guard = tokio::time::timeout(timeout, lock.read_owned())
            .await
            .ok()
            .context(LockUnavailableSnafu { key })?;
        Ok(LockLease::new(key, false, Box::new(guard)))
    }
}
