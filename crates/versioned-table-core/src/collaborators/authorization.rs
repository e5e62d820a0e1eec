//! Permission checks consumed by the query and write paths.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::model::{IdAndVersion, ViewObjectType};

/// Answers permission questions for a user.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// Subset of `candidates` whose rows `user` may read.
    async fn accessible_benefactors(
        &self,
        user: &str,
        object_type: ViewObjectType,
        candidates: &BTreeSet<u64>,
    ) -> EngineResult<BTreeSet<u64>>;

    /// True when `user` may query `table`.
    async fn can_read(&self, user: &str, table: &IdAndVersion) -> EngineResult<bool>;

    /// True when `user` may change `table`.
    async fn can_update(&self, user: &str, table: &IdAndVersion) -> EngineResult<bool>;
}

/// Fail with `Unauthorized` unless `user` may read `table`.
pub async fn ensure_can_read(
    auth: &dyn AuthorizationService,
    user: &str,
    table: &IdAndVersion,
) -> EngineResult<()> {
    if auth.can_read(user, table).await? {
        Ok(())
    } else {
        Err(EngineError::Unauthorized {
            message: format!("You lack READ access to the requested entity: {table}"),
        })
    }
}

/// Fail with `Unauthorized` unless `user` may update `table`.
pub async fn ensure_can_update(
    auth: &dyn AuthorizationService,
    user: &str,
    table: &IdAndVersion,
) -> EngineResult<()> {
    if auth.can_update(user, table).await? {
        Ok(())
    } else {
        Err(EngineError::Unauthorized {
            message: format!("You lack UPDATE access to the requested entity: {table}"),
        })
    }
}

#[derive(Debug, Default)]
struct Grants {
    allow_all: bool,
    benefactors: HashMap<String, BTreeSet<u64>>,
    readers: HashSet<(String, u64)>,
    writers: HashSet<(String, u64)>,
}

/// Grant table held in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuthorizationService {
    grants: Mutex<Grants>,
}

impl InMemoryAuthorizationService {
    /// Denies everything until grants are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows every table and benefactor to every user.
    pub fn allow_all() -> Self {
        let service = Self::default();
        service.grants.lock().allow_all = true;
        service
    }

    /// Let `user` see rows of `benefactors`.
    pub fn grant_benefactors(&self, user: &str, benefactors: impl IntoIterator<Item = u64>) {
        self.grants
            .lock()
            .benefactors
            .entry(user.to_string())
            .or_default()
            .extend(benefactors);
    }

    /// Let `user` query `table_id`.
    pub fn grant_read(&self, user: &str, table_id: u64) {
        self.grants.lock().readers.insert((user.to_string(), table_id));
    }

    /// Let `user` change `table_id`.
    pub fn grant_update(&self, user: &str, table_id: u64) {
        self.grants.lock().writers.insert((user.to_string(), table_id));
    }
}

#[async_trait]
impl AuthorizationService for InMemoryAuthorizationService {
    async fn accessible_benefactors(
        &self,
        user: &str,
        _object_type: ViewObjectType,
        candidates: &BTreeSet<u64>,
    ) -> EngineResult<BTreeSet<u64>> {
        let grants = self.grants.lock();
        if grants.allow_all {
            return Ok(candidates.clone());
        }
        Ok(grants
            .benefactors
            .get(user)
            .map(|allowed| candidates.intersection(allowed).copied().collect())
            .unwrap_or_default())
    }

    async fn can_read(&self, user: &str, table: &IdAndVersion) -> EngineResult<bool> {
        let grants = self.grants.lock();
        Ok(grants.allow_all || grants.readers.contains(&(user.to_string(), table.id)))
    }

    async fn can_update(&self, user: &str, table: &IdAndVersion) -> EngineResult<bool> {
        let grants = self.grants.lock();
        Ok(grants.allow_all || grants.writers.contains(&(user.to_string(), table.id)))
    }
}
