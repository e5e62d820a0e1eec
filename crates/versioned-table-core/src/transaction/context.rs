//! Lazily started log transactions.

use std::fmt;
use std::sync::Arc;

use log::debug;
use tokio::sync::OnceCell;

use crate::changelog::ChangeLog;
use crate::error::{EngineError, EngineResult};

struct Inner {
    table_id: u64,
    user: String,
    log: Arc<dyn ChangeLog>,
    transaction_id: OnceCell<u64>,
}

/// Handle on the logical transaction of one update.
///
/// The log transaction is started the first time its id is requested and
/// every later request, from any clone, returns the same id. An update that
/// never asks for the id leaves no transaction behind.
#[derive(Clone)]
pub struct TransactionContext {
    inner: Arc<Inner>,
}

impl TransactionContext {
    /// A context for `user` writing to `table_id`; nothing is started yet.
    pub fn new(log: Arc<dyn ChangeLog>, table_id: u64, user: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                table_id,
                user: user.into(),
                log,
                transaction_id: OnceCell::new(),
            }),
        }
    }

    /// Id of the transaction, starting it on first use.
    pub async fn transaction_id(&self) -> EngineResult<u64> {
        let inner = &self.inner;
        let id = inner
            .transaction_id
            .get_or_try_init(|| async {
                let id = inner.log.start_transaction(inner.table_id, &inner.user).await?;
                debug!("Started transaction {id} on syn{} for {}", inner.table_id, inner.user);
                Ok::<_, EngineError>(id)
            })
            .await?;
        Ok(*id)
    }

    /// True once a transaction has been started.
    pub fn is_started(&self) -> bool {
        self.inner.transaction_id.initialized()
    }

    /// Table being written.
    pub fn table_id(&self) -> u64 {
        self.inner.table_id
    }

    /// User writing.
    pub fn user(&self) -> &str {
        &self.inner.user
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("table_id", &self.inner.table_id)
            .field("user", &self.inner.user)
            .field("transaction_id", &self.inner.transaction_id.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::InMemoryChangeLog;

    #[tokio::test]
    async fn id_is_started_once_and_shared_by_clones() -> Result<(), Box<dyn std::error::Error>> {
        let log = Arc::new(InMemoryChangeLog::new());
        let ctx = TransactionContext::new(log.clone(), 3, "alice");
        assert!(!ctx.is_started());

        let first = ctx.transaction_id().await?;
        let second = ctx.clone().transaction_id().await?;

        assert_eq!(first, second);
        assert!(ctx.is_started());
        assert_eq!(log.transaction_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unused_contexts_start_nothing() {
        let log = Arc::new(InMemoryChangeLog::new());
        let ctx = TransactionContext::new(log.clone(), 3, "alice");
        drop(ctx);
        assert_eq!(log.transaction_count(), 0);
    }
}
