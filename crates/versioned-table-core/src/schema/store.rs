//! Persistence seam for column models and table schema bindings.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{EngineResult, SerializationSnafu};
use crate::model::{ColumnDefinition, ColumnModel, IdAndVersion};
use snafu::prelude::*;

/// Stores immutable column models and the ordered schema bound to each table.
#[async_trait]
pub trait ColumnModelStore: Send + Sync {
    /// Assign an id to `definition`; an identical definition returns the existing model.
    async fn create_column_model(&self, definition: ColumnDefinition) -> EngineResult<ColumnModel>;

    /// Look up models by id; unknown ids are skipped.
    async fn get_column_models(&self, ids: &[u64]) -> EngineResult<Vec<ColumnModel>>;

    /// Replace the schema bound to `table`.
    async fn bind_columns_to_table(&self, table: &IdAndVersion, ids: &[u64]) -> EngineResult<()>;

    /// Ordered ids bound to `table`; empty when nothing is bound.
    async fn get_column_ids_for_table(&self, table: &IdAndVersion) -> EngineResult<Vec<u64>>;
}

/// Content hash of a definition, used to de-duplicate column models.
pub fn definition_hash(definition: &ColumnDefinition) -> EngineResult<String> {
    let json = serde_json::to_vec(definition).context(SerializationSnafu {
        what: "column definition",
    })?;
    Ok(hex::encode(Sha256::digest(&json)))
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    by_id: BTreeMap<u64, ColumnModel>,
    by_hash: HashMap<String, u64>,
    bindings: HashMap<IdAndVersion, Vec<u64>>,
}

/// In-memory [`ColumnModelStore`].
#[derive(Debug, Default)]
pub struct InMemoryColumnModelStore {
    inner: Mutex<Inner>,
}

impl InMemoryColumnModelStore {
    /// An empty store; ids start at 1.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ColumnModelStore for InMemoryColumnModelStore {
    async fn create_column_model(&self, definition: ColumnDefinition) -> EngineResult<ColumnModel> {
        let hash = definition_hash(&definition)?;
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_hash.get(&hash).and_then(|id| inner.by_id.get(id)) {
            return Ok(existing.clone());
        }
        inner.next_id += 1;
        let model = ColumnModel::new(inner.next_id, definition);
        inner.by_hash.insert(hash, model.id);
        inner.by_id.insert(model.id, model.clone());
        Ok(model)
    }

    async fn get_column_models(&self, ids: &[u64]) -> EngineResult<Vec<ColumnModel>> {
        let inner = self.inner.lock();
        Ok(ids.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect())
    }

    async fn bind_columns_to_table(&self, table: &IdAndVersion, ids: &[u64]) -> EngineResult<()> {
        self.inner.lock().bindings.insert(*table, ids.to_vec());
        Ok(())
    }

    async fn get_column_ids_for_table(&self, table: &IdAndVersion) -> EngineResult<Vec<u64>> {
        Ok(self
            .inner
            .lock()
            .bindings
            .get(table)
            .cloned()
            .unwrap_or_default())
    }
}
