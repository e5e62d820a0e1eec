//! Which objects exist and which index shape backs each.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::model::{IdAndVersion, IndexShapeDescription};

/// Lookup of table existence and shape.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// True when the object behind `table` still exists.
    async fn exists(&self, table: &IdAndVersion) -> EngineResult<bool>;

    /// The shape backing `table`; `NotFound` when it does not exist.
    async fn shape(&self, table: &IdAndVersion) -> EngineResult<IndexShapeDescription>;
}

/// Catalog populated by hand.
///
/// A versioned id that was not registered falls back to the shape of the
/// current id, re-targeted at the snapshot.
#[derive(Debug, Default)]
pub struct InMemoryTableCatalog {
    shapes: Mutex<HashMap<IdAndVersion, IndexShapeDescription>>,
}

impl InMemoryTableCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) `shape` under its id.
    pub fn register(&self, shape: IndexShapeDescription) {
        self.shapes.lock().insert(shape.id(), shape);
    }

    /// Forget `table` (and nothing else).
    pub fn remove(&self, table: &IdAndVersion) {
        self.shapes.lock().remove(table);
    }

    fn lookup(&self, table: &IdAndVersion) -> Option<IndexShapeDescription> {
        let shapes = self.shapes.lock();
        if let Some(shape) = shapes.get(table) {
            return Some(shape.clone());
        }
        let current = shapes.get(&table.as_current())?;
        Some(retarget(current.clone(), *table))
    }
}

fn retarget(shape: IndexShapeDescription, id: IdAndVersion) -> IndexShapeDescription {
    match shape {
        IndexShapeDescription::PlainTable { .. } => IndexShapeDescription::PlainTable { table: id },
        IndexShapeDescription::View { scope, .. } => IndexShapeDescription::View { view: id, scope },
        IndexShapeDescription::MaterializedView {
            sources, defining_sql, ..
        } => IndexShapeDescription::MaterializedView {
            view: id,
            sources,
            defining_sql,
        },
        IndexShapeDescription::VirtualTable { defining_sql, .. } => IndexShapeDescription::VirtualTable {
            table: id,
            defining_sql,
        },
    }
}

#[async_trait]
impl TableCatalog for InMemoryTableCatalog {
    async fn exists(&self, table: &IdAndVersion) -> EngineResult<bool> {
        Ok(self.lookup(table).is_some())
    }

    async fn shape(&self, table: &IdAndVersion) -> EngineResult<IndexShapeDescription> {
        self.lookup(table)
            .ok_or_else(|| EngineError::not_found(format!("Table does not exist: {table}")))
    }
}
