//! Incremental index builder.
//!
//! [`IndexBuilder`] reconciles a table's materialized index with the
//! change log:
//!
//! - **Apply** (`apply` module): ROW records are grouped by valid values and
//!   written one write transaction per group; COLUMN records alter the
//!   physical schema and the unnest tables of list columns.
//! - **Build** (`build` module): walks the log from the last applied change
//!   under an exclusive table lock, never re-applying a change, then forces
//!   the schema, records the checksum, optimizes secondary indices and
//!   marks the table `AVAILABLE`. Unclassified failures mark the table
//!   `PROCESSING_FAILED`; lock, availability, interruption and I/O
//!   failures surface as a single recoverable error.
//! - **Replication** (`replication` module): populates view indices from
//!   replicated object metadata.
//! - **Materialized views** (`materialized` module): fill the index from
//!   the translated defining query, with one benefactor column per source
//!   view.
//! - **Temporary copies** (`temp` module): validate schema changes against a
//!   copy of the index before they are committed.
pub mod apply;
pub mod build;
pub mod materialized;
pub mod optimize;
pub mod progress;
pub mod replication;
pub mod state;
pub mod temp;
#[cfg(test)]
pub(crate) mod test_util;

use std::sync::Arc;

use crate::collaborators::{IndexDriver, LockService};
use crate::config::EngineConfig;
use crate::schema::SchemaManager;
use crate::status::TableManagerSupport;

pub use build::BuildOutcome;
pub use optimize::plan_index_changes;
pub use progress::{BuildProgress, CancellableProgress, NoopProgress, ProgressReporter};
pub use state::{BuildStateTracker, IndexBuildState};

/// Number of file handle ids applied per driver call.
pub const FILE_HANDLE_BATCH_SIZE: usize = 10_000;

/// Builds and maintains materialized indices.
#[derive(Clone)]
pub struct IndexBuilder {
    support: TableManagerSupport,
    driver: Arc<dyn IndexDriver>,
    locks: Arc<dyn LockService>,
    config: Arc<EngineConfig>,
}

impl IndexBuilder {
    /// Wire a builder over its collaborators.
    pub fn new(
        support: TableManagerSupport,
        driver: Arc<dyn IndexDriver>,
        locks: Arc<dyn LockService>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            support,
            driver,
            locks,
            config,
        }
    }

    /// Status support in use.
    pub fn support(&self) -> &TableManagerSupport {
        &self.support
    }

    /// Driver in use.
    pub fn driver(&self) -> &Arc<dyn IndexDriver> {
        &self.driver
    }

    fn schema(&self) -> &SchemaManager {
        self.support.schema_manager()
    }
}
