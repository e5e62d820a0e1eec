//! Seams to the systems the engine does not own.
//!
//! - [`LockService`]: table-scoped exclusive and shared leases with a
//!   caller supplied timeout.
//! - [`AuthorizationService`]: which benefactors and tables a user may see.
//! - [`Notifier`]: fire-and-forget events (cache hits, table state changes).
//! - [`IndexDriver`]: the physical index and query engine.
//! - [`TableCatalog`]: which objects exist and which shape backs each.
//!
//! Every seam has an in-memory implementation used by tests and by
//! embedders that do not need a real backend.
pub mod authorization;
pub mod catalog;
pub mod driver;
pub mod lock;
pub mod notify;

pub use authorization::{AuthorizationService, InMemoryAuthorizationService};
pub use catalog::{InMemoryTableCatalog, TableCatalog};
pub use driver::{BoundSql, InMemoryIndexDriver, IndexDriver, IndexMutation, IndexPlanEntry, ResultRow, RowSet};
pub use lock::{InMemoryLockService, LockLease, LockService, with_exclusive_lock, with_shared_lock};
pub use notify::{EngineEvent, LogNotifier, Notifier, RecordingNotifier};
