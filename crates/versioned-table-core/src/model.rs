//! Data model shared by every engine component.
//!
//! - [`IdAndVersion`] identifies a table or view and an optional snapshot.
//! - [`ColumnModel`] and [`ColumnChange`] describe schemas and their diffs.
//! - [`ChangeRecord`] and [`SparseChangeSet`] are the immutable entries of
//!   the change log.
//! - [`TableStatus`] is the single source of truth for whether a table's
//!   index can be queried.
//! - [`IndexShapeDescription`] tells the query translator which physical
//!   layout sits behind a table id.
pub mod change;
pub mod column;
pub mod identity;
pub mod shape;
pub mod status;

pub use change::{ChangePayload, ChangeRecord, ChangeType, RowGroup, SchemaChange, SparseChangeSet, SparseRow};
pub use column::{
    ColumnChange, ColumnChangeDetails, ColumnChangeKind, ColumnDefinition, ColumnModel, ColumnType,
    DatabaseColumnInfo, FacetType, JsonSubColumn,
};
pub use identity::IdAndVersion;
pub use shape::{IndexShapeDescription, ViewObjectType, ViewScope, ViewTypeMask};
pub use status::{TableState, TableStatus};
