//! Wrapper prelude.
//!
//! The `versioned-table` crate is the supported public entry point.
//! Downstream code should prefer importing from this prelude instead of
//! depending on internal core module paths.

pub use crate::collaborators;
pub use crate::memory;
pub use crate::{
    AppendRowsRequest, ColumnChange, ColumnDefinition, ColumnModel, ColumnType, EngineConfig, EngineError,
    EngineResult, FacetColumnRequest, FacetColumnResult, IdAndVersion, IndexBuilder, QueryBundle, QueryEngine,
    QueryOptions, QueryRequest, QueryRow, QuerySpec, SchemaManager, SparseRow, TableManagerSupport,
    TableSchemaChangeRequest, TableUpdateRequest, TableUpdateResponse, TableUpdateTransactionRequest,
    TransactionManager,
};
