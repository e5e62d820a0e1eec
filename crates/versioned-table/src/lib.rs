//! # versioned-table
//!
//! Versioned tabular data engine: evolving column schemas, an append-only
//! change log, incrementally built indices and a query dialect compiled to
//! backing SQL.
//!
//! This crate is the supported public entry point and provides a small, stable surface.
//!
//! ## Example
//!
//! ```rust,ignore
//! use versioned_table::prelude::*;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// In-memory collaborators for tests and embedding.
pub mod memory {
    pub use versioned_table_core::changelog::InMemoryChangeLog;
    pub use versioned_table_core::collaborators::{
        InMemoryAuthorizationService, InMemoryIndexDriver, InMemoryLockService, InMemoryTableCatalog,
        RecordingNotifier,
    };
    pub use versioned_table_core::cache::InMemoryCacheStore;
    pub use versioned_table_core::schema::InMemoryColumnModelStore;
    pub use versioned_table_core::status::InMemoryTableStatusStore;
}

/// Traits an embedder implements to plug in real backends.
pub mod collaborators {
    pub use versioned_table_core::cache::CacheStore;
    pub use versioned_table_core::changelog::ChangeLog;
    pub use versioned_table_core::collaborators::{
        AuthorizationService, IndexDriver, LockService, LogNotifier, Notifier, TableCatalog,
    };
    pub use versioned_table_core::schema::ColumnModelStore;
    pub use versioned_table_core::status::TableStatusStore;
}

pub use versioned_table_core::cache::{QueryCache, RefreshWorker};
pub use versioned_table_core::changelog::FileChangeLog;
pub use versioned_table_core::config::{EngineConfig, StackStatus};
pub use versioned_table_core::index::{IndexBuilder, NoopProgress, ProgressReporter};
pub use versioned_table_core::model::{
    ColumnChange, ColumnDefinition, ColumnModel, ColumnType, FacetType, IdAndVersion, IndexShapeDescription,
    SparseRow, TableState, TableStatus,
};
pub use versioned_table_core::query::{
    FacetColumnRequest, FacetColumnResult, NextPageToken, QueryBundle, QueryEngine, QueryOptions, QueryRequest,
    QueryRow, QuerySpec,
};
pub use versioned_table_core::schema::SchemaManager;
pub use versioned_table_core::status::TableManagerSupport;
pub use versioned_table_core::transaction::{
    AppendRowsRequest, RowReference, RowReferenceSet, TableSchemaChangeRequest, TableUpdateRequest,
    TableUpdateResponse, TableUpdateTransactionRequest, TableUpdateTransactionResponse, TransactionManager,
};
pub use versioned_table_core::{EngineError, EngineResult, ErrorClass};
