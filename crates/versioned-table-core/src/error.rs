//! Error taxonomy shared by every engine component.
//!
//! This module centralizes the [`EngineError`] enum and exposes its context
//! selectors (via `#[snafu(visibility(pub(crate)))]`) so sibling modules can
//! raise errors without re-exporting everything at the crate root.
//!
//! Variants map one-to-one onto the way a caller must react:
//!
//! - **User facing** (`InvalidArgument`, `NotFound`, `ConflictingUpdate`,
//!   `Unauthorized`, `TableUnavailable`, `TableFailed`, `ReadOnly`): surfaced
//!   to the caller and never retried by the engine.
//! - **Retryable** (`LockUnavailable`, `Interrupted`, `Io`,
//!   `InvalidStatusToken`, `Recoverable`): the surrounding scheduler should
//!   requeue the work.
//! - **Terminal** (everything else): during an index build these move the
//!   table to `PROCESSING_FAILED` instead of crashing the worker.

use snafu::{Backtrace, prelude::*};

use crate::config::StackStatus;
use crate::model::{IdAndVersion, TableStatus};
use crate::storage::StorageError;

/// General result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// How a caller is expected to react to an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Report to the user; retrying the same request cannot succeed.
    UserFacing,
    /// Transient condition; requeue and try again later.
    Retryable,
    /// Unclassified failure; the affected table is marked as failed.
    Terminal,
}

/// Errors raised by engine operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// Schema, size, name, type or request validation failure.
    #[snafu(display("{message}"))]
    InvalidArgument {
        /// Human readable description of the violated rule.
        message: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A referenced column, row, table or change does not exist.
    #[snafu(display("{message}"))]
    NotFound {
        /// Description of what could not be found.
        message: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Optimistic concurrency conflict against the change log.
    #[snafu(display("{message}"))]
    ConflictingUpdate {
        /// Description of the conflicting row or version.
        message: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The caller lacks permission for the requested operation.
    #[snafu(display("{message}"))]
    Unauthorized {
        /// Description of the denied permission.
        message: String,
    },

    /// The index of a table is still being built.
    #[snafu(display("Table {table} is not available yet: {}", status.state))]
    TableUnavailable {
        /// The table that was queried.
        table: IdAndVersion,
        /// Status of the table at the time of the request.
        status: Box<TableStatus>,
    },

    /// The index of a table failed to build and cannot be queried.
    #[snafu(display(
        "Table {table} failed to build: {}",
        status.error_message.as_deref().unwrap_or("unknown error")
    ))]
    TableFailed {
        /// The table that was queried.
        table: IdAndVersion,
        /// Status of the table at the time of the request.
        status: Box<TableStatus>,
    },

    /// A lock could not be acquired within the caller supplied timeout.
    #[snafu(display("Lock unavailable for {key}"))]
    LockUnavailable {
        /// The lock key that timed out.
        key: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Work was cancelled cooperatively between change groups.
    #[snafu(display("Interrupted: {message}"))]
    Interrupted {
        /// Description of where the interruption was observed.
        message: String,
    },

    /// Transient I/O failure talking to an external collaborator.
    #[snafu(display("I/O failure: {message}"))]
    Io {
        /// Description of the failed interaction.
        message: String,
    },

    /// The reset token used to finish a build no longer matches the table status.
    #[snafu(display("Reset token {token} is stale for table {table}"))]
    InvalidStatusToken {
        /// The table whose status moved on.
        table: IdAndVersion,
        /// The stale token.
        token: String,
    },

    /// Folded retry signal produced by the index builder.
    #[snafu(display("Recoverable failure: {reason}"))]
    Recoverable {
        /// Display text of the error that was folded.
        reason: String,
    },

    /// Writes are blocked while the stack is in maintenance mode.
    #[snafu(display(
        "Write operations are not allowed while the stack status is set to: {stack_status}"
    ))]
    ReadOnly {
        /// The current stack status.
        stack_status: StackStatus,
    },

    /// Unclassified failure reported by the physical index driver.
    #[snafu(display("Index driver failure: {message}"))]
    Driver {
        /// Description of the failed statement.
        message: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Local storage failure in the file-backed change log.
    ///
    /// Backtraces are delegated to the inner StorageError.
    #[snafu(display("Storage error while accessing change log: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// JSON (de)serialization failure.
    #[snafu(display("Failed to serialize {what}: {source}"))]
    Serialization {
        /// What was being serialized or parsed.
        what: String,
        /// Underlying serde_json error.
        source: serde_json::Error,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Persisted state is malformed or violates an engine invariant.
    #[snafu(display("Corrupt state: {msg}"))]
    CorruptState {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

impl EngineError {
    /// Classify this error for the caller.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidArgument { .. }
            | EngineError::NotFound { .. }
            | EngineError::ConflictingUpdate { .. }
            | EngineError::Unauthorized { .. }
            | EngineError::TableUnavailable { .. }
            | EngineError::TableFailed { .. }
            | EngineError::ReadOnly { .. } => ErrorClass::UserFacing,
            EngineError::LockUnavailable { .. }
            | EngineError::Interrupted { .. }
            | EngineError::Io { .. }
            | EngineError::InvalidStatusToken { .. }
            | EngineError::Recoverable { .. } => ErrorClass::Retryable,
            EngineError::Driver { .. }
            | EngineError::Storage { .. }
            | EngineError::Serialization { .. }
            | EngineError::CorruptState { .. } => ErrorClass::Terminal,
        }
    }

    /// True when this error is (or folds into) a [`EngineError::Recoverable`] signal
    /// during an index build.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::LockUnavailable { .. }
                | EngineError::TableUnavailable { .. }
                | EngineError::Interrupted { .. }
                | EngineError::Io { .. }
                | EngineError::InvalidStatusToken { .. }
                | EngineError::Recoverable { .. }
        )
    }

    /// Fold lock, availability, interruption and I/O failures into a single
    /// [`EngineError::Recoverable`]; any other error is returned unchanged.
    pub fn into_recoverable(self) -> EngineError {
        if self.is_recoverable() && !matches!(self, EngineError::Recoverable { .. }) {
            EngineError::Recoverable {
                reason: self.to_string(),
            }
        } else {
            self
        }
    }

    /// Build an [`EngineError::InvalidArgument`] from a message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        InvalidArgumentSnafu {
            message: message.into(),
        }
        .build()
    }

    /// Build an [`EngineError::NotFound`] from a message.
    pub fn not_found(message: impl Into<String>) -> Self {
        NotFoundSnafu {
            message: message.into(),
        }
        .build()
    }

    /// Build an [`EngineError::Driver`] from a message.
    pub fn driver(message: impl Into<String>) -> Self {
        DriverSnafu {
            message: message.into(),
        }
        .build()
    }
}
