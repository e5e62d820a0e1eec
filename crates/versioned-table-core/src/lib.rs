//! Core engine for a versioned tabular data store.
//!
//! This crate provides the foundational pieces for `versioned-table`:
//!
//! - Column-model management and schema diffing with size, facet and
//!   naming budgets (`schema` module).
//! - An append-only, monotonically versioned change log of ROW and COLUMN
//!   records, consumed through the [`changelog::ChangeLog`] trait, with
//!   in-memory and file-backed implementations (`changelog` module).
//! - An incremental index builder that reconciles a materialized index
//!   against the change log under an exclusive table lock (`index` module).
//! - A query translator that compiles the query dialect AST into backing
//!   SQL for plain tables, views, materialized views and virtual tables,
//!   including facets, count queries and row-level security filters
//!   (`query` module).
//! - A transactional update pipeline with lazy transaction ids, optimistic
//!   row-level conflict detection and snapshots (`transaction` module).
//! - A content-addressed query cache with TTL expiry and background
//!   refresh (`cache` module).
//!
//! External systems (authorization, locking, notification, the physical
//! index engine) are consumed through the traits in `collaborators`, each of
//! which ships an in-memory implementation for tests and embedding.
#![deny(missing_docs)]
pub mod cache;
pub mod changelog;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod index;
pub mod model;
pub mod query;
pub mod schema;
pub mod status;
pub mod storage;
pub mod transaction;

pub use error::{EngineError, EngineResult, ErrorClass};
