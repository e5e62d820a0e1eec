//! Query translation and execution.
//!
//! - **AST** (`ast` module): the SELECT-only dialect and its rendering.
//! - **Resolution** (`shape` module): follows virtual tables down to the
//!   table that holds the rows.
//! - **Translation** (`translator` module): rewrites names to physical
//!   names, binds literals and inlines virtual table definitions.
//! - **Row-level security** (`security` module): benefactor filters for
//!   views and materialized views.
//! - **Counts and facets** (`count`, `facet` modules).
//! - **Execution** (`engine` module): [`QueryEngine`] ties the above
//!   together under a shared table lock.
pub mod ast;
pub mod count;
pub mod engine;
pub mod facet;
pub mod security;
pub mod shape;
pub mod translator;
#[cfg(test)]
pub(crate) mod test_util;

pub use ast::QuerySpec;
pub use engine::{NextPageToken, QueryBundle, QueryEngine, QueryOptions, QueryRequest, QueryRow};
pub use facet::{FacetColumnRequest, FacetColumnResult, FacetSelection, FacetValueCount};
pub use translator::{SelectColumn, TranslatedQuery, translate};
