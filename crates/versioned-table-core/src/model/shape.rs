//! Physical shapes an index can take behind a table id.
//!
//! The query translator resolves every table reference through an
//! [`IndexShapeDescription`]: plain tables are queried directly, views add a
//! row-level security filter, materialized views filter on one benefactor
//! column per source view, and virtual tables expand into common table
//! expressions over their defining query.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::identity::IdAndVersion;
use crate::query::ast::QuerySpec;

/// Kind of object a view replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewObjectType {
    /// Entities in a container hierarchy.
    Entity,
    /// Evaluation submissions.
    Submission,
}

/// Bit mask selecting the sub-types a view includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewTypeMask(pub u64);

impl ViewTypeMask {
    /// Files.
    pub const FILE: ViewTypeMask = ViewTypeMask(0x01);
    /// Projects.
    pub const PROJECT: ViewTypeMask = ViewTypeMask(0x02);
    /// Tables.
    pub const TABLE: ViewTypeMask = ViewTypeMask(0x04);
    /// Folders.
    pub const FOLDER: ViewTypeMask = ViewTypeMask(0x08);
    /// Views.
    pub const VIEW: ViewTypeMask = ViewTypeMask(0x10);
    /// Datasets.
    pub const DATASET: ViewTypeMask = ViewTypeMask(0x20);

    /// Union of two masks.
    pub fn with(self, other: ViewTypeMask) -> ViewTypeMask {
        ViewTypeMask(self.0 | other.0)
    }

    /// True when every bit of `other` is set.
    pub fn contains(self, other: ViewTypeMask) -> bool {
        self.0 & other.0 == other.0
    }
}

/// The containers and types whose objects populate a view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewScope {
    /// Kind of object replicated into the view.
    pub object_type: ViewObjectType,
    /// Container ids whose children are in scope.
    pub container_ids: BTreeSet<u64>,
    /// Sub-types included.
    pub type_mask: ViewTypeMask,
}

/// Physical layout behind a table id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexShapeDescription {
    /// Rows written through the change log; no row-level filter.
    PlainTable {
        /// The table.
        table: IdAndVersion,
    },
    /// Rows replicated from object metadata; filtered by `ROW_BENEFACTOR`.
    View {
        /// The view.
        view: IdAndVersion,
        /// What populates the view.
        scope: ViewScope,
    },
    /// Index built from a query over other shapes.
    MaterializedView {
        /// The materialized view.
        view: IdAndVersion,
        /// Tables and views its defining query reads.
        sources: Vec<IdAndVersion>,
        /// Defining query; its projection fills the view's columns in order.
        defining_sql: QuerySpec,
    },
    /// No index of its own; expands into a CTE over its defining query.
    VirtualTable {
        /// The virtual table.
        table: IdAndVersion,
        /// Defining query, written against another table id.
        defining_sql: QuerySpec,
    },
}

impl IndexShapeDescription {
    /// The table id this shape describes.
    pub fn id(&self) -> IdAndVersion {
        match self {
            IndexShapeDescription::PlainTable { table } => *table,
            IndexShapeDescription::View { view, .. } => *view,
            IndexShapeDescription::MaterializedView { view, .. } => *view,
            IndexShapeDescription::VirtualTable { table, .. } => *table,
        }
    }

    /// True when the shape has a physical index that must be built.
    pub fn has_physical_index(&self) -> bool {
        !matches!(self, IndexShapeDescription::VirtualTable { .. })
    }

    /// Benefactor column name a materialized view carries for a source view.
    pub fn benefactor_column_for_source(source: &IdAndVersion) -> String {
        format!("{}_{}", BENEFACTOR_COLUMN, source.index_table_name())
    }
}

/// Column holding the benefactor id of each view row.
pub const BENEFACTOR_COLUMN: &str = "ROW_BENEFACTOR";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_combine() {
        let mask = ViewTypeMask::FILE.with(ViewTypeMask::FOLDER);
        assert!(mask.contains(ViewTypeMask::FILE));
        assert!(!mask.contains(ViewTypeMask::TABLE));
    }

    #[test]
    fn materialized_benefactor_columns_are_per_source() {
        assert_eq!(
            IndexShapeDescription::benefactor_column_for_source(&IdAndVersion::versioned(7, 2)),
            "ROW_BENEFACTOR_T7_2"
        );
    }

    #[test]
    fn virtual_tables_have_no_physical_index() {
        let shape = IndexShapeDescription::VirtualTable {
            table: IdAndVersion::current(3),
            defining_sql: QuerySpec::select_star("syn1"),
        };
        assert!(!shape.has_physical_index());
        assert_eq!(shape.id(), IdAndVersion::current(3));
    }
}
