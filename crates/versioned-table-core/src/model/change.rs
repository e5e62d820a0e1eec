//! Change-log records and the sparse row representation.
//!
//! Each [`ChangeRecord`] is immutable once appended. ROW records carry a
//! [`SparseChangeSet`]: rows keyed by id with only the touched cells present
//! (an absent cell means "unchanged", a present `None` means "set to null").
//! COLUMN records carry the column diff and the resulting schema id order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::column::{ColumnChange, ColumnModel, ColumnType, parse_long};

/// Kind of a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Row inserts, updates and deletes.
    Row,
    /// Schema changes.
    Column,
}

/// Payload of a COLUMN change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// The diff that was applied.
    pub changes: Vec<ColumnChange>,
    /// Schema ids after the change, in order.
    pub new_schema_ids: Vec<u64>,
}

/// Payload of a change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangePayload {
    /// Row edits.
    Row(SparseChangeSet),
    /// Schema edits.
    Column(SchemaChange),
}

/// One immutable entry of the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Table the change belongs to.
    pub table_id: u64,
    /// Strictly increasing, gapless per table, starting at 0.
    pub change_number: u64,
    /// Opaque token identifying this version.
    pub etag: String,
    /// Time of append.
    pub created_on: DateTime<Utc>,
    /// User that appended the change.
    pub created_by: String,
    /// Logical transaction the change was appended under.
    pub transaction_id: Option<u64>,
    /// Change contents.
    pub payload: ChangePayload,
}

impl ChangeRecord {
    /// ROW or COLUMN.
    pub fn change_type(&self) -> ChangeType {
        match self.payload {
            ChangePayload::Row(_) => ChangeType::Row,
            ChangePayload::Column(_) => ChangeType::Column,
        }
    }

    /// Row ids touched by a ROW record; empty for COLUMN records.
    pub fn row_ids(&self) -> BTreeSet<u64> {
        match &self.payload {
            ChangePayload::Row(set) => set.row_ids(),
            ChangePayload::Column(_) => BTreeSet::new(),
        }
    }
}

/// One sparse row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SparseRow {
    /// Row id; `None` for an insert that still needs an id.
    pub row_id: Option<u64>,
    /// Version the row had when it was read (updates) or was written at.
    pub version_number: Option<u64>,
    /// Row etag, when the row tracks one.
    pub etag: Option<String>,
    /// Cells keyed by column id.
    pub values: BTreeMap<u64, Option<String>>,
    /// Explicit delete marker.
    #[serde(default)]
    pub deleted: bool,
}

impl SparseRow {
    /// A new row without an id.
    pub fn insert(values: impl IntoIterator<Item = (u64, Option<String>)>) -> Self {
        Self {
            values: values.into_iter().collect(),
            ..Self::default()
        }
    }

    /// An update of an existing row read at `version`.
    pub fn update(
        row_id: u64,
        version: u64,
        values: impl IntoIterator<Item = (u64, Option<String>)>,
    ) -> Self {
        Self {
            row_id: Some(row_id),
            version_number: Some(version),
            values: values.into_iter().collect(),
            ..Self::default()
        }
    }

    /// A delete of an existing row read at `version`.
    pub fn delete(row_id: u64, version: u64) -> Self {
        Self {
            row_id: Some(row_id),
            version_number: Some(version),
            deleted: true,
            ..Self::default()
        }
    }

    /// True when the row removes an existing row.
    pub fn is_delete(&self) -> bool {
        self.deleted
    }

    /// True when the row modifies an existing row (it has an id).
    pub fn is_update(&self) -> bool {
        self.row_id.is_some()
    }
}

/// Rows that share the same set of valid cells, written as one index mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowGroup {
    /// Columns every row in the group writes.
    pub columns: Vec<ColumnModel>,
    /// Rows of the group.
    pub rows: Vec<SparseRow>,
    /// `(row id, column id)` pairs dropped because the value failed validation.
    pub invalid_cells: Vec<(u64, u64)>,
}

/// A batch of row edits against a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseChangeSet {
    /// Table the rows belong to.
    pub table_id: u64,
    /// Schema the rows were written against.
    pub schema: Vec<ColumnModel>,
    /// Rows in write order.
    pub rows: Vec<SparseRow>,
}

impl SparseChangeSet {
    /// An empty change set for `table_id` and `schema`.
    pub fn new(table_id: u64, schema: Vec<ColumnModel>) -> Self {
        Self {
            table_id,
            schema,
            rows: Vec::new(),
        }
    }

    /// Append a row.
    pub fn add_row(&mut self, row: SparseRow) {
        self.rows.push(row);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Ids of all rows that have one.
    pub fn row_ids(&self) -> BTreeSet<u64> {
        self.rows.iter().filter_map(|r| r.row_id).collect()
    }

    /// Ids of the schema columns, in order.
    pub fn schema_ids(&self) -> Vec<u64> {
        self.schema.iter().map(|c| c.id).collect()
    }

    /// Group non-deleted rows by the set of columns holding valid values.
    ///
    /// A cell that fails validation is left out of its row's column set, so
    /// the row is still written (without that cell) and the pair is reported
    /// in [`RowGroup::invalid_cells`]. Deletes form their own group with no
    /// columns. Groups are returned in first-seen order.
    pub fn group_by_valid_values(&self, default_max_string_size: u64) -> Vec<RowGroup> {
        let mut order: Vec<Vec<u64>> = Vec::new();
        let mut groups: BTreeMap<Vec<u64>, RowGroup> = BTreeMap::new();
        let mut deletes: Vec<SparseRow> = Vec::new();

        for row in &self.rows {
            if row.is_delete() {
                deletes.push(row.clone());
                continue;
            }
            let mut key = Vec::new();
            let mut kept = row.clone();
            let mut invalid = Vec::new();
            for column in &self.schema {
                let Some(cell) = row.values.get(&column.id) else {
                    continue;
                };
                let valid = match cell {
                    None => true,
                    Some(value) => column.is_valid_value(value, default_max_string_size),
                };
                if valid {
                    key.push(column.id);
                } else {
                    kept.values.remove(&column.id);
                    invalid.push((row.row_id.unwrap_or_default(), column.id));
                }
            }
            let group = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                RowGroup {
                    columns: self
                        .schema
                        .iter()
                        .filter(|c| key.contains(&c.id))
                        .cloned()
                        .collect(),
                    rows: Vec::new(),
                    invalid_cells: Vec::new(),
                }
            });
            group.rows.push(kept);
            group.invalid_cells.extend(invalid);
        }

        let mut result: Vec<RowGroup> = order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .collect();
        if !deletes.is_empty() {
            result.push(RowGroup {
                columns: Vec::new(),
                rows: deletes,
                invalid_cells: Vec::new(),
            });
        }
        result
    }

    /// File-handle ids referenced by any valid file-handle cell.
    pub fn file_handle_ids(&self) -> BTreeSet<u64> {
        let columns: Vec<u64> = self
            .schema
            .iter()
            .filter(|c| c.column_type() == ColumnType::FileHandleId)
            .map(|c| c.id)
            .collect();
        self.rows
            .iter()
            .flat_map(|row| columns.iter().filter_map(|id| row.values.get(id)))
            .filter_map(|cell| cell.as_deref().and_then(parse_long))
            .filter_map(|id| u64::try_from(id).ok())
            .collect()
    }
}
