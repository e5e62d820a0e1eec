//! Column models, column diffs and the physical column description.
//!
//! A [`ColumnModel`] is created once and never mutated: changing the type or
//! size of a column always produces a new id, and schemas evolve by swapping
//! ids through [`ColumnChange`]s.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Prefix of physical column names (`_C<id>_`).
pub const COLUMN_PREFIX: &str = "_C";
/// Suffix of physical column names (`_C<id>_`).
pub const COLUMN_POSTFIX: &str = "_";

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    /// Bounded UTF-8 string.
    String,
    /// 64-bit float.
    Double,
    /// 64-bit signed integer.
    Integer,
    /// true / false.
    Boolean,
    /// Milliseconds since the epoch.
    Date,
    /// Id of a stored file handle.
    #[serde(rename = "FILEHANDLEID")]
    FileHandleId,
    /// Id of an entity.
    #[serde(rename = "ENTITYID")]
    EntityId,
    /// Id of an evaluation submission.
    #[serde(rename = "SUBMISSIONID")]
    SubmissionId,
    /// Id of an evaluation.
    #[serde(rename = "EVALUATIONID")]
    EvaluationId,
    /// Bounded URL string.
    Link,
    /// Text up to a few kilobytes.
    #[serde(rename = "MEDIUMTEXT")]
    MediumText,
    /// Unbounded text stored outside the row.
    #[serde(rename = "LARGETEXT")]
    LargeText,
    /// Id of a user or team.
    #[serde(rename = "USERID")]
    UserId,
    /// JSON document with optional typed sub-columns.
    Json,
    /// List of strings.
    StringList,
    /// List of integers.
    IntegerList,
    /// List of booleans.
    BooleanList,
    /// List of dates.
    DateList,
    /// List of entity ids.
    #[serde(rename = "ENTITYID_LIST")]
    EntityIdList,
    /// List of user ids.
    #[serde(rename = "USERID_LIST")]
    UserIdList,
}

impl ColumnType {
    /// True for every `*_LIST` type.
    pub fn is_list(self) -> bool {
        self.element_type().is_some()
    }

    /// Scalar element type of a list type.
    pub fn element_type(self) -> Option<ColumnType> {
        match self {
            ColumnType::StringList => Some(ColumnType::String),
            ColumnType::IntegerList => Some(ColumnType::Integer),
            ColumnType::BooleanList => Some(ColumnType::Boolean),
            ColumnType::DateList => Some(ColumnType::Date),
            ColumnType::EntityIdList => Some(ColumnType::EntityId),
            ColumnType::UserIdList => Some(ColumnType::UserId),
            _ => None,
        }
    }

    /// True for file-handle references.
    pub fn is_file_handle(self) -> bool {
        self == ColumnType::FileHandleId
    }

    /// True for bounded string types whose width is driven by `max_size`.
    pub fn is_sized_string(self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Link)
    }

    /// Whether a range facet (min/max) may be declared on this type.
    pub fn supports_range_facet(self) -> bool {
        matches!(
            self,
            ColumnType::Integer | ColumnType::Double | ColumnType::Date
        )
    }

    /// Whether an enumeration facet (value counts) may be declared on this type.
    pub fn supports_enumeration_facet(self) -> bool {
        self.is_list()
            || matches!(
                self,
                ColumnType::String
                    | ColumnType::Boolean
                    | ColumnType::Integer
                    | ColumnType::Date
                    | ColumnType::EntityId
                    | ColumnType::UserId
                    | ColumnType::SubmissionId
                    | ColumnType::EvaluationId
            )
    }

    /// Check that `value` is a well-formed scalar of this type.
    ///
    /// Lists, JSON and size limits are checked by [`ColumnModel::is_valid_value`].
    fn is_valid_scalar(self, value: &str) -> bool {
        match self {
            ColumnType::Integer
            | ColumnType::Date
            | ColumnType::FileHandleId
            | ColumnType::EntityId
            | ColumnType::SubmissionId
            | ColumnType::EvaluationId
            | ColumnType::UserId => parse_long(value).is_some(),
            ColumnType::Double => {
                value.parse::<f64>().is_ok()
                    || matches!(value, "NaN" | "Infinity" | "-Infinity" | "+Infinity")
            }
            ColumnType::Boolean => {
                value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false")
            }
            _ => true,
        }
    }
}

/// Parse an integer-like cell, accepting the `syn` prefix used by entity ids.
pub fn parse_long(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    let body = match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("syn") => &trimmed[3..],
        _ => trimmed,
    };
    let body = body.split('.').next().unwrap_or(body);
    body.parse::<i64>().ok()
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::String => "STRING",
            ColumnType::Double => "DOUBLE",
            ColumnType::Integer => "INTEGER",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::FileHandleId => "FILEHANDLEID",
            ColumnType::EntityId => "ENTITYID",
            ColumnType::SubmissionId => "SUBMISSIONID",
            ColumnType::EvaluationId => "EVALUATIONID",
            ColumnType::Link => "LINK",
            ColumnType::MediumText => "MEDIUMTEXT",
            ColumnType::LargeText => "LARGETEXT",
            ColumnType::UserId => "USERID",
            ColumnType::Json => "JSON",
            ColumnType::StringList => "STRING_LIST",
            ColumnType::IntegerList => "INTEGER_LIST",
            ColumnType::BooleanList => "BOOLEAN_LIST",
            ColumnType::DateList => "DATE_LIST",
            ColumnType::EntityIdList => "ENTITYID_LIST",
            ColumnType::UserIdList => "USERID_LIST",
        };
        f.write_str(s)
    }
}

/// Aggregation a column exposes in query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FacetType {
    /// Distinct values with their frequencies.
    Enumeration,
    /// Minimum and maximum.
    Range,
}

impl fmt::Display for FacetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacetType::Enumeration => f.write_str("enumeration"),
            FacetType::Range => f.write_str("range"),
        }
    }
}

/// A typed projection of a path inside a JSON column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JsonSubColumn {
    /// Display name of the sub-column.
    pub name: String,
    /// JSON path, for example `$.a.b`.
    pub json_path: String,
    /// Scalar type of the extracted value.
    pub column_type: ColumnType,
    /// Optional facet on the extracted value.
    pub facet_type: Option<FacetType>,
}

/// User supplied definition of a column, without an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name, unique within a schema.
    pub name: String,
    /// Logical type.
    pub column_type: ColumnType,
    /// Maximum characters for sized string types.
    pub max_size: Option<u64>,
    /// Maximum number of elements for list types.
    pub max_list_length: Option<u64>,
    /// Declared facet.
    pub facet_type: Option<FacetType>,
    /// Default cell value.
    pub default_value: Option<String>,
    /// Sub-columns of a JSON column, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_sub_columns: Vec<JsonSubColumn>,
}

impl ColumnDefinition {
    /// A bare column of the given name and type.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            max_size: None,
            max_list_length: None,
            facet_type: None,
            default_value: None,
            json_sub_columns: Vec::new(),
        }
    }

    /// Set the maximum string size.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Set the maximum list length.
    pub fn with_max_list_length(mut self, max_list_length: u64) -> Self {
        self.max_list_length = Some(max_list_length);
        self
    }

    /// Declare a facet.
    pub fn with_facet(mut self, facet_type: FacetType) -> Self {
        self.facet_type = Some(facet_type);
        self
    }

    /// Attach JSON sub-columns.
    pub fn with_json_sub_columns(mut self, sub_columns: Vec<JsonSubColumn>) -> Self {
        self.json_sub_columns = sub_columns;
        self
    }
}

/// A column definition with its assigned, immutable id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnModel {
    /// Assigned id.
    pub id: u64,
    /// The definition the id was assigned to.
    #[serde(flatten)]
    pub definition: ColumnDefinition,
}

impl ColumnModel {
    /// Pair an id with a definition.
    pub fn new(id: u64, definition: ColumnDefinition) -> Self {
        Self { id, definition }
    }

    /// Column name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Logical type.
    pub fn column_type(&self) -> ColumnType {
        self.definition.column_type
    }

    /// Declared facet.
    pub fn facet_type(&self) -> Option<FacetType> {
        self.definition.facet_type
    }

    /// Physical column name, `_C<id>_`.
    pub fn physical_name(&self) -> String {
        physical_column_name(self.id)
    }

    /// Check a cell value against the type, size and list-length limits.
    pub fn is_valid_value(&self, value: &str, default_max_string_size: u64) -> bool {
        let column_type = self.column_type();
        if column_type.is_sized_string() {
            let max = self.definition.max_size.unwrap_or(default_max_string_size);
            return value.chars().count() as u64 <= max;
        }
        if column_type == ColumnType::Json {
            return serde_json::from_str::<serde_json::Value>(value).is_ok();
        }
        if let Some(element) = column_type.element_type() {
            let Ok(serde_json::Value::Array(items)) = serde_json::from_str(value) else {
                return false;
            };
            if let Some(max_len) = self.definition.max_list_length {
                if items.len() as u64 > max_len {
                    return false;
                }
            }
            return items.iter().all(|item| match item {
                serde_json::Value::String(s) => {
                    element.is_valid_scalar(s)
                        && (element != ColumnType::String
                            || s.chars().count() as u64
                                <= self.definition.max_size.unwrap_or(default_max_string_size))
                }
                serde_json::Value::Number(n) => element.is_valid_scalar(&n.to_string()),
                serde_json::Value::Bool(_) => element == ColumnType::Boolean,
                _ => false,
            });
        }
        column_type.is_valid_scalar(value)
    }
}

/// Physical column name for a column id.
pub fn physical_column_name(id: u64) -> String {
    format!("{COLUMN_PREFIX}{id}{COLUMN_POSTFIX}")
}

/// Column of a list index table referring back to the owning row.
pub fn row_id_ref_column_name(id: u64) -> String {
    format!("ROW_ID_REF{COLUMN_PREFIX}{id}{COLUMN_POSTFIX}")
}

/// Column of a list index table holding one unnested element.
pub fn unnest_column_name(id: u64) -> String {
    format!("{}_UNNEST", physical_column_name(id))
}

/// Parse the column id out of a physical `_C<id>_` name.
pub fn parse_physical_column_name(name: &str) -> Option<u64> {
    name.strip_prefix(COLUMN_PREFIX)?
        .strip_suffix(COLUMN_POSTFIX)?
        .parse()
        .ok()
}

/// One schema diff unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnChange {
    /// Column being removed or replaced.
    pub old_column_id: Option<u64>,
    /// Column being added or replacing `old_column_id`.
    pub new_column_id: Option<u64>,
}

/// Interpretation of a [`ColumnChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnChangeKind {
    /// Append a column.
    Add(u64),
    /// Drop a column.
    Remove(u64),
    /// Replace a column in place.
    Update {
        /// Replaced id.
        old: u64,
        /// Replacement id.
        new: u64,
    },
}

impl ColumnChange {
    /// Add `id`.
    pub fn add(id: u64) -> Self {
        Self {
            old_column_id: None,
            new_column_id: Some(id),
        }
    }

    /// Remove `id`.
    pub fn remove(id: u64) -> Self {
        Self {
            old_column_id: Some(id),
            new_column_id: None,
        }
    }

    /// Replace `old` with `new`.
    pub fn update(old: u64, new: u64) -> Self {
        Self {
            old_column_id: Some(old),
            new_column_id: Some(new),
        }
    }

    /// Classify this change; both sides empty is invalid.
    pub fn kind(&self) -> EngineResult<ColumnChangeKind> {
        match (self.old_column_id, self.new_column_id) {
            (None, None) => Err(EngineError::invalid_argument(
                "A column change must have an old column id, a new column id, or both",
            )),
            (None, Some(new)) => Ok(ColumnChangeKind::Add(new)),
            (Some(old), None) => Ok(ColumnChangeKind::Remove(old)),
            (Some(old), Some(new)) => Ok(ColumnChangeKind::Update { old, new }),
        }
    }

    /// True for an update that actually swaps one id for another.
    pub fn is_real_update(&self) -> bool {
        matches!((self.old_column_id, self.new_column_id), (Some(o), Some(n)) if o != n)
    }
}

/// What exists in the physical index for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseColumnInfo {
    /// Physical column name.
    pub column_name: String,
    /// Logical type the column was created for, when known.
    pub column_type: Option<ColumnType>,
    /// Physical maximum size, when bounded.
    pub max_size: Option<u64>,
    /// Whether a secondary index exists on the column.
    pub has_index: bool,
    /// Name of that secondary index.
    pub index_name: Option<String>,
    /// Approximate number of distinct values.
    pub cardinality: u64,
}

impl DatabaseColumnInfo {
    /// Describe a freshly created column for `model`.
    pub fn for_model(model: &ColumnModel) -> Self {
        Self {
            column_name: model.physical_name(),
            column_type: Some(model.column_type()),
            max_size: model.definition.max_size,
            has_index: false,
            index_name: None,
            cardinality: 0,
        }
    }

    /// Column id encoded in the physical name, if it is a user column.
    pub fn column_id(&self) -> Option<u64> {
        parse_physical_column_name(&self.column_name)
    }
}

/// Everything needed to alter one physical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnChangeDetails {
    /// Column being replaced or dropped.
    pub old_column: Option<ColumnModel>,
    /// Physical description of the old column.
    pub old_column_info: Option<DatabaseColumnInfo>,
    /// Column being added or replacing the old one.
    pub new_column: Option<ColumnModel>,
}

impl ColumnChangeDetails {
    /// Build details for a pure add.
    pub fn add(new_column: ColumnModel) -> Self {
        Self {
            old_column: None,
            old_column_info: None,
            new_column: Some(new_column),
        }
    }

    /// True when the old and new models are identical (nothing to alter).
    pub fn is_no_op(&self) -> bool {
        match (&self.old_column, &self.new_column) {
            (Some(old), Some(new)) => old == new,
            _ => false,
        }
    }
}
