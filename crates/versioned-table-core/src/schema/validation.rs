//! Column-level validation rules: names, facets, JSON sub-columns and type changes.

use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};
use crate::model::{ColumnDefinition, ColumnModel, ColumnType, FacetType};

/// Maximum characters of a column name.
pub const MAX_COLUMN_NAME_CHARS: usize = 256;
/// Maximum characters of a sized string column.
pub const MAX_STRING_SIZE: u64 = 1000;
/// Maximum elements of a list column.
pub const MAX_LIST_LENGTH: u64 = 100;

/// Names reserved for engine bookkeeping columns (compared case-insensitively).
pub const RESERVED_COLUMN_NAMES: [&str; 7] = [
    "ROW_ID",
    "ROW_VERSION",
    "ROW_ETAG",
    "ROW_BENEFACTOR",
    "ROW_SEARCH_CONTENT",
    "ROW_HASH_CODE",
    "ROW_OBJECT_TYPE",
];

/// True when `name` is a reserved bookkeeping column name.
pub fn is_reserved_column_name(name: &str) -> bool {
    RESERVED_COLUMN_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name.trim()))
}

/// Reject empty, over-long and reserved names.
pub fn validate_column_name(name: &str) -> EngineResult<()> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid_argument("Column name is required"));
    }
    if name.chars().count() > MAX_COLUMN_NAME_CHARS {
        return Err(EngineError::invalid_argument(format!(
            "Column name must be: {MAX_COLUMN_NAME_CHARS} characters or less."
        )));
    }
    if is_reserved_column_name(name) {
        return Err(EngineError::invalid_argument(format!(
            "The column name: {name} is a system reserved column name."
        )));
    }
    Ok(())
}

fn facet_supported(facet: FacetType, column_type: ColumnType) -> bool {
    match facet {
        FacetType::Enumeration => column_type.supports_enumeration_facet(),
        FacetType::Range => column_type.supports_range_facet(),
    }
}

/// Check that the declared facet (if any) is allowed for the column type.
pub fn validate_facet_type(facet: Option<FacetType>, column_type: ColumnType) -> EngineResult<()> {
    match facet {
        Some(facet) if !facet_supported(facet, column_type) => {
            Err(EngineError::invalid_argument(format!(
                "Facet type: {facet} is not supported for column type: {column_type}"
            )))
        }
        _ => Ok(()),
    }
}

/// Validate the sub-columns of a JSON column.
///
/// Only JSON columns may declare sub-columns; each needs a `$`-rooted path,
/// a scalar type, a unique name and a facet allowed for its type.
pub fn validate_json_sub_columns(definition: &ColumnDefinition) -> EngineResult<()> {
    if definition.json_sub_columns.is_empty() {
        return Ok(());
    }
    if definition.column_type != ColumnType::Json {
        return Err(EngineError::invalid_argument(format!(
            "Only JSON columns may define sub-columns, found type: {}",
            definition.column_type
        )));
    }
    let mut names = HashSet::new();
    for sub in &definition.json_sub_columns {
        if !sub.json_path.starts_with('$') {
            return Err(EngineError::invalid_argument(format!(
                "The JSON path of sub-column '{}' must start with '$'",
                sub.name
            )));
        }
        if sub.column_type.is_list() || sub.column_type == ColumnType::Json {
            return Err(EngineError::invalid_argument(format!(
                "Sub-column '{}' must have a scalar type, found: {}",
                sub.name, sub.column_type
            )));
        }
        if !names.insert(sub.name.as_str()) {
            return Err(EngineError::invalid_argument(format!(
                "Duplicate sub-column name: '{}'",
                sub.name
            )));
        }
        validate_facet_type(sub.facet_type, sub.column_type)?;
    }
    Ok(())
}

/// Validate a definition before it is assigned an id.
pub fn validate_column_definition(definition: &ColumnDefinition) -> EngineResult<()> {
    validate_column_name(&definition.name)?;
    validate_facet_type(definition.facet_type, definition.column_type)?;
    validate_json_sub_columns(definition)?;

    if let Some(max_size) = definition.max_size {
        let string_like = definition.column_type.is_sized_string()
            || definition.column_type == ColumnType::StringList;
        if !string_like {
            return Err(EngineError::invalid_argument(format!(
                "Max size is not allowed for column type: {}",
                definition.column_type
            )));
        }
        if max_size == 0 || max_size > MAX_STRING_SIZE {
            return Err(EngineError::invalid_argument(format!(
                "ColumnModel.maxSize for a {} must be between 1 and {MAX_STRING_SIZE}",
                definition.column_type
            )));
        }
    }
    if let Some(max_len) = definition.max_list_length {
        if !definition.column_type.is_list() {
            return Err(EngineError::invalid_argument(format!(
                "Max list length is not allowed for column type: {}",
                definition.column_type
            )));
        }
        if max_len < 2 || max_len > MAX_LIST_LENGTH {
            return Err(EngineError::invalid_argument(format!(
                "ColumnModel.maxListLength must be between 2 and {MAX_LIST_LENGTH}"
            )));
        }
    }
    Ok(())
}

/// A column may not move between list and non-list, nor in or out of file handles.
pub fn validate_column_type_change(old: &ColumnModel, new: &ColumnModel) -> EngineResult<()> {
    let (from, to) = (old.column_type(), new.column_type());
    let file_handle_change = from.is_file_handle() != to.is_file_handle();
    let list_change = from.is_list() != to.is_list();
    if file_handle_change || list_change {
        return Err(EngineError::invalid_argument(format!(
            "A {from} column cannot be changed to {to}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JsonSubColumn;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn model(id: u64, t: ColumnType) -> ColumnModel {
        ColumnModel::new(id, ColumnDefinition::new(format!("c{id}"), t))
    }

    // ==================== Name tests ====================

    #[test]
    fn reserved_names_are_case_insensitive() {
        let err = validate_column_name("row_id").expect_err("reserved");
        assert_eq!(
            err.to_string(),
            "The column name: row_id is a system reserved column name."
        );
        assert!(validate_column_name("Row_Benefactor").is_err());
        assert!(validate_column_name("row_identifier").is_ok());
    }

    #[test]
    fn long_names_are_rejected() {
        assert!(validate_column_name(&"a".repeat(256)).is_ok());
        let err = validate_column_name(&"a".repeat(257)).expect_err("too long");
        assert_eq!(err.to_string(), "Column name must be: 256 characters or less.");
    }

    // ==================== Facet tests ====================

    #[test]
    fn facet_rules() {
        assert!(validate_facet_type(Some(FacetType::Range), ColumnType::Double).is_ok());
        assert!(validate_facet_type(Some(FacetType::Enumeration), ColumnType::StringList).is_ok());
        assert!(validate_facet_type(None, ColumnType::LargeText).is_ok());

        let err = validate_facet_type(Some(FacetType::Range), ColumnType::Boolean)
            .expect_err("range on boolean");
        assert_eq!(
            err.to_string(),
            "Facet type: range is not supported for column type: BOOLEAN"
        );
        assert!(validate_facet_type(Some(FacetType::Range), ColumnType::IntegerList).is_err());
        assert!(validate_facet_type(Some(FacetType::Range), ColumnType::Json).is_err());
        assert!(validate_facet_type(Some(FacetType::Enumeration), ColumnType::LargeText).is_err());
    }

    #[test]
    fn json_sub_columns_are_validated() -> TestResult {
        let sub = |name: &str, path: &str, t, facet| JsonSubColumn {
            name: name.to_string(),
            json_path: path.to_string(),
            column_type: t,
            facet_type: facet,
        };
        let ok = ColumnDefinition::new("j", ColumnType::Json).with_json_sub_columns(vec![
            sub("a", "$.a", ColumnType::Integer, Some(FacetType::Range)),
            sub("b", "$.b", ColumnType::String, Some(FacetType::Enumeration)),
        ]);
        validate_column_definition(&ok)?;

        let bad_path = ColumnDefinition::new("j", ColumnType::Json)
            .with_json_sub_columns(vec![sub("a", "a", ColumnType::Integer, None)]);
        assert!(validate_column_definition(&bad_path).is_err());

        let dup = ColumnDefinition::new("j", ColumnType::Json).with_json_sub_columns(vec![
            sub("a", "$.a", ColumnType::Integer, None),
            sub("a", "$.b", ColumnType::Integer, None),
        ]);
        assert!(validate_column_definition(&dup).is_err());

        let bad_facet = ColumnDefinition::new("j", ColumnType::Json)
            .with_json_sub_columns(vec![sub("a", "$.a", ColumnType::Boolean, Some(FacetType::Range))]);
        assert!(validate_column_definition(&bad_facet).is_err());

        let not_json = ColumnDefinition::new("s", ColumnType::String)
            .with_json_sub_columns(vec![sub("a", "$.a", ColumnType::Integer, None)]);
        assert!(validate_column_definition(&not_json).is_err());
        Ok(())
    }

    #[test]
    fn sizes_must_fit_type() {
        let too_big = ColumnDefinition::new("s", ColumnType::String).with_max_size(1001);
        assert!(validate_column_definition(&too_big).is_err());
        let on_int = ColumnDefinition::new("i", ColumnType::Integer).with_max_size(10);
        assert!(validate_column_definition(&on_int).is_err());
        let list = ColumnDefinition::new("l", ColumnType::IntegerList).with_max_list_length(101);
        assert!(validate_column_definition(&list).is_err());
    }

    // ==================== Type change tests ====================

    #[test]
    fn list_and_file_handle_boundaries_cannot_be_crossed() {
        let err = validate_column_type_change(
            &model(1, ColumnType::String),
            &model(2, ColumnType::StringList),
        )
        .expect_err("list change");
        assert_eq!(err.to_string(), "A STRING column cannot be changed to STRING_LIST");

        let err = validate_column_type_change(
            &model(1, ColumnType::FileHandleId),
            &model(2, ColumnType::Integer),
        )
        .expect_err("file handle change");
        assert_eq!(err.to_string(), "A FILEHANDLEID column cannot be changed to INTEGER");

        assert!(validate_column_type_change(
            &model(1, ColumnType::Integer),
            &model(2, ColumnType::String)
        )
        .is_ok());
        assert!(validate_column_type_change(
            &model(1, ColumnType::IntegerList),
            &model(2, ColumnType::StringList)
        )
        .is_ok());
    }
}
