//! Row-size and column-count budgets.
//!
//! Every column contributes a conservative worst-case byte weight: fixed
//! widths are the length of the value rendered as a string, sized strings
//! count four bytes per character, large text counts the in-row estimate
//! and lists multiply their element weight by the maximum list length. The
//! estimate intentionally overshoots real storage.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{ColumnModel, ColumnType};

/// Worst-case bytes per UTF-8 character.
pub const MAX_BYTES_PER_CHAR_UTF8: u64 = 4;
/// Weight of a boolean rendered as text (`false`).
pub const BOOLEAN_BYTES: u64 = 5;
/// Weight of a 64-bit integer rendered as text.
pub const INTEGER_BYTES: u64 = 20;
/// Weight of a double rendered as text.
pub const DOUBLE_BYTES: u64 = 23;
/// Weight of an entity id rendered as text (`syn<id>.<version>`).
pub const ENTITY_ID_BYTES: u64 = 44;
/// Characters assumed for a medium text cell.
pub const MEDIUM_TEXT_CHARS: u64 = 2000;
/// In-row estimate of a large text or JSON cell.
pub const LARGE_TEXT_ESTIMATE_BYTES: u64 = 3000;
/// List length assumed when a list column declares none.
pub const DEFAULT_MAX_LIST_LENGTH: u64 = 100;
/// String element size assumed for string lists that declare none.
pub const DEFAULT_LIST_STRING_SIZE: u64 = 50;

fn scalar_weight(column_type: ColumnType, max_size: u64) -> u64 {
    match column_type {
        ColumnType::String | ColumnType::Link => MAX_BYTES_PER_CHAR_UTF8 * max_size,
        ColumnType::Boolean => BOOLEAN_BYTES,
        ColumnType::Integer
        | ColumnType::Date
        | ColumnType::FileHandleId
        | ColumnType::SubmissionId
        | ColumnType::EvaluationId
        | ColumnType::UserId => INTEGER_BYTES,
        ColumnType::EntityId => ENTITY_ID_BYTES,
        ColumnType::Double => DOUBLE_BYTES,
        ColumnType::MediumText => MAX_BYTES_PER_CHAR_UTF8 * MEDIUM_TEXT_CHARS,
        ColumnType::LargeText | ColumnType::Json => LARGE_TEXT_ESTIMATE_BYTES,
        // Lists are handled by the caller.
        _ => 0,
    }
}

/// Worst-case bytes a single cell of `column` can take.
pub fn max_size_for_column(column: &ColumnModel, default_max_string_size: u64) -> u64 {
    let definition = &column.definition;
    match column.column_type().element_type() {
        Some(element) => {
            let element_size = definition.max_size.unwrap_or(DEFAULT_LIST_STRING_SIZE);
            let length = definition.max_list_length.unwrap_or(DEFAULT_MAX_LIST_LENGTH);
            length * scalar_weight(element, element_size)
        }
        None => scalar_weight(
            column.column_type(),
            definition.max_size.unwrap_or(default_max_string_size),
        ),
    }
}

/// Worst-case bytes of a row of `columns`.
pub fn max_row_size(columns: &[ColumnModel], default_max_string_size: u64) -> u64 {
    columns
        .iter()
        .map(|c| max_size_for_column(c, default_max_string_size))
        .sum()
}

/// Enforce the column-count, row-size and large-text budgets.
pub fn validate_size(columns: &[ColumnModel], config: &EngineConfig) -> EngineResult<()> {
    if columns.len() > config.max_columns_per_table {
        return Err(EngineError::invalid_argument(format!(
            "Too many columns. The limit is {} columns per table",
            config.max_columns_per_table
        )));
    }

    let size = max_row_size(columns, config.default_max_string_size);
    if size > config.max_bytes_per_row {
        return Err(EngineError::invalid_argument(format!(
            "Too much data per column. The maximum size for a row is about {} bytes. The size for the given columns would be {} bytes",
            config.max_bytes_per_row, size
        )));
    }

    let large_text = columns
        .iter()
        .filter(|c| c.column_type() == ColumnType::LargeText)
        .count();
    let cap = config.max_large_text_columns();
    if large_text > cap {
        return Err(EngineError::invalid_argument(format!(
            "Too many LARGETEXT columns. The limit is {cap} LARGETEXT columns per table"
        )));
    }
    Ok(())
}

/// Rows that fit in one page of `max_bytes_per_request` bytes; never zero.
pub fn max_rows_per_page(
    columns: &[ColumnModel],
    max_bytes_per_request: u64,
    default_max_string_size: u64,
) -> u64 {
    let row = max_row_size(columns, default_max_string_size).max(1);
    (max_bytes_per_request / row).max(1)
}
