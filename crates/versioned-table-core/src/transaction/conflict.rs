//! Optimistic row-level conflict detection.
//!
//! An update carries the version each row had when it was read. The write
//! conflicts when a ROW change appended after that point touched one of the
//! same rows. The scan starts after the change carrying the caller's etag
//! when one is given, otherwise after the lowest row version of the write.

use std::collections::BTreeMap;

use futures::TryStreamExt;
use log::debug;

use crate::changelog::ChangeLog;
use crate::error::{ConflictingUpdateSnafu, EngineError, EngineResult};
use crate::model::{ChangePayload, SparseRow};

/// Read version of every row that has an id; inserts are skipped.
///
/// Fails with `InvalidArgument` when an update carries no version.
pub fn read_versions(rows: &[SparseRow]) -> EngineResult<BTreeMap<u64, u64>> {
    let mut versions = BTreeMap::new();
    for row in rows {
        let Some(row_id) = row.row_id else {
            continue;
        };
        let version = row
            .version_number
            .ok_or_else(|| EngineError::invalid_argument("Row version number cannot be null"))?;
        versions.insert(row_id, version);
    }
    Ok(versions)
}

/// Fail with `ConflictingUpdate` when a row of `rows` changed after it was read.
pub async fn check_for_row_level_conflict(
    log: &dyn ChangeLog,
    table_id: u64,
    rows: &[SparseRow],
    etag: Option<&str>,
) -> EngineResult<()> {
    let versions = read_versions(rows)?;
    let Some(min_version) = versions.values().copied().min() else {
        return Ok(());
    };
    let base = match etag {
        Some(etag) => log.version_for_etag(table_id, etag).await?,
        None => min_version,
    };
    debug!("Checking {} rows of syn{table_id} for changes after {base}", versions.len());

    let mut changes = log.iterate_changes_since(table_id, Some(base)).await?;
    while let Some(record) = changes.try_next().await? {
        let ChangePayload::Row(set) = &record.payload else {
            continue;
        };
        if let Some(row_id) = set.rows.iter().filter_map(|r| r.row_id).find(|id| versions.contains_key(id)) {
            return ConflictingUpdateSnafu {
                message: format!(
                    "Row id: {row_id} has been changed since last read.  Please get the latest value for this row and then attempt to update it again."
                ),
            }
            .fail();
        }
    }
    Ok(())
}
