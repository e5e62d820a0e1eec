//! Schema id arithmetic.
//!
//! A schema is an ordered list of column ids. Applying a list of
//! [`ColumnChange`]s drops removed ids in place, swaps updated ids into the
//! position of the id they replace and appends added ids at the end.

use std::collections::BTreeSet;

use crate::error::{EngineError, EngineResult};
use crate::model::{ColumnChange, ColumnChangeKind, IdAndVersion};

/// Compute the schema id order that results from applying `changes` to `current_ids`.
///
/// When `ordered_ids` is supplied it must contain exactly the computed ids
/// (in any order) and becomes the result.
pub fn diff_schema(
    table: &IdAndVersion,
    current_ids: &[u64],
    changes: &[ColumnChange],
    ordered_ids: Option<&[u64]>,
) -> EngineResult<Vec<u64>> {
    let mut ids: Vec<u64> = current_ids.to_vec();

    for change in changes {
        match change.kind()? {
            ColumnChangeKind::Update { old, new } => {
                let Some(index) = ids.iter().position(|id| *id == old) else {
                    return Err(EngineError::invalid_argument(format!(
                        "Cannot update column: {old} since it is not currently a column of table: {table}"
                    )));
                };
                ids[index] = new;
            }
            ColumnChangeKind::Remove(old) => {
                if !ids.contains(&old) {
                    return Err(EngineError::invalid_argument(format!(
                        "Cannot remove column: {old} since it is not currently a column of table: {table}"
                    )));
                }
                ids.retain(|id| *id != old);
            }
            ColumnChangeKind::Add(new) => ids.push(new),
        }
    }

    match ordered_ids {
        None => Ok(ids),
        Some(ordered) => {
            let computed: BTreeSet<u64> = ids.iter().copied().collect();
            let provided: BTreeSet<u64> = ordered.iter().copied().collect();
            if computed != provided || ordered.len() != ids.len() {
                return Err(EngineError::invalid_argument(
                    "The provided ordered column IDs does not match resulting columns in the table schema.",
                ));
            }
            Ok(ordered.to_vec())
        }
    }
}

/// Express the move from `old_ids` to `new_ids` as removes followed by adds.
///
/// Ids present in both schemas produce no change.
pub fn changes_from_old_schema_to_new(old_ids: &[u64], new_ids: &[u64]) -> Vec<ColumnChange> {
    let removes = old_ids
        .iter()
        .filter(|id| !new_ids.contains(id))
        .map(|id| ColumnChange::remove(*id));
    let adds = new_ids
        .iter()
        .filter(|id| !old_ids.contains(id))
        .map(|id| ColumnChange::add(*id));
    removes.chain(adds).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn table() -> IdAndVersion {
        IdAndVersion::current(9)
    }

    // ==================== Diff tests ====================

    #[test]
    fn removes_updates_and_adds_apply_positionally() -> TestResult {
        let changes = [
            ColumnChange::remove(2),
            ColumnChange::update(3, 30),
            ColumnChange::add(5),
        ];
        let ids = diff_schema(&table(), &[1, 2, 3, 4], &changes, None)?;
        assert_eq!(ids, vec![1, 30, 4, 5]);
        Ok(())
    }

    #[test]
    fn adding_an_existing_id_keeps_the_duplicate_for_validation() -> TestResult {
        let ids = diff_schema(&table(), &[1, 2], &[ColumnChange::add(2)], None)?;
        assert_eq!(ids, vec![1, 2, 2]);
        Ok(())
    }

    #[test]
    fn updating_an_absent_column_fails() {
        let err = diff_schema(&table(), &[1], &[ColumnChange::update(7, 8)], None)
            .expect_err("absent old id");
        assert_eq!(
            err.to_string(),
            "Cannot update column: 7 since it is not currently a column of table: syn9"
        );
    }

    #[test]
    fn removing_an_absent_column_fails() {
        let err = diff_schema(&table(), &[1], &[ColumnChange::remove(7)], None)
            .expect_err("absent old id");
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[test]
    fn ordered_ids_must_be_a_permutation() -> TestResult {
        let ids = diff_schema(&table(), &[1, 2], &[ColumnChange::add(3)], Some(&[3, 1, 2]))?;
        assert_eq!(ids, vec![3, 1, 2]);

        for bad in [&[1, 2][..], &[1, 2, 3, 4][..], &[1, 1, 2, 3][..]] {
            let err = diff_schema(&table(), &[1, 2], &[ColumnChange::add(3)], Some(bad))
                .expect_err("not a permutation");
            assert_eq!(
                err.to_string(),
                "The provided ordered column IDs does not match resulting columns in the table schema."
            );
        }
        Ok(())
    }

    #[test]
    fn empty_change_is_rejected() {
        let empty = ColumnChange {
            old_column_id: None,
            new_column_id: None,
        };
        assert!(diff_schema(&table(), &[1], &[empty], None).is_err());
    }

    // ==================== Old-to-new tests ====================

    #[test]
    fn old_to_new_produces_removes_then_adds() {
        let changes = changes_from_old_schema_to_new(&[1, 2, 3], &[3, 4, 1]);
        assert_eq!(changes, vec![ColumnChange::remove(2), ColumnChange::add(4)]);
        assert!(changes_from_old_schema_to_new(&[1, 2], &[2, 1]).is_empty());
    }
}
