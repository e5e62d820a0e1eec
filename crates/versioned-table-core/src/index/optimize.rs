//! Secondary index selection.
//!
//! Only a limited number of secondary indices may exist per table, so the
//! columns with the highest cardinality win. Large text, JSON and list
//! columns are never indexed directly.

use log::debug;

use crate::collaborators::IndexPlanEntry;
use crate::error::EngineResult;
use crate::index::IndexBuilder;
use crate::model::{ColumnType, DatabaseColumnInfo, IdAndVersion};

fn indexable(info: &DatabaseColumnInfo) -> bool {
    info.column_id().is_some()
        && !matches!(
            info.column_type,
            Some(ColumnType::LargeText | ColumnType::MediumText | ColumnType::Json)
        )
        && !info.column_type.is_some_and(ColumnType::is_list)
}

/// Decide which indices to add and drop so that at most `max_index_count`
/// columns are indexed, preferring higher cardinality.
pub fn plan_index_changes(infos: &[DatabaseColumnInfo], max_index_count: usize) -> Vec<IndexPlanEntry> {
    let mut candidates: Vec<&DatabaseColumnInfo> = infos.iter().filter(|i| indexable(i)).collect();
    candidates.sort_by(|a, b| {
        b.cardinality
            .cmp(&a.cardinality)
            .then_with(|| a.column_name.cmp(&b.column_name))
    });

    let mut plan = Vec::new();
    for (rank, info) in candidates.iter().enumerate() {
        let keep = rank < max_index_count && info.cardinality > 0;
        if keep != info.has_index {
            plan.push(IndexPlanEntry {
                column_name: info.column_name.clone(),
                add: keep,
            });
        }
    }
    // Drops first so the clamp holds while the plan is applied.
    plan.sort_by_key(|e| e.add);
    plan
}

impl IndexBuilder {
    /// Re-plan and apply the secondary indices of `table`.
    pub async fn optimize_table_indices(&self, table: &IdAndVersion) -> EngineResult<()> {
        let infos = self.driver.get_database_info(table).await?;
        let plan = plan_index_changes(&infos, self.config.max_index_count);
        if !plan.is_empty() {
            debug!("{table}: applying {} index changes", plan.len());
            self.driver.apply_index_plan(table, &plan).await?;
        }
        Ok(())
    }
}
