//! Row-level security for views and materialized views.
//!
//! Each view row carries the id of its benefactor. Before a view is read
//! the distinct benefactors present in its index are intersected with what
//! the caller may see, and the query is restricted to
//! `<benefactor column> IN (<allowed>, -1)`. The user's own condition is
//! parenthesized first so a top-level `OR` cannot widen the result.

use std::collections::BTreeSet;

use log::debug;

use crate::collaborators::{AuthorizationService, IndexDriver, TableCatalog};
use crate::error::EngineResult;
use crate::model::{IdAndVersion, IndexShapeDescription, ViewObjectType, shape::BENEFACTOR_COLUMN};
use crate::query::ast::Expr;
use crate::query::translator::ParameterBinder;

/// Always present in a benefactor `IN` list so an empty allowed set still
/// compiles and matches nothing. Benefactor ids are always positive.
pub const EMPTY_BENEFACTOR_SENTINEL: i64 = -1;

/// Benefactors a caller may see through one benefactor column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenefactorFilter {
    /// Physical benefactor column.
    pub column: String,
    /// Benefactor ids the caller may read.
    pub allowed: BTreeSet<u64>,
}

impl BenefactorFilter {
    /// `column IN (:bN, ..., -1)`, binding each allowed id.
    pub fn to_condition(&self, binder: &mut ParameterBinder) -> Expr {
        let mut list: Vec<Expr> = self
            .allowed
            .iter()
            .map(|id| binder.bind(serde_json::Value::from(*id)))
            .collect();
        list.push(Expr::number(EMPTY_BENEFACTOR_SENTINEL));
        Expr::InList {
            expr: Box::new(Expr::column(&self.column)),
            list,
            negated: false,
        }
    }
}

/// AND `conditions` onto `where_clause`, parenthesizing the original.
pub fn conjoin(where_clause: Option<Expr>, conditions: Vec<Expr>) -> Option<Expr> {
    let mut combined = where_clause.map(Expr::nested);
    for condition in conditions {
        combined = Some(match combined {
            Some(existing) => existing.and(condition),
            None => condition,
        });
    }
    combined
}

/// Filters `user` needs to read `shape`; none for plain and virtual tables.
pub async fn load_benefactor_filters(
    shape: &IndexShapeDescription,
    user: &str,
    driver: &dyn IndexDriver,
    catalog: &dyn TableCatalog,
    auth: &dyn AuthorizationService,
) -> EngineResult<Vec<BenefactorFilter>> {
    match shape {
        IndexShapeDescription::PlainTable { .. } | IndexShapeDescription::VirtualTable { .. } => Ok(Vec::new()),
        IndexShapeDescription::View { view, scope } => {
            let filter = filter_for(view, BENEFACTOR_COLUMN, scope.object_type, user, driver, auth).await?;
            Ok(vec![filter])
        }
        IndexShapeDescription::MaterializedView { view, sources, .. } => {
            let mut filters = Vec::with_capacity(sources.len());
            for source in sources {
                let IndexShapeDescription::View { scope, .. } = catalog.shape(source).await? else {
                    continue;
                };
                let column = IndexShapeDescription::benefactor_column_for_source(source);
                filters.push(filter_for(view, &column, scope.object_type, user, driver, auth).await?);
            }
            Ok(filters)
        }
    }
}

async fn filter_for(
    table: &IdAndVersion,
    column: &str,
    object_type: ViewObjectType,
    user: &str,
    driver: &dyn IndexDriver,
    auth: &dyn AuthorizationService,
) -> EngineResult<BenefactorFilter> {
    let present = driver.distinct_benefactors(table, column).await?;
    let allowed = if present.is_empty() {
        BTreeSet::new()
    } else {
        let granted = auth.accessible_benefactors(user, object_type, &present).await?;
        granted.intersection(&present).copied().collect()
    };
    debug!(
        "{table}: {user} may read {} of {} benefactors in {column}",
        allowed.len(),
        present.len()
    );
    Ok(BenefactorFilter {
        column: column.to_string(),
        allowed,
    })
}
