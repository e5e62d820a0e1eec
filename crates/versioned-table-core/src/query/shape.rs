//! Resolution of the tables a query reads.
//!
//! A query names one table. When that table is virtual its defining query
//! names another, and so on until a table with a physical index is reached.
//! The whole chain is resolved up front so translation itself stays
//! synchronous.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::collaborators::TableCatalog;
use crate::error::{EngineError, EngineResult};
use crate::model::{ColumnModel, IdAndVersion, IndexShapeDescription};
use crate::query::ast::QuerySpec;
use crate::query::security::BenefactorFilter;
use crate::schema::SchemaManager;

/// One table of a resolved chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTable {
    /// The id the table was referenced by.
    pub table: IdAndVersion,
    /// Physical layout behind the id.
    pub shape: IndexShapeDescription,
    /// Ordered schema.
    pub schema: Vec<ColumnModel>,
    /// Row-level filters to apply when reading the table.
    pub benefactor_filters: Vec<BenefactorFilter>,
}

impl ResolvedTable {
    /// A table with no row-level filters.
    pub fn new(table: IdAndVersion, shape: IndexShapeDescription, schema: Vec<ColumnModel>) -> Self {
        Self {
            table,
            shape,
            schema,
            benefactor_filters: Vec::new(),
        }
    }

    /// Table read by the defining query, for virtual tables.
    pub fn defining_source(&self) -> EngineResult<Option<IdAndVersion>> {
        match &self.shape {
            IndexShapeDescription::VirtualTable { defining_sql, .. } => defining_table(defining_sql).map(Some),
            _ => Ok(None),
        }
    }
}

/// Table named in the `FROM` clause of `query`.
pub fn defining_table(query: &QuerySpec) -> EngineResult<IdAndVersion> {
    query.from.name.parse()
}

/// Every table a query reaches, from the queried table down to the table
/// holding the rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTables {
    root: IdAndVersion,
    source: IdAndVersion,
    tables: BTreeMap<IdAndVersion, ResolvedTable>,
}

impl ResolvedTables {
    /// Index `tables` and walk the chain from `root`.
    ///
    /// Fails with `InvalidArgument` when a virtual table is defined in terms
    /// of itself, directly or through other virtual tables.
    pub fn new(root: IdAndVersion, tables: Vec<ResolvedTable>) -> EngineResult<Self> {
        let tables: BTreeMap<IdAndVersion, ResolvedTable> = tables.into_iter().map(|t| (t.table, t)).collect();
        let mut visited = BTreeSet::new();
        let mut current = root;
        loop {
            if !visited.insert(current) {
                return Err(cycle_error(&root, &current));
            }
            let table = tables
                .get(&current)
                .ok_or_else(|| EngineError::not_found(format!("Table {current} was not resolved")))?;
            match table.defining_source()? {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(Self {
            root,
            source: current,
            tables,
        })
    }

    /// The queried table.
    pub fn root(&self) -> IdAndVersion {
        self.root
    }

    /// The table at the bottom of the chain; the only one with rows.
    pub fn source(&self) -> IdAndVersion {
        self.source
    }

    /// The resolved entry for `table`.
    pub fn get(&self, table: &IdAndVersion) -> EngineResult<&ResolvedTable> {
        self.tables
            .get(table)
            .ok_or_else(|| EngineError::not_found(format!("Table {table} was not resolved")))
    }

    /// The queried table's entry.
    pub fn root_table(&self) -> EngineResult<&ResolvedTable> {
        self.get(&self.root)
    }

    /// Mutable entry of the source table.
    pub fn source_table_mut(&mut self) -> EngineResult<&mut ResolvedTable> {
        let source = self.source;
        self.tables
            .get_mut(&source)
            .ok_or_else(|| EngineError::not_found(format!("Table {source} was not resolved")))
    }
}

fn cycle_error(root: &IdAndVersion, repeated: &IdAndVersion) -> EngineError {
    EngineError::invalid_argument(format!(
        "The definition of {root} is cyclic: {repeated} is reached more than once"
    ))
}

/// Look up shape and schema of `table` and every table below it.
pub async fn resolve_tables(
    catalog: &dyn TableCatalog,
    schema: &SchemaManager,
    table: &IdAndVersion,
) -> EngineResult<ResolvedTables> {
    let mut resolved = Vec::new();
    let mut visited = BTreeSet::new();
    let mut current = *table;
    loop {
        if !visited.insert(current) {
            return Err(cycle_error(table, &current));
        }
        let shape = catalog.shape(&current).await?;
        let columns = schema.get_bound_column_models(&current).await?;
        let entry = ResolvedTable::new(current, shape, columns);
        let next = entry.defining_source()?;
        resolved.push(entry);
        match next {
            Some(next) => {
                debug!("{current} reads from {next}");
                current = next;
            }
            None => break,
        }
    }
    ResolvedTables::new(*table, resolved)
}
