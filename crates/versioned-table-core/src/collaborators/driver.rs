//! The physical index and query engine.
//!
//! The engine never talks to a database directly. Every DDL statement,
//! row write, bookkeeping update and query goes through [`IndexDriver`]:
//!
//! - **DDL**: create, alter, truncate and drop index tables and the
//!   secondary tables that unnest list columns.
//! - **Writes**: a batch of [`IndexMutation`]s applied in one write
//!   transaction, so a row group succeeds or fails as a unit.
//! - **Bookkeeping**: the last applied change number and the schema
//!   checksum recorded on each index.
//! - **Queries**: compiled [`BoundSql`] streamed row by row through a
//!   callback, collected into a [`RowSet`], or counted.
//!
//! [`InMemoryIndexDriver`] keeps tables as maps, records a statement log
//! for assertions and answers queries through a pluggable handler.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::model::{
    ColumnChangeDetails, ColumnModel, DatabaseColumnInfo, IdAndVersion, SparseRow, ViewScope,
    column::{physical_column_name, row_id_ref_column_name, unnest_column_name},
};

/// SQL with named parameters (`:b0`, `:b1`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundSql {
    /// Statement text.
    pub sql: String,
    /// Parameter values keyed by name, without the leading colon.
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl BoundSql {
    /// Statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: BTreeMap::new(),
        }
    }
}

/// One result row; `None` is SQL `NULL`.
pub type ResultRow = Vec<Option<String>>;

/// A fully collected query result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowSet {
    /// Column labels in select order.
    pub headers: Vec<String>,
    /// Rows in result order.
    pub rows: Vec<ResultRow>,
}

impl RowSet {
    /// A result with `headers` and `rows`.
    pub fn new(headers: Vec<&str>, rows: Vec<ResultRow>) -> Self {
        Self {
            headers: headers.into_iter().map(str::to_string).collect(),
            rows,
        }
    }
}

/// One write applied inside a write transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexMutation {
    /// Insert or overwrite the `columns` cells of `rows`.
    UpsertRows {
        /// Columns written by every row.
        columns: Vec<ColumnModel>,
        /// Rows; each carries an id and version.
        rows: Vec<SparseRow>,
    },
    /// Remove rows (and their list index entries).
    DeleteRows {
        /// Ids to remove.
        row_ids: Vec<u64>,
    },
    /// Copy replicated object metadata into a view, matching columns by name.
    CopyFromReplication {
        /// What populates the view.
        scope: ViewScope,
        /// View schema.
        schema: Vec<ColumnModel>,
        /// Restrict to these object ids; `None` copies everything in scope.
        row_ids: Option<Vec<u64>>,
    },
    /// Insert the rows of a translated query as new rows.
    ///
    /// The select projects `columns` in order, then one benefactor value per
    /// entry of `benefactor_columns`. Missing benefactor columns are created.
    InsertFromQuery {
        /// Columns filled by the leading select items.
        columns: Vec<ColumnModel>,
        /// Physical select over the source indices.
        select: BoundSql,
        /// Benefactor columns filled by the trailing select items.
        benefactor_columns: Vec<String>,
    },
    /// Rebuild the unnest table of a list column.
    PopulateListColumn {
        /// The list column.
        column: ColumnModel,
        /// Restrict to these rows; `None` rebuilds the whole table.
        row_ids: Option<Vec<u64>>,
    },
}

/// Add or drop a secondary index on one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPlanEntry {
    /// Physical column name.
    pub column_name: String,
    /// `true` to create the index, `false` to drop it.
    pub add: bool,
}

/// The physical index and query engine.
#[async_trait]
pub trait IndexDriver: Send + Sync {
    /// Create the index table of `table` if it is missing.
    async fn create_table_if_not_exists(&self, table: &IdAndVersion, with_benefactor: bool) -> EngineResult<()>;

    /// True when the index table exists.
    async fn table_exists(&self, table: &IdAndVersion) -> EngineResult<bool>;

    /// User columns physically present, with cardinality and index flags.
    async fn get_database_info(&self, table: &IdAndVersion) -> EngineResult<Vec<DatabaseColumnInfo>>;

    /// Apply column alterations; returns true when anything changed.
    async fn alter_table(&self, table: &IdAndVersion, changes: &[ColumnChangeDetails]) -> EngineResult<bool>;

    /// Remove every row of the index (and its list tables).
    async fn truncate_table(&self, table: &IdAndVersion) -> EngineResult<()>;

    /// Drop the index, its list tables and its bookkeeping.
    async fn delete_table(&self, table: &IdAndVersion) -> EngineResult<()>;

    /// Create the unnest table of a list column.
    async fn create_list_index_table(&self, table: &IdAndVersion, column: &ColumnModel) -> EngineResult<()>;

    /// Drop the unnest table of a list column.
    async fn delete_list_index_table(&self, table: &IdAndVersion, column_id: u64) -> EngineResult<()>;

    /// Column ids that currently have an unnest table.
    async fn list_index_tables(&self, table: &IdAndVersion) -> EngineResult<BTreeSet<u64>>;

    /// Apply `mutations` atomically.
    async fn apply_in_write_transaction(
        &self,
        table: &IdAndVersion,
        mutations: Vec<IndexMutation>,
    ) -> EngineResult<()>;

    /// Associate file handles with the table.
    async fn apply_file_handle_ids(&self, table: &IdAndVersion, ids: &[u64]) -> EngineResult<()>;

    /// Highest change number fully applied to the index.
    async fn get_max_current_complete_version(&self, table: &IdAndVersion) -> EngineResult<Option<u64>>;

    /// Record the highest applied change number.
    async fn set_max_current_complete_version(&self, table: &IdAndVersion, version: u64) -> EngineResult<()>;

    /// Checksum of the schema the index was built for.
    async fn get_schema_hash(&self, table: &IdAndVersion) -> EngineResult<Option<String>>;

    /// Record the schema checksum.
    async fn set_schema_hash(&self, table: &IdAndVersion, hash: &str) -> EngineResult<()>;

    /// Create and drop secondary indices.
    async fn apply_index_plan(&self, table: &IdAndVersion, plan: &[IndexPlanEntry]) -> EngineResult<()>;

    /// Copy the index into its temporary validation table.
    async fn create_temporary_table_copy(&self, table: &IdAndVersion) -> EngineResult<()>;

    /// Drop the temporary validation table; a missing copy is not an error.
    async fn delete_temporary_table_copy(&self, table: &IdAndVersion) -> EngineResult<()>;

    /// Alter the temporary validation table.
    async fn alter_temporary_table(&self, table: &IdAndVersion, changes: &[ColumnChangeDetails]) -> EngineResult<()>;

    /// Longest value in a column of the temporary copy: characters for
    /// text, elements for lists.
    async fn temporary_column_max_length(&self, table: &IdAndVersion, column_id: u64) -> EngineResult<Option<u64>>;

    /// Largest replicated value per annotation name within `scope`.
    async fn replication_max_value_sizes(&self, scope: &ViewScope) -> EngineResult<BTreeMap<String, u64>>;

    /// Checksum of the replicated objects within `scope`.
    async fn replication_checksum(&self, scope: &ViewScope) -> EngineResult<u64>;

    /// Distinct values of `benefactor_column` present in the index.
    async fn distinct_benefactors(
        &self,
        table: &IdAndVersion,
        benefactor_column: &str,
    ) -> EngineResult<BTreeSet<u64>>;

    /// Run `query` and collect the result.
    async fn query_rows(&self, query: &BoundSql) -> EngineResult<RowSet>;

    /// Run a single-value `COUNT` query.
    async fn count(&self, query: &BoundSql) -> EngineResult<u64>;

    /// Run `query`, handing each row to `sink`; returns the headers.
    async fn query_stream(
        &self,
        query: &BoundSql,
        sink: &mut (dyn FnMut(ResultRow) -> EngineResult<()> + Send),
    ) -> EngineResult<Vec<String>> {
        let result = self.query_rows(query).await?;
        for row in result.rows {
            sink(row)?;
        }
        Ok(result.headers)
    }
}

/// Row stored by [`InMemoryIndexDriver`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredRow {
    /// Version of the last write.
    pub version: Option<u64>,
    /// Cells keyed by column id.
    pub values: BTreeMap<u64, Option<String>>,
}

#[derive(Debug, Clone, Default)]
struct PhysicalTable {
    with_benefactor: bool,
    columns: Vec<DatabaseColumnInfo>,
    rows: BTreeMap<u64, StoredRow>,
    list_tables: BTreeMap<u64, BTreeMap<u64, Vec<String>>>,
    file_handles: BTreeSet<u64>,
    benefactors: BTreeSet<u64>,
    max_version: Option<u64>,
    schema_hash: Option<String>,
}

type QueryHandler = Box<dyn Fn(&BoundSql) -> EngineResult<RowSet> + Send + Sync>;

#[derive(Default)]
struct DriverState {
    tables: BTreeMap<String, PhysicalTable>,
    temp_tables: BTreeMap<String, PhysicalTable>,
    statements: Vec<String>,
    queries: Vec<BoundSql>,
    replication_sizes: BTreeMap<String, u64>,
    replication_failure: Option<String>,
    replication_checksum: u64,
    fail_next_alter: Option<String>,
}

/// [`IndexDriver`] that keeps every table in memory.
#[derive(Default)]
pub struct InMemoryIndexDriver {
    state: Mutex<DriverState>,
    handler: Mutex<Option<QueryHandler>>,
}

impl std::fmt::Debug for InMemoryIndexDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIndexDriver").finish_non_exhaustive()
    }
}

fn missing_table(name: &str) -> EngineError {
    EngineError::driver(format!("Table '{name}' doesn't exist"))
}

fn parse_list(value: &str) -> Vec<String> {
    match serde_json::from_str::<serde_json::Value>(value) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

impl InMemoryIndexDriver {
    /// An empty driver whose queries return empty results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries with `handler`.
    pub fn set_query_handler(&self, handler: impl Fn(&BoundSql) -> EngineResult<RowSet> + Send + Sync + 'static) {
        *self.handler.lock() = Some(Box::new(handler));
    }

    /// Statements executed so far, as short descriptions.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Queries executed so far.
    pub fn queries(&self) -> Vec<BoundSql> {
        self.state.lock().queries.clone()
    }

    /// Rows stored in the index of `table`.
    pub fn rows(&self, table: &IdAndVersion) -> BTreeMap<u64, StoredRow> {
        self.state
            .lock()
            .tables
            .get(&table.index_table_name())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Unnested values of list column `column_id`, per row.
    pub fn list_values(&self, table: &IdAndVersion, column_id: u64) -> BTreeMap<u64, Vec<String>> {
        self.state
            .lock()
            .tables
            .get(&table.index_table_name())
            .and_then(|t| t.list_tables.get(&column_id).cloned())
            .unwrap_or_default()
    }

    /// File handles associated with `table`.
    pub fn file_handles(&self, table: &IdAndVersion) -> BTreeSet<u64> {
        self.state
            .lock()
            .tables
            .get(&table.index_table_name())
            .map(|t| t.file_handles.clone())
            .unwrap_or_default()
    }

    /// True when the temporary copy of `table` exists.
    pub fn has_temporary_copy(&self, table: &IdAndVersion) -> bool {
        self.state.lock().temp_tables.contains_key(&table.temp_table_name())
    }

    /// Seed the benefactor ids present in a view index.
    pub fn set_benefactors(&self, table: &IdAndVersion, ids: impl IntoIterator<Item = u64>) {
        let mut state = self.state.lock();
        let entry = state.tables.entry(table.index_table_name()).or_default();
        entry.with_benefactor = true;
        entry.benefactors = ids.into_iter().collect();
    }

    /// Seed a cell of the temporary copy, bypassing the mutation path.
    pub fn set_temporary_cell(&self, table: &IdAndVersion, row_id: u64, column_id: u64, value: &str) {
        let mut state = self.state.lock();
        if let Some(temp) = state.temp_tables.get_mut(&table.temp_table_name()) {
            temp.rows
                .entry(row_id)
                .or_default()
                .values
                .insert(column_id, Some(value.to_string()));
        }
    }

    /// Largest replicated value per annotation name.
    pub fn set_replication_max_sizes(&self, sizes: BTreeMap<String, u64>) {
        self.state.lock().replication_sizes = sizes;
    }

    /// Make every replication copy fail with `message`.
    pub fn fail_replication_with(&self, message: impl Into<String>) {
        self.state.lock().replication_failure = Some(message.into());
    }

    /// Checksum reported for every replication scope.
    pub fn set_replication_checksum(&self, checksum: u64) {
        self.state.lock().replication_checksum = checksum;
    }

    /// Make the next alteration fail with `message`.
    pub fn fail_next_alter_with(&self, message: impl Into<String>) {
        self.state.lock().fail_next_alter = Some(message.into());
    }

    fn alter(table: &mut PhysicalTable, changes: &[ColumnChangeDetails]) -> bool {
        let mut changed = false;
        for change in changes.iter().filter(|c| !c.is_no_op()) {
            if let Some(old) = &change.old_column {
                let name = physical_column_name(old.id);
                let before = table.columns.len();
                table.columns.retain(|c| c.column_name != name);
                changed |= before != table.columns.len();
                if change.new_column.as_ref().map(|n| n.id) != Some(old.id) {
                    for row in table.rows.values_mut() {
                        let value = row.values.remove(&old.id);
                        if let (Some(new), Some(value)) = (&change.new_column, value) {
                            row.values.insert(new.id, value);
                        }
                    }
                }
            }
            if let Some(new) = &change.new_column {
                let name = physical_column_name(new.id);
                if !table.columns.iter().any(|c| c.column_name == name) {
                    table.columns.push(DatabaseColumnInfo::for_model(new));
                    changed = true;
                }
            }
        }
        changed
    }

    fn apply_mutation(
        state: &mut DriverState,
        handler: Option<&QueryHandler>,
        table: &mut PhysicalTable,
        mutation: IndexMutation,
    ) -> EngineResult<()> {
        match mutation {
            IndexMutation::UpsertRows { columns, rows } => {
                for row in rows {
                    let row_id = row
                        .row_id
                        .ok_or_else(|| EngineError::driver("Row is missing its id"))?;
                    let stored = table.rows.entry(row_id).or_default();
                    stored.version = row.version_number;
                    for column in &columns {
                        let value = row.values.get(&column.id).cloned().flatten();
                        stored.values.insert(column.id, value);
                    }
                }
            }
            IndexMutation::DeleteRows { row_ids } => {
                for id in row_ids {
                    table.rows.remove(&id);
                    for list in table.list_tables.values_mut() {
                        list.remove(&id);
                    }
                }
            }
            IndexMutation::CopyFromReplication { row_ids, .. } => {
                if let Some(message) = &state.replication_failure {
                    return Err(EngineError::driver(message.clone()));
                }
                state.statements.push(format!(
                    "COPY REPLICATION ROWS {}",
                    row_ids.map_or_else(|| "ALL".to_string(), |ids| format!("{ids:?}"))
                ));
            }
            IndexMutation::InsertFromQuery {
                columns,
                select,
                benefactor_columns,
            } => {
                state.queries.push(select.clone());
                let result = match handler {
                    Some(handler) => handler(&select)?,
                    None => RowSet::default(),
                };
                state.statements.push(format!(
                    "INSERT {} ROWS FROM QUERY WITH {benefactor_columns:?}",
                    result.rows.len()
                ));
                let mut next_id = table.rows.keys().next_back().map_or(0, |id| id + 1);
                for row in result.rows {
                    if row.len() != columns.len() + benefactor_columns.len() {
                        return Err(EngineError::driver(format!(
                            "Insert expected {} values but the query returned {}",
                            columns.len() + benefactor_columns.len(),
                            row.len()
                        )));
                    }
                    let (values, benefactors) = row.split_at(columns.len());
                    for benefactor in benefactors.iter().flatten() {
                        let id = benefactor
                            .parse()
                            .map_err(|_| EngineError::driver(format!("Invalid benefactor id: {benefactor}")))?;
                        table.benefactors.insert(id);
                    }
                    let stored = StoredRow {
                        version: None,
                        values: columns.iter().map(|c| c.id).zip(values.iter().cloned()).collect(),
                    };
                    table.rows.insert(next_id, stored);
                    next_id += 1;
                }
                if !benefactor_columns.is_empty() {
                    table.with_benefactor = true;
                }
            }
            IndexMutation::PopulateListColumn { column, row_ids } => {
                let rows: Vec<(u64, Option<String>)> = table
                    .rows
                    .iter()
                    .filter(|(id, _)| row_ids.as_ref().is_none_or(|ids| ids.contains(id)))
                    .map(|(id, row)| (*id, row.values.get(&column.id).cloned().flatten()))
                    .collect();
                let list = table.list_tables.entry(column.id).or_default();
                if row_ids.is_none() {
                    list.clear();
                }
                for (id, value) in rows {
                    match value {
                        Some(value) => {
                            list.insert(id, parse_list(&value));
                        }
                        None => {
                            list.remove(&id);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IndexDriver for InMemoryIndexDriver {
    async fn create_table_if_not_exists(&self, table: &IdAndVersion, with_benefactor: bool) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.index_table_name();
        if !state.tables.contains_key(&name) {
            state.statements.push(format!("CREATE TABLE {name}"));
            state.tables.insert(
                name,
                PhysicalTable {
                    with_benefactor,
                    ..PhysicalTable::default()
                },
            );
        }
        Ok(())
    }

    async fn table_exists(&self, table: &IdAndVersion) -> EngineResult<bool> {
        Ok(self.state.lock().tables.contains_key(&table.index_table_name()))
    }

    async fn get_database_info(&self, table: &IdAndVersion) -> EngineResult<Vec<DatabaseColumnInfo>> {
        let state = self.state.lock();
        let Some(physical) = state.tables.get(&table.index_table_name()) else {
            return Ok(Vec::new());
        };
        Ok(physical
            .columns
            .iter()
            .map(|info| {
                let mut info = info.clone();
                if let Some(id) = info.column_id() {
                    let distinct: BTreeSet<_> = physical
                        .rows
                        .values()
                        .filter_map(|r| r.values.get(&id).cloned().flatten())
                        .collect();
                    info.cardinality = distinct.len() as u64;
                }
                info
            })
            .collect())
    }

    async fn alter_table(&self, table: &IdAndVersion, changes: &[ColumnChangeDetails]) -> EngineResult<bool> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next_alter.take() {
            return Err(EngineError::driver(message));
        }
        let name = table.index_table_name();
        let physical = state.tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;
        let changed = Self::alter(physical, changes);
        if changed {
            state.statements.push(format!("ALTER TABLE {name}"));
        }
        Ok(changed)
    }

    async fn truncate_table(&self, table: &IdAndVersion) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.index_table_name();
        if let Some(physical) = state.tables.get_mut(&name) {
            physical.rows.clear();
            physical.list_tables.values_mut().for_each(BTreeMap::clear);
        }
        state.statements.push(format!("TRUNCATE TABLE {name}"));
        Ok(())
    }

    async fn delete_table(&self, table: &IdAndVersion) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.index_table_name();
        state.tables.remove(&name);
        state.temp_tables.remove(&table.temp_table_name());
        state.statements.push(format!("DROP TABLE {name}"));
        Ok(())
    }

    async fn create_list_index_table(&self, table: &IdAndVersion, column: &ColumnModel) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.index_table_name();
        let physical = state.tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;
        physical.list_tables.entry(column.id).or_default();
        let statement = format!(
            "CREATE TABLE {} ({}, {})",
            table.list_index_table_name(column.id),
            row_id_ref_column_name(column.id),
            unnest_column_name(column.id)
        );
        state.statements.push(statement);
        Ok(())
    }

    async fn delete_list_index_table(&self, table: &IdAndVersion, column_id: u64) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(physical) = state.tables.get_mut(&table.index_table_name()) {
            physical.list_tables.remove(&column_id);
        }
        state
            .statements
            .push(format!("DROP TABLE {}", table.list_index_table_name(column_id)));
        Ok(())
    }

    async fn list_index_tables(&self, table: &IdAndVersion) -> EngineResult<BTreeSet<u64>> {
        Ok(self
            .state
            .lock()
            .tables
            .get(&table.index_table_name())
            .map(|t| t.list_tables.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn apply_in_write_transaction(
        &self,
        table: &IdAndVersion,
        mutations: Vec<IndexMutation>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        let handler = self.handler.lock();
        let name = table.index_table_name();
        let mut working = state.tables.get(&name).cloned().ok_or_else(|| missing_table(&name))?;
        for mutation in mutations {
            Self::apply_mutation(&mut state, handler.as_ref(), &mut working, mutation)?;
        }
        state.tables.insert(name, working);
        Ok(())
    }

    async fn apply_file_handle_ids(&self, table: &IdAndVersion, ids: &[u64]) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.index_table_name();
        let physical = state.tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;
        physical.file_handles.extend(ids.iter().copied());
        Ok(())
    }

    async fn get_max_current_complete_version(&self, table: &IdAndVersion) -> EngineResult<Option<u64>> {
        Ok(self
            .state
            .lock()
            .tables
            .get(&table.index_table_name())
            .and_then(|t| t.max_version))
    }

    async fn set_max_current_complete_version(&self, table: &IdAndVersion, version: u64) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.index_table_name();
        let physical = state.tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;
        physical.max_version = Some(version);
        Ok(())
    }

    async fn get_schema_hash(&self, table: &IdAndVersion) -> EngineResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .tables
            .get(&table.index_table_name())
            .and_then(|t| t.schema_hash.clone()))
    }

    async fn set_schema_hash(&self, table: &IdAndVersion, hash: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.index_table_name();
        let physical = state.tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;
        physical.schema_hash = Some(hash.to_string());
        Ok(())
    }

    async fn apply_index_plan(&self, table: &IdAndVersion, plan: &[IndexPlanEntry]) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.index_table_name();
        let physical = state.tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;
        for entry in plan {
            if let Some(info) = physical.columns.iter_mut().find(|c| c.column_name == entry.column_name) {
                info.has_index = entry.add;
                info.index_name = entry.add.then(|| format!("{}IDX", entry.column_name));
            }
        }
        if !plan.is_empty() {
            state.statements.push(format!("OPTIMIZE {name} ({} changes)", plan.len()));
        }
        Ok(())
    }

    async fn create_temporary_table_copy(&self, table: &IdAndVersion) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.index_table_name();
        let copy = state.tables.get(&name).cloned().ok_or_else(|| missing_table(&name))?;
        state.temp_tables.insert(table.temp_table_name(), copy);
        state.statements.push(format!("CREATE TABLE {} LIKE {name}", table.temp_table_name()));
        Ok(())
    }

    async fn delete_temporary_table_copy(&self, table: &IdAndVersion) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.temp_tables.remove(&table.temp_table_name());
        state.statements.push(format!("DROP TABLE IF EXISTS {}", table.temp_table_name()));
        Ok(())
    }

    async fn alter_temporary_table(&self, table: &IdAndVersion, changes: &[ColumnChangeDetails]) -> EngineResult<()> {
        let mut state = self.state.lock();
        let name = table.temp_table_name();
        let temp = state.temp_tables.get_mut(&name).ok_or_else(|| missing_table(&name))?;
        Self::alter(temp, changes);
        Ok(())
    }

    async fn temporary_column_max_length(&self, table: &IdAndVersion, column_id: u64) -> EngineResult<Option<u64>> {
        let state = self.state.lock();
        let name = table.temp_table_name();
        let temp = state.temp_tables.get(&name).ok_or_else(|| missing_table(&name))?;
        let is_list = temp
            .columns
            .iter()
            .find(|c| c.column_id() == Some(column_id))
            .and_then(|c| c.column_type)
            .is_some_and(|t| t.is_list());
        Ok(temp
            .rows
            .values()
            .filter_map(|r| r.values.get(&column_id).cloned().flatten())
            .map(|v| {
                if is_list {
                    parse_list(&v).len() as u64
                } else {
                    v.chars().count() as u64
                }
            })
            .max())
    }

    async fn replication_max_value_sizes(&self, _scope: &ViewScope) -> EngineResult<BTreeMap<String, u64>> {
        Ok(self.state.lock().replication_sizes.clone())
    }

    async fn replication_checksum(&self, _scope: &ViewScope) -> EngineResult<u64> {
        Ok(self.state.lock().replication_checksum)
    }

    async fn distinct_benefactors(
        &self,
        table: &IdAndVersion,
        benefactor_column: &str,
    ) -> EngineResult<BTreeSet<u64>> {
        let state = self.state.lock();
        match state.tables.get(&table.index_table_name()) {
            Some(t) if !t.with_benefactor => Err(EngineError::driver(format!(
                "Unknown column '{benefactor_column}' in '{}'",
                table.index_table_name()
            ))),
            Some(t) => Ok(t.benefactors.clone()),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn query_rows(&self, query: &BoundSql) -> EngineResult<RowSet> {
        self.state.lock().queries.push(query.clone());
        match self.handler.lock().as_ref() {
            Some(handler) => handler(query),
            None => Ok(RowSet::default()),
        }
    }

    async fn count(&self, query: &BoundSql) -> EngineResult<u64> {
        let result = self.query_rows(query).await?;
        let value = result
            .rows
            .first()
            .and_then(|row| row.first().cloned().flatten())
            .unwrap_or_else(|| "0".to_string());
        value
            .parse()
            .map_err(|_| EngineError::driver(format!("Count query returned a non-numeric value: {value}")))
    }
}
