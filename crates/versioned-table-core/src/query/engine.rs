//! Running queries end to end.
//!
//! [`QueryEngine::query`] resolves the queried table, checks read access,
//! and then, under a shared lock on the table holding the rows, validates
//! that its index is available, loads row-level filters, applies facet
//! selections and runs the page, count and facet queries. Rows are handed
//! to a caller supplied sink one at a time.

use std::sync::Arc;

use futures::future::try_join_all;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::cache::{CachedQueryRequest, QueryCache};
use crate::collaborators::{
    AuthorizationService, BoundSql, IndexDriver, LockService, ResultRow, RowSet, authorization::ensure_can_read,
    with_shared_lock,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::IdAndVersion;
use crate::query::ast::QuerySpec;
use crate::query::count::{CountPlan, clamp_count, count_from_rows, count_plan};
use crate::query::facet::{FacetColumnRequest, FacetColumnResult, FacetPlan, FacetQuery};
use crate::query::security::load_benefactor_filters;
use crate::query::shape::{ResolvedTables, defining_table, resolve_tables};
use crate::query::translator::{SelectColumn, TranslatedQuery, translate};
use crate::status::TableManagerSupport;

/// Which parts of a [`QueryBundle`] to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Run the page query and stream its rows.
    pub run_query: bool,
    /// Count every row the query matches.
    pub run_count: bool,
    /// Compute facet aggregates.
    pub return_facets: bool,
    /// Describe the result columns.
    pub return_select_columns: bool,
    /// Report the page size derived from the schema.
    pub return_max_rows_per_page: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            run_query: true,
            run_count: false,
            return_facets: false,
            return_select_columns: false,
            return_max_rows_per_page: false,
        }
    }
}

impl QueryOptions {
    /// Every part of the bundle.
    pub fn all() -> Self {
        Self {
            run_query: true,
            run_count: true,
            return_facets: true,
            return_select_columns: true,
            return_max_rows_per_page: true,
        }
    }
}

/// A query against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// The statement; its `LIMIT` and `OFFSET` select the rows wanted.
    pub query: QuerySpec,
    /// Facet selections narrowing the rows.
    #[serde(default)]
    pub selected_facets: Vec<FacetColumnRequest>,
    /// Parts of the bundle to compute.
    #[serde(default)]
    pub options: QueryOptions,
    /// Serve the page, count and facet queries through the query cache.
    #[serde(default)]
    pub use_cache: bool,
}

impl QueryRequest {
    /// Run `query` and stream its rows, nothing else.
    pub fn new(query: QuerySpec) -> Self {
        Self {
            query,
            selected_facets: Vec::new(),
            options: QueryOptions::default(),
            use_cache: false,
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Add facet selections.
    pub fn with_selected_facets(mut self, selections: Vec<FacetColumnRequest>) -> Self {
        self.selected_facets = selections;
        self
    }

    /// The request for the page `token` points at.
    pub fn next_page(&self, token: &NextPageToken) -> Self {
        let mut next = self.clone();
        next.query.limit = token.limit;
        next.query.offset = Some(token.offset);
        next
    }
}

/// Where the next page starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextPageToken {
    /// Rows to skip.
    pub offset: u64,
    /// Rows still wanted, when the caller set a limit.
    pub limit: Option<u64>,
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRow {
    /// Row id, for row queries against tables with an index.
    pub row_id: Option<u64>,
    /// Row version, alongside `row_id`.
    pub version_number: Option<u64>,
    /// Cells in select order.
    pub values: Vec<Option<String>>,
}

/// Everything a query produced besides its rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBundle {
    /// Etag of the last change applied to the index that was read.
    pub table_etag: Option<String>,
    /// Rows handed to the sink.
    pub row_count: u64,
    /// Rows the query matches after `LIMIT` and `OFFSET`.
    pub query_count: Option<u64>,
    /// Facet aggregates.
    pub facets: Option<Vec<FacetColumnResult>>,
    /// Result columns.
    pub select_columns: Option<Vec<SelectColumn>>,
    /// Rows that fit in one page.
    pub max_rows_per_page: Option<u64>,
    /// Set when the page was full and more rows may follow.
    pub next_page_token: Option<NextPageToken>,
}

/// Compiles and runs dialect queries.
#[derive(Clone)]
pub struct QueryEngine {
    support: TableManagerSupport,
    driver: Arc<dyn IndexDriver>,
    auth: Arc<dyn AuthorizationService>,
    locks: Arc<dyn LockService>,
    config: Arc<EngineConfig>,
    cache: Option<QueryCache>,
}

impl QueryEngine {
    /// Wire an engine over its collaborators, without a cache.
    pub fn new(
        support: TableManagerSupport,
        driver: Arc<dyn IndexDriver>,
        auth: Arc<dyn AuthorizationService>,
        locks: Arc<dyn LockService>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            support,
            driver,
            auth,
            locks,
            config,
            cache: None,
        }
    }

    /// Serve requests that ask for it through `cache`.
    pub fn with_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run `request` for `user`, streaming rows into `sink`.
    ///
    /// Fails with `Unauthorized` without read access, `TableUnavailable` or
    /// `TableFailed` when the index cannot be read, and `LockUnavailable`
    /// when the shared lock times out.
    pub async fn query(
        &self,
        user: &str,
        request: &QueryRequest,
        sink: &mut (dyn FnMut(QueryRow) -> EngineResult<()> + Send),
    ) -> EngineResult<QueryBundle> {
        let table = defining_table(&request.query)?;
        ensure_can_read(self.auth.as_ref(), user, &table).await?;
        let tables = resolve_tables(
            self.support.catalog().as_ref(),
            self.support.schema_manager(),
            &table,
        )
        .await?;
        if tables.root_table()?.schema.is_empty() {
            debug!("{table} has no columns; returning an empty result");
            return Ok(empty_bundle(&request.options));
        }
        let source = tables.source();
        with_shared_lock(
            self.locks.as_ref(),
            &source.lock_key(),
            self.config.read_lock_timeout,
            || self.query_under_lock(user, request, tables, sink),
        )
        .await
    }

    /// Run `request` and collect its rows.
    pub async fn query_rows(&self, user: &str, request: &QueryRequest) -> EngineResult<(QueryBundle, Vec<QueryRow>)> {
        let mut rows = Vec::new();
        let bundle = self
            .query(user, request, &mut |row| {
                rows.push(row);
                Ok(())
            })
            .await?;
        Ok((bundle, rows))
    }

    async fn query_under_lock(
        &self,
        user: &str,
        request: &QueryRequest,
        mut tables: ResolvedTables,
        sink: &mut (dyn FnMut(QueryRow) -> EngineResult<()> + Send),
    ) -> EngineResult<QueryBundle> {
        let source = tables.source();
        let status = self.support.validate_table_is_available(&source).await?;
        let source_table = tables.source_table_mut()?;
        source_table.benefactor_filters = load_benefactor_filters(
            &source_table.shape,
            user,
            self.driver.as_ref(),
            self.support.catalog().as_ref(),
            self.auth.as_ref(),
        )
        .await?;

        let root_schema = tables.root_table()?.schema.clone();
        let facets = FacetPlan::new(&root_schema, &request.selected_facets)?;
        let filtered = facets.filter_query(&request.query);
        let translated = translate(&filtered, &tables)?;
        let max_rows_per_page = self.support.schema_manager().max_rows_per_page(&root_schema);

        let mut bundle = QueryBundle {
            table_etag: status.last_table_change_etag.clone(),
            ..QueryBundle::default()
        };
        if request.options.run_query {
            let (row_count, next_page_token) = self
                .run_page(&translated, &request.query, max_rows_per_page, request.use_cache, sink)
                .await?;
            bundle.row_count = row_count;
            bundle.next_page_token = next_page_token;
        }
        if request.options.run_count {
            bundle.query_count = Some(self.run_count(&translated, &request.query, request.use_cache).await?);
        }
        if request.options.return_facets {
            let queries = facets.facet_queries(&request.query, &tables, self.config.facet_value_limit)?;
            bundle.facets = Some(self.run_facets(queries, request.use_cache).await?);
        }
        if request.options.return_select_columns {
            bundle.select_columns = Some(translated.select_columns.clone());
        }
        if request.options.return_max_rows_per_page {
            bundle.max_rows_per_page = Some(max_rows_per_page);
        }
        Ok(bundle)
    }

    /// Run one page of `translated` and hand its rows to `sink`.
    async fn run_page(
        &self,
        translated: &TranslatedQuery,
        original: &QuerySpec,
        max_rows_per_page: u64,
        use_cache: bool,
        sink: &mut (dyn FnMut(QueryRow) -> EngineResult<()> + Send),
    ) -> EngineResult<(u64, Option<NextPageToken>)> {
        let offset = original.offset.unwrap_or(0);
        let page_size = original.limit.map_or(max_rows_per_page, |limit| limit.min(max_rows_per_page));
        let mut page = translated.clone();
        page.query.limit = Some(page_size);
        page.query.offset = original.offset;
        let sql = page.to_bound_sql();
        let includes_row_metadata = page.includes_row_metadata;

        let mut row_count = 0u64;
        let mut forward = |row: ResultRow| -> EngineResult<()> {
            row_count += 1;
            sink(to_query_row(row, includes_row_metadata)?)
        };
        match self.cache.as_ref().filter(|_| use_cache) {
            Some(cache) => {
                let rows = cache.get_or_execute(&self.cached(sql)).await?;
                rows.rows.into_iter().try_for_each(&mut forward)?;
            }
            None => {
                self.driver.query_stream(&sql, &mut forward).await?;
            }
        }

        let wants_more = original.limit.is_none_or(|limit| limit > page_size);
        let next_page_token = (row_count == page_size && wants_more).then(|| NextPageToken {
            offset: offset + page_size,
            limit: original.limit.map(|limit| limit - page_size),
        });
        debug!("Page of {row_count} rows (page size {page_size}) from {}", translated.table);
        Ok((row_count, next_page_token))
    }

    async fn run_count(&self, translated: &TranslatedQuery, original: &QuerySpec, use_cache: bool) -> EngineResult<u64> {
        let count = match count_plan(translated) {
            CountPlan::Constant(count) => count,
            CountPlan::Query(sql) => match self.cache.as_ref().filter(|_| use_cache) {
                Some(cache) => count_from_rows(&cache.get_or_execute(&self.cached(sql)).await?)?,
                None => self.driver.count(&sql).await?,
            },
        };
        Ok(clamp_count(count, original.limit, original.offset))
    }

    async fn run_facets(&self, queries: Vec<FacetQuery>, use_cache: bool) -> EngineResult<Vec<FacetColumnResult>> {
        try_join_all(queries.iter().map(|query| async move {
            let rows = self.rows(query.sql.clone(), use_cache).await?;
            query.to_result(&rows)
        }))
        .await
    }

    async fn rows(&self, sql: BoundSql, use_cache: bool) -> EngineResult<RowSet> {
        match self.cache.as_ref().filter(|_| use_cache) {
            Some(cache) => cache.get_or_execute(&self.cached(sql)).await,
            None => self.driver.query_rows(&sql).await,
        }
    }

    fn cached(&self, sql: BoundSql) -> CachedQueryRequest {
        CachedQueryRequest::new(sql, self.config.cache_ttl)
    }

    /// Resolve `table` and its schema without running anything.
    pub async fn resolve(&self, table: &IdAndVersion) -> EngineResult<ResolvedTables> {
        resolve_tables(self.support.catalog().as_ref(), self.support.schema_manager(), table).await
    }
}

fn empty_bundle(options: &QueryOptions) -> QueryBundle {
    QueryBundle {
        query_count: options.run_count.then_some(0),
        facets: options.return_facets.then(Vec::new),
        select_columns: options.return_select_columns.then(Vec::new),
        ..QueryBundle::default()
    }
}

/// Split the trailing `ROW_ID`, `ROW_VERSION` cells off a driver row.
fn to_query_row(mut row: ResultRow, includes_row_metadata: bool) -> EngineResult<QueryRow> {
    if !includes_row_metadata {
        return Ok(QueryRow {
            row_id: None,
            version_number: None,
            values: row,
        });
    }
    if row.len() < 2 {
        return Err(EngineError::driver(format!(
            "Expected row id and version in a result row of {} cells",
            row.len()
        )));
    }
    let version_number = parse_metadata(row.pop().flatten(), "ROW_VERSION")?;
    let row_id = parse_metadata(row.pop().flatten(), "ROW_ID")?;
    Ok(QueryRow {
        row_id: Some(row_id),
        version_number: Some(version_number),
        values: row,
    })
}

fn parse_metadata(cell: Option<String>, column: &str) -> EngineResult<u64> {
    cell.as_deref()
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| EngineError::driver(format!("Invalid {column} in result row: {cell:?}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_util::*;
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::collaborators::{EngineEvent, RecordingNotifier};
    use crate::collaborators::InMemoryAuthorizationService;
    use crate::model::{ColumnDefinition, ColumnType, FacetType, TableState};

    fn cells(values: &[&str]) -> ResultRow {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    /// Answers row queries with `rows` and count queries with `count`.
    fn answer(f: &EngineFixture, rows: Vec<ResultRow>, count: &str) {
        let count = count.to_string();
        f.index.driver.set_query_handler(move |query| {
            if query.sql.starts_with("SELECT COUNT(") {
                Ok(RowSet::new(vec!["COUNT(*)"], vec![vec![Some(count.clone())]]))
            } else {
                Ok(RowSet::new(vec![], rows.clone()))
            }
        });
    }

    // ==================== Row tests ====================

    #[tokio::test]
    async fn rows_carry_their_id_version_and_the_table_etag() -> TestResult {
        let f = engine_fixture();
        f.available_table(
            vec![
                ColumnDefinition::new("a", ColumnType::Integer),
                ColumnDefinition::new("b", ColumnType::String),
            ],
            vec![vec![Some("1"), Some("x")]],
        )
        .await?;
        answer(&f, vec![cells(&["1", "x", "0", "3"])], "1");

        let request = QueryRequest::new(QuerySpec::select_star("syn1")).with_options(QueryOptions::all());
        let (bundle, rows) = f.engine.query_rows("alice", &request).await?;

        assert_eq!(
            rows,
            vec![QueryRow {
                row_id: Some(0),
                version_number: Some(3),
                values: vec![Some("1".to_string()), Some("x".to_string())],
            }]
        );
        assert_eq!(bundle.row_count, 1);
        assert_eq!(bundle.query_count, Some(1));
        assert!(bundle.table_etag.is_some());
        assert_eq!(bundle.facets, Some(Vec::new()));
        let names: Vec<&str> = bundle
            .select_columns
            .iter()
            .flatten()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        let sql = &f.index.driver.queries()[0].sql;
        assert!(sql.starts_with("SELECT _C1_, _C2_, ROW_ID, ROW_VERSION FROM T1 LIMIT"), "{sql}");
        Ok(())
    }

    #[tokio::test]
    async fn full_pages_hand_out_a_next_page_token() -> TestResult {
        let f = engine_fixture_with_config(EngineConfig {
            max_bytes_per_request: 40,
            ..EngineConfig::default()
        });
        f.available_table(
            vec![ColumnDefinition::new("a", ColumnType::Integer)],
            vec![vec![Some("1")], vec![Some("2")], vec![Some("3")]],
        )
        .await?;
        answer(&f, vec![cells(&["1", "0", "0"]), cells(&["2", "1", "0"])], "3");

        let request = QueryRequest::new(QuerySpec::select_star("syn1"));
        let (bundle, rows) = f.engine.query_rows("alice", &request).await?;

        assert_eq!(rows.len(), 2);
        let token = bundle.next_page_token.expect("full page");
        assert_eq!(token, NextPageToken { offset: 2, limit: None });
        let next = request.next_page(&token);
        f.engine.query_rows("alice", &next).await?;
        let sql = f.index.driver.queries().last().map(|q| q.sql.clone()).unwrap_or_default();
        assert!(sql.ends_with("LIMIT 2 OFFSET 2"), "{sql}");
        Ok(())
    }

    #[tokio::test]
    async fn a_caller_limit_below_the_page_size_ends_paging() -> TestResult {
        let f = engine_fixture();
        f.available_table(vec![ColumnDefinition::new("a", ColumnType::Integer)], vec![vec![Some("1")]])
            .await?;
        answer(&f, vec![cells(&["1", "0", "0"])], "5");

        let query = QuerySpec::select_star("syn1").with_pagination(Some(1), Some(2));
        let request = QueryRequest::new(query).with_options(QueryOptions {
            run_count: true,
            ..QueryOptions::default()
        });
        let (bundle, _) = f.engine.query_rows("alice", &request).await?;

        assert_eq!(bundle.next_page_token, None);
        assert_eq!(bundle.query_count, Some(1));
        Ok(())
    }

    // ==================== Preflight tests ====================

    #[tokio::test]
    async fn readers_need_read_access() -> TestResult {
        let f = engine_fixture();
        let engine = QueryEngine::new(
            f.index.builder.support().clone(),
            f.index.driver.clone(),
            Arc::new(InMemoryAuthorizationService::new()),
            f.index.locks.clone(),
            Arc::new(EngineConfig::default()),
        );
        let err = engine
            .query_rows("mallory", &QueryRequest::new(QuerySpec::select_star("syn1")))
            .await
            .expect_err("no access");
        assert!(matches!(err, EngineError::Unauthorized { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn tables_without_columns_return_nothing() -> TestResult {
        let f = engine_fixture();
        let request = QueryRequest::new(QuerySpec::select_star("syn1")).with_options(QueryOptions::all());
        let (bundle, rows) = f.engine.query_rows("alice", &request).await?;

        assert!(rows.is_empty());
        assert_eq!(bundle.query_count, Some(0));
        assert!(f.index.driver.queries().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn processing_tables_are_unavailable() -> TestResult {
        let f = engine_fixture();
        let table = IdAndVersion::current(1);
        let schema = f
            .index
            .schema
            .create_column_models(vec![ColumnDefinition::new("a", ColumnType::Integer)])
            .await?;
        f.index.set_schema(&table, &schema).await?;

        let err = f
            .engine
            .query_rows("alice", &QueryRequest::new(QuerySpec::select_star("syn1")))
            .await
            .expect_err("still processing");
        match err {
            EngineError::TableUnavailable { status, .. } => assert_eq!(status.state, TableState::Processing),
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    // ==================== Facet tests ====================

    #[tokio::test]
    async fn facets_run_next_to_the_query() -> TestResult {
        let f = engine_fixture();
        f.available_table(
            vec![
                ColumnDefinition::new("size", ColumnType::Integer).with_facet(FacetType::Range),
                ColumnDefinition::new("kind", ColumnType::String).with_facet(FacetType::Enumeration),
            ],
            vec![vec![Some("4"), Some("a")], vec![Some("9"), Some("b")]],
        )
        .await?;
        f.index.driver.set_query_handler(|query| {
            Ok(if query.sql.starts_with("SELECT MIN(") {
                RowSet::new(vec!["minimum", "maximum"], vec![vec![Some("4".into()), Some("9".into())]])
            } else if query.sql.starts_with("SELECT _C2_ AS value") {
                RowSet::new(vec!["value", "frequency"], vec![vec![Some("a".into()), Some("1".into())]])
            } else {
                RowSet::default()
            })
        });

        let request = QueryRequest::new(QuerySpec::select_star("syn1"))
            .with_options(QueryOptions {
                run_query: false,
                return_facets: true,
                ..QueryOptions::default()
            })
            .with_selected_facets(vec![FacetColumnRequest::values("kind", ["a"])]);
        let (bundle, _) = f.engine.query_rows("alice", &request).await?;

        let facets = bundle.facets.expect("facets");
        assert_eq!(facets.len(), 2);
        assert!(matches!(
            &facets[0],
            FacetColumnResult::Range { column_min: Some(min), column_max: Some(max), .. } if min == "4" && max == "9"
        ));
        let FacetColumnResult::Enumeration { facet_values, .. } = &facets[1] else {
            panic!("expected value counts");
        };
        assert!(facet_values[0].is_selected);
        let range_sql = f
            .index
            .driver
            .queries()
            .into_iter()
            .find(|q| q.sql.starts_with("SELECT MIN("))
            .map(|q| q.sql)
            .unwrap_or_default();
        assert!(range_sql.ends_with("WHERE ((_C2_ = :b0))"), "{range_sql}");
        Ok(())
    }

    // ==================== Cache tests ====================

    #[tokio::test]
    async fn cached_requests_run_once() -> TestResult {
        let f = engine_fixture();
        f.available_table(vec![ColumnDefinition::new("a", ColumnType::Integer)], vec![vec![Some("1")]])
            .await?;
        answer(&f, vec![cells(&["1", "0", "0"])], "1");
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = f.engine.clone().with_cache(QueryCache::new(
            Arc::new(InMemoryCacheStore::new()),
            f.index.driver.clone(),
            notifier.clone(),
        ));
        let mut request = QueryRequest::new(QuerySpec::select_star("syn1"));
        request.use_cache = true;

        let (_, first) = engine.query_rows("alice", &request).await?;
        let (_, second) = engine.query_rows("alice", &request).await?;

        assert_eq!(first, second);
        assert_eq!(f.index.driver.queries().len(), 1);
        assert!(matches!(notifier.events().as_slice(), [EngineEvent::CacheHit { .. }]));
        Ok(())
    }

    #[test]
    fn metadata_cells_must_be_numeric() {
        assert!(to_query_row(cells(&["a", "x", "1"]), true).is_err());
        let row = to_query_row(cells(&["a"]), false).expect("plain row");
        assert_eq!(row.row_id, None);
    }
}
