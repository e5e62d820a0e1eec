use super::*;
use crate::changelog::{ChangeLog, InMemoryChangeLog};
use crate::collaborators::{InMemoryIndexDriver, InMemoryLockService, InMemoryTableCatalog, RecordingNotifier};
use crate::model::{
    ChangePayload, ChangeRecord, ColumnChange, ColumnModel, IdAndVersion, IndexShapeDescription, SchemaChange,
    SparseChangeSet, SparseRow,
};
use crate::schema::InMemoryColumnModelStore;
use crate::status::InMemoryTableStatusStore;

pub(crate) type TestResult = Result<(), Box<dyn std::error::Error>>;

pub(crate) struct Fixture {
    pub(crate) builder: IndexBuilder,
    pub(crate) schema: SchemaManager,
    pub(crate) log: Arc<InMemoryChangeLog>,
    pub(crate) driver: Arc<InMemoryIndexDriver>,
    pub(crate) catalog: Arc<InMemoryTableCatalog>,
    pub(crate) locks: Arc<InMemoryLockService>,
    pub(crate) notifier: Arc<RecordingNotifier>,
}

/// Builder over in-memory collaborators with `syn1` registered as a plain table.
pub(crate) fn fixture() -> Fixture {
    fixture_with_config(EngineConfig::default())
}

pub(crate) fn fixture_with_config(config: EngineConfig) -> Fixture {
    let config = Arc::new(config);
    let log = Arc::new(InMemoryChangeLog::new());
    let driver = Arc::new(InMemoryIndexDriver::new());
    let catalog = Arc::new(InMemoryTableCatalog::new());
    let locks = Arc::new(InMemoryLockService::new());
    let notifier = Arc::new(RecordingNotifier::new());
    catalog.register(IndexShapeDescription::PlainTable {
        table: IdAndVersion::current(1),
    });
    let schema = SchemaManager::new(Arc::new(InMemoryColumnModelStore::new()), config.clone());
    let support = TableManagerSupport::new(
        Arc::new(InMemoryTableStatusStore::new()),
        log.clone(),
        driver.clone(),
        catalog.clone(),
        notifier.clone(),
        schema.clone(),
    );
    let builder = IndexBuilder::new(support, driver.clone(), locks.clone(), config);
    Fixture {
        builder,
        schema,
        log,
        driver,
        catalog,
        locks,
        notifier,
    }
}

impl Fixture {
    /// Append a COLUMN change adding `columns` to `table` and bind them.
    pub(crate) async fn set_schema(
        &self,
        table: &IdAndVersion,
        columns: &[ColumnModel],
    ) -> Result<ChangeRecord, Box<dyn std::error::Error>> {
        let ids: Vec<u64> = columns.iter().map(|c| c.id).collect();
        self.schema.bind_columns_to_table(table, &ids).await?;
        let record = self
            .log
            .append_change(
                table.id,
                "tester",
                None,
                ChangePayload::Column(SchemaChange {
                    changes: ids.iter().copied().map(ColumnChange::add).collect(),
                    new_schema_ids: ids,
                }),
            )
            .await?;
        Ok(record)
    }

    /// Append a ROW change holding `rows` against `schema`.
    pub(crate) async fn append_rows(
        &self,
        table: &IdAndVersion,
        schema: &[ColumnModel],
        rows: Vec<SparseRow>,
    ) -> Result<ChangeRecord, Box<dyn std::error::Error>> {
        let mut set = SparseChangeSet::new(table.id, schema.to_vec());
        for row in rows {
            set.add_row(row);
        }
        Ok(self
            .log
            .append_change(table.id, "tester", None, ChangePayload::Row(set))
            .await?)
    }
}
