//! Table-store backend over a [`TableClient`].

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use dblayer_core::{
    backend::{CollectionAdapter, RecordStream, StoreBackend, StoreBackendBuilder},
    entity::{EntityKey, Record, WILDCARD_ETAG},
    error::{DataStoreError, DataStoreResult},
    eval,
    query::{Projection, Query},
};

use crate::{
    client::{
        ContinuationToken, MAX_BATCH_OPERATIONS, MAX_PAGE_SIZE, RESERVED_PROPERTIES, TableClient,
        TableEntity, TableError, TableFilter, TableOperation, TableQuery,
    },
    emulator::MemoryTableClient,
    odata,
};

/// Settings for [`TableStore`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    /// Prepended to every physical table name.
    pub table_prefix: String,
    /// Keys fetched and deleted per round of a predicate delete, at most
    /// [`MAX_BATCH_OPERATIONS`].
    pub batch_size: usize,
    /// Entities requested per query segment, at most [`MAX_PAGE_SIZE`].
    pub page_size: usize,
    /// Create each table on first use.
    pub create_tables: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            batch_size: MAX_BATCH_OPERATIONS,
            page_size: MAX_PAGE_SIZE,
            create_tables: true,
        }
    }
}

/// Derives a valid physical table name from a logical collection name.
///
/// Table names are 3 to 63 ASCII alphanumerics starting with a letter; everything
/// else is dropped, a leading `t` is added when needed and short names are padded.
pub fn physical_table_name(prefix: &str, name: &str) -> String {
    let mut table = prefix
        .chars()
        .chain(name.chars())
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>();

    if !table.starts_with(|c: char| c.is_ascii_alphabetic()) {
        table.insert(0, 't');
    }
    while table.len() < 3 {
        table.push('0');
    }
    table.truncate(63);
    table
}

fn store_error(collection: &str, operation: &'static str, err: TableError) -> DataStoreError {
    match err.root() {
        TableError::EntityAlreadyExists(key) => {
            DataStoreError::conflict(collection, key, "an entity with this key already exists")
        }
        TableError::PreconditionFailed(key) => {
            DataStoreError::conflict(collection, key, "the concurrency token does not match")
        }
        TableError::ResourceNotFound(key) => DataStoreError::not_found(collection, key),
        _ => DataStoreError::adapter(operation, collection, err),
    }
}

/// Storage backend over a table service.
///
/// Each collection is one table. Filters the service understands are rendered as
/// OData; the rest of a query, including ordering and `skip`, runs in-process over
/// the streamed segments.
#[derive(Debug, Clone)]
pub struct TableStore {
    client: Arc<dyn TableClient>,
    options: TableOptions,
}

impl TableStore {
    pub fn new(client: Arc<dyn TableClient>, options: TableOptions) -> Self {
        Self { client, options }
    }

    pub fn builder() -> TableStoreBuilder {
        TableStoreBuilder::default()
    }

    pub fn client(&self) -> &Arc<dyn TableClient> {
        &self.client
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }
}

#[async_trait]
impl StoreBackend for TableStore {
    async fn initialize(&self) -> DataStoreResult<()> {
        self.client
            .ping()
            .await
            .map_err(|e| DataStoreError::Connection(e.to_string()))?;

        info!(prefix = %self.options.table_prefix, "table service reachable");
        Ok(())
    }

    fn open_collection(&self, name: &str) -> DataStoreResult<Arc<dyn CollectionAdapter>> {
        let table = physical_table_name(&self.options.table_prefix, name);
        debug!(collection = name, table = %table, "created table collection");

        Ok(Arc::new(TableCollection {
            name: name.to_string(),
            table,
            client: self.client.clone(),
            ready: OnceCell::new(),
            create_table: self.options.create_tables,
            batch_size: self.options.batch_size.clamp(1, MAX_BATCH_OPERATIONS),
            page_size: self.options.page_size.clamp(1, MAX_PAGE_SIZE),
        }))
    }
}

/// Adapter over one table.
#[derive(Debug)]
pub struct TableCollection {
    name: String,
    table: String,
    client: Arc<dyn TableClient>,
    ready: OnceCell<()>,
    create_table: bool,
    batch_size: usize,
    page_size: usize,
}

impl TableCollection {
    pub fn table(&self) -> &str {
        &self.table
    }

    async fn ensure_table(&self) -> DataStoreResult<()> {
        if !self.create_table {
            return Ok(());
        }

        self.ready
            .get_or_try_init(|| async {
                let created = self
                    .client
                    .create_table_if_not_exists(&self.table)
                    .await
                    .map_err(|e| self.error("create_table", e))?;
                if created {
                    info!(collection = %self.name, table = %self.table, "created table");
                }
                Ok::<_, DataStoreError>(())
            })
            .await?;

        Ok(())
    }

    fn error(&self, operation: &'static str, err: TableError) -> DataStoreError {
        store_error(&self.name, operation, err)
    }

    fn to_entity(record: &Record) -> TableEntity {
        let mut properties = record.body.clone();
        for name in RESERVED_PROPERTIES {
            properties.remove(name);
        }
        TableEntity::new(&record.key, properties)
    }

    fn to_record(entity: TableEntity) -> Record {
        Record::new(entity.key(), entity.properties).with_etag(entity.etag)
    }

    async fn execute(&self, operation: &'static str, op: TableOperation) -> DataStoreResult<Option<Record>> {
        self.ensure_table().await?;
        self.client
            .execute(&self.table, op)
            .await
            .map(|entity| entity.map(Self::to_record))
            .map_err(|e| self.error(operation, e))
    }

    async fn write(&self, operation: &'static str, op: TableOperation) -> DataStoreResult<Record> {
        self.execute(operation, op).await?.ok_or_else(|| {
            DataStoreError::adapter(operation, &self.name, "the service returned no entity")
        })
    }

    /// Groups operations by partition, in first-seen order, and chunks each group
    /// to the service's batch limit.
    fn batches(operations: Vec<TableOperation>) -> Vec<Vec<TableOperation>> {
        let mut groups: Vec<Vec<TableOperation>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for op in operations {
            let slot = *index.entry(op.partition_key().to_string()).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(op);
        }

        groups
            .into_iter()
            .flat_map(|group| {
                let mut chunks: Vec<Vec<TableOperation>> = Vec::new();
                let mut group = group.into_iter().peekable();
                while group.peek().is_some() {
                    chunks.push(group.by_ref().take(MAX_BATCH_OPERATIONS).collect());
                }
                chunks
            })
            .collect()
    }

    /// Commits batches in order and returns the number of operations applied.
    ///
    /// Stops at the first failing batch; earlier batches stay committed.
    async fn execute_batches(
        &self,
        operation: &'static str,
        operations: Vec<TableOperation>,
    ) -> DataStoreResult<usize> {
        if operations.is_empty() {
            return Ok(0);
        }
        self.ensure_table().await?;

        let mut committed = 0;
        for batch in Self::batches(operations) {
            committed += self
                .client
                .execute_batch(&self.table, batch)
                .await
                .map_err(|e| self.error(operation, e))?
                .len();
        }

        Ok(committed)
    }

    async fn delete_one(&self, key: EntityKey) -> DataStoreResult<bool> {
        let op = TableOperation::Delete {
            key,
            if_match: WILDCARD_ETAG.to_string(),
        };

        match self.client.execute(&self.table, op).await {
            Ok(_) => Ok(true),
            Err(TableError::ResourceNotFound(_)) => Ok(false),
            Err(err) => Err(self.error("delete", err)),
        }
    }
}

#[async_trait]
impl CollectionAdapter for TableCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn insert(&self, record: Record) -> DataStoreResult<Record> {
        self.write("insert", TableOperation::Insert(Self::to_entity(&record)))
            .await
    }

    async fn insert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        let ops = records
            .iter()
            .map(|record| TableOperation::Insert(Self::to_entity(record)))
            .collect();
        self.execute_batches("insert_many", ops).await
    }

    async fn upsert(&self, record: Record) -> DataStoreResult<Record> {
        self.write("upsert", TableOperation::InsertOrReplace(Self::to_entity(&record)))
            .await
    }

    async fn upsert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        let ops = records
            .iter()
            .map(|record| TableOperation::InsertOrReplace(Self::to_entity(record)))
            .collect();
        self.execute_batches("upsert_many", ops).await
    }

    async fn update(&self, record: Record) -> DataStoreResult<Record> {
        let op = TableOperation::Replace {
            entity: Self::to_entity(&record),
            if_match: record.etag_or_wildcard().to_string(),
        };
        self.write("update", op).await
    }

    async fn update_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        let ops = records
            .iter()
            .map(|record| TableOperation::Replace {
                entity: Self::to_entity(record),
                if_match: record.etag_or_wildcard().to_string(),
            })
            .collect();
        self.execute_batches("update_many", ops).await
    }

    async fn delete(&self, key: &EntityKey) -> DataStoreResult<bool> {
        self.ensure_table().await?;
        self.delete_one(key.clone()).await
    }

    async fn delete_many(&self, keys: Vec<EntityKey>) -> DataStoreResult<usize> {
        let mut seen = HashSet::with_capacity(keys.len());
        let ops = keys
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .map(|key| TableOperation::Delete {
                key,
                if_match: WILDCARD_ETAG.to_string(),
            })
            .collect::<Vec<_>>();

        if ops.is_empty() {
            return Ok(0);
        }
        self.ensure_table().await?;

        let mut removed = 0;
        for batch in Self::batches(ops) {
            let size = batch.len();
            match self.client.execute_batch(&self.table, batch.clone()).await {
                Ok(results) => removed += results.len(),
                Err(err) if matches!(err.root(), TableError::ResourceNotFound(_)) => {
                    warn!(
                        collection = %self.name,
                        batch = size,
                        error = %err,
                        "batch delete hit a missing entity, deleting one by one"
                    );
                    for op in batch {
                        if let TableOperation::Delete { key, .. } = op {
                            if self.delete_one(key).await? {
                                removed += 1;
                            }
                        }
                    }
                }
                Err(err) => return Err(self.error("delete_many", err)),
            }
        }

        Ok(removed)
    }

    async fn get(&self, key: &EntityKey) -> DataStoreResult<Option<Record>> {
        self.execute("get", TableOperation::Retrieve(key.clone())).await
    }

    async fn query(&self, query: Query) -> DataStoreResult<RecordStream> {
        self.ensure_table().await?;

        let split = odata::split_conditions(&query.conditions);
        let local = !split.residual.is_empty() || !query.order.is_empty();

        debug!(
            collection = %self.name,
            filter = split.native.as_ref().map(|(text, _)| text.as_str()),
            residual = split.residual.len(),
            "planned table query"
        );

        // Without local work the window bounds how much the service needs to return.
        let wanted = match (local, query.take) {
            (false, Some(take)) => query.skip.saturating_add(take).max(1),
            _ => usize::MAX,
        };

        let base = TableQuery {
            filter: split
                .native
                .map(|(text, expr)| TableFilter { text, expr }),
            select_keys_only: query.projection == Projection::KeysOnly && !local,
            top: Some(self.page_size.min(wanted)),
            continuation: None,
        };

        let client = self.client.clone();
        let table = self.table.clone();
        let name = self.name.clone();

        let segments = stream::try_unfold(Some(base), move |state| {
            let client = client.clone();
            let table = table.clone();
            let name = name.clone();
            async move {
                let Some(request) = state else {
                    return Ok(None);
                };

                let segment = client
                    .query(&table, &request)
                    .await
                    .map_err(|e| store_error(&name, "query", e))?;

                let next = segment.continuation.map(|token: ContinuationToken| TableQuery {
                    continuation: Some(token),
                    ..request
                });
                let records = segment
                    .entities
                    .into_iter()
                    .map(|entity| Ok::<_, DataStoreError>(Self::to_record(entity)))
                    .collect::<Vec<_>>();

                Ok::<_, DataStoreError>(Some((stream::iter(records), next)))
            }
        });

        Ok(eval::refine_stream(
            segments.try_flatten().boxed(),
            &query,
            split.residual,
        ))
    }
}

/// Builder for [`TableStore`].
///
/// ```ignore
/// use dblayer::{backend::StoreBackendBuilder, table::{TableStore, MemoryTableClient}};
///
/// let store = TableStore::builder()
///     .client(Arc::new(MemoryTableClient::new()))
///     .table_prefix("prod")
///     .build()
///     .await?;
/// ```
#[derive(Debug, Default)]
pub struct TableStoreBuilder {
    client: Option<Arc<dyn TableClient>>,
    options: TableOptions,
}

impl TableStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(mut self, client: Arc<dyn TableClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Uses a fresh in-process [`MemoryTableClient`].
    pub fn emulator(self) -> Self {
        self.client(Arc::new(MemoryTableClient::new()))
    }

    pub fn options(mut self, options: TableOptions) -> Self {
        self.options = options;
        self
    }

    pub fn table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.table_prefix = prefix.into();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.options.batch_size = batch_size;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.options.page_size = page_size;
        self
    }

    pub fn create_tables(mut self, create: bool) -> Self {
        self.options.create_tables = create;
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for TableStoreBuilder {
    type Backend = TableStore;

    async fn build(self) -> DataStoreResult<Self::Backend> {
        let client = self.client.ok_or_else(|| {
            DataStoreError::Connection("no table client configured".to_string())
        })?;

        Ok(TableStore::new(client, self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use dblayer_core::query::{Filter, SortDirection};

    fn record(pk: &str, rk: &str, n: i32) -> Record {
        Record::new(EntityKey::new(pk, rk), doc! { "n": n })
    }

    async fn open(page_size: usize) -> (Arc<MemoryTableClient>, Arc<dyn CollectionAdapter>) {
        let client = Arc::new(MemoryTableClient::new().with_page_size(page_size));
        let store = TableStore::builder()
            .client(client.clone())
            .table_prefix("test")
            .build()
            .await
            .unwrap();
        store.initialize().await.unwrap();
        (client, store.open_collection("app::Reading").unwrap())
    }

    async fn collect(adapter: &Arc<dyn CollectionAdapter>, query: Query) -> Vec<Record> {
        adapter.query(query).await.unwrap().try_collect().await.unwrap()
    }

    #[test]
    fn table_names_are_sanitized() {
        assert_eq!(physical_table_name("", "app::models::Order"), "appmodelsOrder");
        assert_eq!(physical_table_name("", "42-things"), "t42things");
        assert_eq!(physical_table_name("", "a"), "a00");
        assert_eq!(physical_table_name("prod", "x"), "prodx");
        assert_eq!(physical_table_name("", &"n".repeat(100)).len(), 63);
    }

    #[tokio::test]
    async fn tables_are_created_on_first_use() {
        let (client, adapter) = open(MAX_PAGE_SIZE).await;
        assert!(client.table_names().is_empty());

        adapter.upsert(record("p", "1", 1)).await.unwrap();
        assert_eq!(client.table_names(), vec!["testappReading".to_string()]);
    }

    #[tokio::test]
    async fn tokens_guard_updates() {
        let (_, adapter) = open(MAX_PAGE_SIZE).await;

        let stored = adapter.insert(record("p", "1", 1)).await.unwrap();
        let etag = stored.etag.clone().unwrap();
        assert!(adapter.insert(record("p", "1", 1)).await.unwrap_err().is_conflict());

        let updated = adapter
            .update(record("p", "1", 2).with_etag(Some(etag.clone())))
            .await
            .unwrap();
        assert_ne!(updated.etag, Some(etag.clone()));

        let stale = adapter.update(record("p", "1", 3).with_etag(Some(etag))).await;
        assert!(stale.unwrap_err().is_conflict());

        let forced = adapter.update(record("p", "1", 4)).await.unwrap();
        assert_eq!(forced.body, doc! { "n": 4 });

        assert!(adapter.update(record("p", "9", 0)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn batches_split_by_partition_and_limit() {
        let (client, adapter) = open(MAX_PAGE_SIZE).await;

        let records = (0..150)
            .map(|i| record(if i % 3 == 0 { "a" } else { "b" }, &format!("{i:03}"), i))
            .collect();
        assert_eq!(adapter.insert_many(records).await.unwrap(), 150);
        assert_eq!(client.batch_sizes(), vec![50, 100]);

        let more = (150..260).map(|i| record("b", &format!("{i:03}"), i)).collect();
        assert_eq!(adapter.upsert_many(more).await.unwrap(), 110);
        assert_eq!(client.batch_sizes(), vec![50, 100, 100, 10]);
    }

    #[tokio::test]
    async fn batch_delete_falls_back_when_rows_are_missing() {
        let (_, adapter) = open(MAX_PAGE_SIZE).await;
        adapter
            .upsert_many(vec![record("p", "1", 1), record("p", "2", 2)])
            .await
            .unwrap();

        let keys = vec![
            EntityKey::new("p", "1"),
            EntityKey::new("p", "404"),
            EntityKey::new("p", "2"),
            EntityKey::new("p", "1"),
        ];
        assert_eq!(adapter.delete_many(keys).await.unwrap(), 2);
        assert_eq!(adapter.count(Vec::new()).await.unwrap(), 0);
        assert!(!adapter.delete(&EntityKey::new("p", "1")).await.unwrap());
    }

    #[tokio::test]
    async fn queries_stream_across_segments() {
        let (_, adapter) = open(3).await;
        let records = (0..10).map(|i| record("p", &format!("{i:02}"), i)).collect();
        adapter.upsert_many(records).await.unwrap();

        let all = collect(&adapter, Query::all()).await;
        assert_eq!(all.len(), 10);
        assert!(all.iter().all(|r| r.etag.is_some()));

        let window = collect(&adapter, Query::builder().skip(4).take(3).build()).await;
        let ns = window.iter().map(|r| r.body.get_i32("n").unwrap()).collect::<Vec<_>>();
        assert_eq!(ns, vec![4, 5, 6]);

        let mixed = collect(
            &adapter,
            Query::builder()
                .filter(Filter::gte("n", 2).and(Filter::ends_with("RowKey", "5").not()))
                .order_by("n", SortDirection::Desc)
                .take(3)
                .build(),
        )
        .await;
        let ns = mixed.iter().map(|r| r.body.get_i32("n").unwrap()).collect::<Vec<_>>();
        assert_eq!(ns, vec![9, 8, 7]);

        let keys = collect(&adapter, Query::builder().filter(Filter::lt("n", 2)).keys_only().build()).await;
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|r| r.body.is_empty()));

        assert_eq!(adapter.count(vec![Filter::gt("n", 6).into()]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unreachable_service_fails_initialize() {
        let client = Arc::new(MemoryTableClient::new());
        client.set_reachable(false);
        let store = TableStore::builder().client(client).build().await.unwrap();

        assert!(matches!(store.initialize().await, Err(DataStoreError::Connection(_))));
        assert!(matches!(
            TableStore::builder().build().await,
            Err(DataStoreError::Connection(_))
        ));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: TableOptions = serde_json::from_str(r#"{ "table_prefix": "prod" }"#).unwrap();
        assert_eq!(options.table_prefix, "prod");
        assert_eq!(options.batch_size, MAX_BATCH_OPERATIONS);
        assert_eq!(options.page_size, MAX_PAGE_SIZE);
        assert!(options.create_tables);
    }
}
