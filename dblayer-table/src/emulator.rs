//! An in-process table service.
//!
//! [`MemoryTableClient`] follows the service's observable rules: writes assign a
//! fresh etag and timestamp, conditional replace and delete check `If-Match`,
//! batches are limited to one partition and [`MAX_BATCH_OPERATIONS`] distinct rows
//! and apply atomically, and queries return key-ordered segments of at most
//! [`MAX_PAGE_SIZE`] entities with a continuation token.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
};
use uuid::Uuid;

use dblayer_core::{
    entity::{EntityKey, Record, WILDCARD_ETAG},
    eval::RecordEvaluator,
};

use crate::client::{
    ContinuationToken, MAX_BATCH_OPERATIONS, MAX_PAGE_SIZE, QuerySegment, RESERVED_PROPERTIES,
    TableClient, TableEntity, TableError, TableOperation, TableQuery, TableResult,
};

type Rows = BTreeMap<EntityKey, TableEntity>;

/// Thread-safe emulator of a table service.
#[derive(Debug)]
pub struct MemoryTableClient {
    tables: Mutex<HashMap<String, Rows>>,
    page_size: usize,
    reachable: AtomicBool,
    batch_sizes: Mutex<Vec<usize>>,
}

impl Default for MemoryTableClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTableClient {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            page_size: MAX_PAGE_SIZE,
            reachable: AtomicBool::new(true),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    /// Caps every query segment at `page_size` entities.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Makes `ping` fail, as if the service could not be reached.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Sizes of the batches committed so far, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names = self.tables.lock().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&mut Rows) -> TableResult<T>) -> TableResult<T> {
        let mut tables = self.tables.lock();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        f(rows)
    }

    fn stamp(mut entity: TableEntity) -> TableEntity {
        for name in RESERVED_PROPERTIES {
            entity.properties.remove(name);
        }
        entity.etag = Some(format!("W/\"{}\"", Uuid::new_v4()));
        entity.timestamp = Some(Utc::now());
        entity
    }

    fn check_etag(current: &TableEntity, if_match: &str) -> TableResult<()> {
        if if_match == WILDCARD_ETAG || current.etag.as_deref() == Some(if_match) {
            Ok(())
        } else {
            Err(TableError::PreconditionFailed(current.key()))
        }
    }

    fn apply(rows: &mut Rows, operation: TableOperation) -> TableResult<Option<TableEntity>> {
        match operation {
            TableOperation::Insert(entity) => {
                let key = entity.key();
                if rows.contains_key(&key) {
                    return Err(TableError::EntityAlreadyExists(key));
                }
                let stored = Self::stamp(entity);
                rows.insert(key, stored.clone());
                Ok(Some(stored))
            }
            TableOperation::InsertOrReplace(entity) => {
                let stored = Self::stamp(entity);
                rows.insert(stored.key(), stored.clone());
                Ok(Some(stored))
            }
            TableOperation::Replace { entity, if_match } => {
                let key = entity.key();
                let current = rows
                    .get(&key)
                    .ok_or_else(|| TableError::ResourceNotFound(key.clone()))?;
                Self::check_etag(current, &if_match)?;

                let stored = Self::stamp(entity);
                rows.insert(key, stored.clone());
                Ok(Some(stored))
            }
            TableOperation::Delete { key, if_match } => {
                let current = rows
                    .get(&key)
                    .ok_or_else(|| TableError::ResourceNotFound(key.clone()))?;
                Self::check_etag(current, &if_match)?;

                rows.remove(&key);
                Ok(None)
            }
            TableOperation::Retrieve(key) => Ok(rows.get(&key).cloned()),
        }
    }

    fn validate_batch(operations: &[TableOperation]) -> TableResult<()> {
        let Some(first) = operations.first() else {
            return Err(TableError::InvalidBatch("a batch needs at least one operation".into()));
        };

        if operations.len() > MAX_BATCH_OPERATIONS {
            return Err(TableError::InvalidBatch(format!(
                "{} operations exceed the limit of {MAX_BATCH_OPERATIONS}",
                operations.len()
            )));
        }

        let mut rows = HashSet::with_capacity(operations.len());
        for operation in operations {
            if operation.partition_key() != first.partition_key() {
                return Err(TableError::InvalidBatch(
                    "all operations must target the same partition".into(),
                ));
            }
            if !rows.insert(operation.row_key()) {
                return Err(TableError::InvalidBatch(format!(
                    "row {} appears more than once",
                    operation.row_key()
                )));
            }
            if matches!(operation, TableOperation::Retrieve(_)) && operations.len() > 1 {
                return Err(TableError::InvalidBatch(
                    "a retrieve must be the only operation of its batch".into(),
                ));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TableClient for MemoryTableClient {
    async fn ping(&self) -> TableResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TableError::Transport("table service unreachable".into()))
        }
    }

    async fn create_table_if_not_exists(&self, table: &str) -> TableResult<bool> {
        let mut tables = self.tables.lock();
        if tables.contains_key(table) {
            return Ok(false);
        }
        tables.insert(table.to_string(), Rows::new());
        Ok(true)
    }

    async fn execute(&self, table: &str, operation: TableOperation) -> TableResult<Option<TableEntity>> {
        self.with_table(table, |rows| Self::apply(rows, operation))
    }

    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> TableResult<Vec<Option<TableEntity>>> {
        Self::validate_batch(&operations)?;
        let size = operations.len();

        let results = self.with_table(table, |rows| {
            let mut undo: Vec<(EntityKey, Option<TableEntity>)> = Vec::with_capacity(size);
            let mut results = Vec::with_capacity(size);

            for (index, operation) in operations.into_iter().enumerate() {
                let key = EntityKey::new(operation.partition_key(), operation.row_key());
                let previous = rows.get(&key).cloned();

                match Self::apply(rows, operation) {
                    Ok(result) => {
                        undo.push((key, previous));
                        results.push(result);
                    }
                    Err(err) => {
                        for (key, previous) in undo.into_iter().rev() {
                            match previous {
                                Some(entity) => rows.insert(key, entity),
                                None => rows.remove(&key),
                            };
                        }
                        return Err(TableError::Batch { index, source: Box::new(err) });
                    }
                }
            }

            Ok(results)
        })?;

        self.batch_sizes.lock().push(size);
        Ok(results)
    }

    async fn query(&self, table: &str, query: &TableQuery) -> TableResult<QuerySegment> {
        let limit = query.top.unwrap_or(MAX_PAGE_SIZE).clamp(1, self.page_size);
        let start = query
            .continuation
            .as_ref()
            .map(|token| EntityKey::new(&token.next_partition_key, &token.next_row_key))
            .unwrap_or_default();

        self.with_table(table, |rows| {
            let mut entities = Vec::new();
            let mut continuation = None;

            for (key, entity) in rows.range(start..) {
                if entities.len() == limit {
                    continuation = Some(ContinuationToken {
                        next_partition_key: key.partition_key.clone(),
                        next_row_key: key.row_key.clone(),
                    });
                    break;
                }

                if let Some(filter) = &query.filter {
                    let record = Record::new(key.clone(), entity.properties.clone());
                    let matched = RecordEvaluator::new(&record)
                        .evaluate(&filter.expr)
                        .map_err(|e| TableError::InvalidQuery(e.to_string()))?;
                    if !matched {
                        continue;
                    }
                }

                let mut entity = entity.clone();
                if query.select_keys_only {
                    entity.properties.clear();
                }
                entities.push(entity);
            }

            Ok(QuerySegment { entities, continuation })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TableFilter;
    use bson::doc;
    use dblayer_core::query::Filter;

    const TABLE: &str = "things";

    fn entity(pk: &str, rk: &str, n: i32) -> TableEntity {
        TableEntity::new(&EntityKey::new(pk, rk), doc! { "n": n })
    }

    async fn client() -> MemoryTableClient {
        let client = MemoryTableClient::new();
        assert!(client.create_table_if_not_exists(TABLE).await.unwrap());
        assert!(!client.create_table_if_not_exists(TABLE).await.unwrap());
        client
    }

    #[tokio::test]
    async fn writes_assign_fresh_etags() {
        let client = client().await;

        let first = client
            .execute(TABLE, TableOperation::Insert(entity("p", "1", 1)))
            .await
            .unwrap()
            .unwrap();
        let etag = first.etag.clone().unwrap();
        assert!(first.timestamp.is_some());

        let err = client
            .execute(TABLE, TableOperation::Insert(entity("p", "1", 2)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 409);

        let replaced = client
            .execute(
                TABLE,
                TableOperation::Replace { entity: entity("p", "1", 3), if_match: etag.clone() },
            )
            .await
            .unwrap()
            .unwrap();
        assert_ne!(replaced.etag.as_deref(), Some(etag.as_str()));

        let stale = client
            .execute(TABLE, TableOperation::Replace { entity: entity("p", "1", 4), if_match: etag })
            .await
            .unwrap_err();
        assert_eq!(stale.status(), 412);
    }

    #[tokio::test]
    async fn missing_rows_and_tables() {
        let client = client().await;

        let missing = client
            .execute(
                TABLE,
                TableOperation::Delete { key: EntityKey::new("p", "1"), if_match: "*".into() },
            )
            .await
            .unwrap_err();
        assert!(matches!(missing, TableError::ResourceNotFound(_)));

        let retrieved = client
            .execute(TABLE, TableOperation::Retrieve(EntityKey::new("p", "1")))
            .await
            .unwrap();
        assert!(retrieved.is_none());

        let no_table = client
            .execute("nowhere", TableOperation::Retrieve(EntityKey::new("p", "1")))
            .await
            .unwrap_err();
        assert!(matches!(no_table, TableError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn batches_roll_back_on_failure() {
        let client = client().await;
        client
            .execute(TABLE, TableOperation::Insert(entity("p", "2", 0)))
            .await
            .unwrap();

        let batch = vec![
            TableOperation::Insert(entity("p", "1", 1)),
            TableOperation::InsertOrReplace(entity("p", "2", 2)),
            TableOperation::Insert(entity("p", "3", 3)),
            TableOperation::Replace { entity: entity("p", "4", 4), if_match: "*".into() },
        ];
        let err = client.execute_batch(TABLE, batch).await.unwrap_err();
        assert!(matches!(err, TableError::Batch { index: 3, .. }));
        assert_eq!(err.status(), 404);

        let segment = client.query(TABLE, &TableQuery::default()).await.unwrap();
        assert_eq!(segment.entities.len(), 1);
        assert_eq!(segment.entities[0].properties, doc! { "n": 0 });
        assert!(client.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn batches_are_validated_up_front() {
        let client = client().await;

        let mixed = vec![
            TableOperation::Insert(entity("p", "1", 1)),
            TableOperation::Insert(entity("q", "1", 1)),
        ];
        assert!(matches!(
            client.execute_batch(TABLE, mixed).await,
            Err(TableError::InvalidBatch(_))
        ));

        let repeated = vec![
            TableOperation::Insert(entity("p", "1", 1)),
            TableOperation::InsertOrReplace(entity("p", "1", 2)),
        ];
        assert!(matches!(
            client.execute_batch(TABLE, repeated).await,
            Err(TableError::InvalidBatch(_))
        ));

        let oversized = (0..=MAX_BATCH_OPERATIONS)
            .map(|i| TableOperation::Insert(entity("p", &i.to_string(), 0)))
            .collect();
        assert!(matches!(
            client.execute_batch(TABLE, oversized).await,
            Err(TableError::InvalidBatch(_))
        ));

        assert!(matches!(
            client.execute_batch(TABLE, Vec::new()).await,
            Err(TableError::InvalidBatch(_))
        ));
    }

    #[tokio::test]
    async fn queries_page_with_continuations() {
        let client = MemoryTableClient::new().with_page_size(2);
        client.create_table_if_not_exists(TABLE).await.unwrap();
        let ops = (0..5)
            .map(|i| TableOperation::Insert(entity("p", &i.to_string(), i)))
            .collect();
        client.execute_batch(TABLE, ops).await.unwrap();
        assert_eq!(client.batch_sizes(), vec![5]);

        let filter = TableFilter { text: "n ne 2".into(), expr: Filter::ne("n", 2) };
        let mut query = TableQuery {
            filter: Some(filter),
            select_keys_only: true,
            ..TableQuery::default()
        };

        let mut seen = Vec::new();
        loop {
            let segment = client.query(TABLE, &query).await.unwrap();
            assert!(segment.entities.len() <= 2);
            for entity in &segment.entities {
                assert!(entity.properties.is_empty());
                seen.push(entity.row_key.clone());
            }
            match segment.continuation {
                Some(token) => query.continuation = Some(token),
                None => break,
            }
        }

        assert_eq!(seen, vec!["0", "1", "3", "4"]);
    }

    #[tokio::test]
    async fn ping_reflects_reachability() {
        let client = MemoryTableClient::new();
        assert!(client.ping().await.is_ok());
        client.set_reachable(false);
        assert_eq!(client.ping().await.unwrap_err().status(), 503);
    }
}
