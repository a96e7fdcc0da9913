//! In-memory storage implementation.

use async_trait::async_trait;
use futures::{StreamExt, stream};
use mea::rwlock::RwLock;
use parking_lot::Mutex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tracing::debug;

use dblayer_core::{
    backend::{CollectionAdapter, RecordStream, StoreBackend, StoreBackendBuilder},
    entity::{EntityKey, Record},
    error::{DataStoreError, DataStoreResult},
    eval,
    query::{Condition, Query},
};

type Rows = BTreeMap<EntityKey, Record>;
type SharedRows = Arc<RwLock<Rows>>;

/// Settings for [`InMemoryStore`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Keys fetched and deleted per round of a predicate delete.
    pub batch_size: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

/// Thread-safe in-memory storage backend.
///
/// `InMemoryStore` is cloneable and all clones share the same data. Data outlives
/// the adapters: reopening a collection name sees what was stored under it before.
/// Concurrency tokens are ignored.
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    collections: Arc<Mutex<HashMap<String, SharedRows>>>,
    options: MemoryOptions,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        Self {
            collections: Arc::new(Mutex::new(HashMap::new())),
            options,
        }
    }

    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    fn open_collection(&self, name: &str) -> DataStoreResult<Arc<dyn CollectionAdapter>> {
        let rows = self
            .collections
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(collection = name, "created in-memory collection");
                Arc::new(RwLock::new(Rows::new()))
            })
            .clone();

        Ok(Arc::new(MemoryCollection {
            name: name.to_string(),
            rows,
            batch_size: self.options.batch_size.max(1),
        }))
    }
}

/// Adapter over one in-memory collection.
#[derive(Debug)]
pub struct MemoryCollection {
    name: String,
    rows: SharedRows,
    batch_size: usize,
}

impl MemoryCollection {
    fn stored(record: Record) -> Record {
        record.with_etag(None)
    }

    fn conflict(&self, key: &EntityKey) -> DataStoreError {
        DataStoreError::conflict(&self.name, key, "an entity with this key already exists")
    }
}

#[async_trait]
impl CollectionAdapter for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn insert(&self, record: Record) -> DataStoreResult<Record> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&record.key) {
            return Err(self.conflict(&record.key));
        }

        let record = Self::stored(record);
        rows.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn insert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        let mut rows = self.rows.write().await;

        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if rows.contains_key(&record.key) || !seen.insert(&record.key) {
                return Err(self.conflict(&record.key));
            }
        }

        let count = records.len();
        for record in records {
            let record = Self::stored(record);
            rows.insert(record.key.clone(), record);
        }

        Ok(count)
    }

    async fn upsert(&self, record: Record) -> DataStoreResult<Record> {
        let record = Self::stored(record);
        self.rows
            .write()
            .await
            .insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn upsert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        let mut rows = self.rows.write().await;
        let count = records.len();
        for record in records {
            let record = Self::stored(record);
            rows.insert(record.key.clone(), record);
        }
        Ok(count)
    }

    async fn update(&self, record: Record) -> DataStoreResult<Record> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&record.key) {
            Some(slot) => {
                *slot = Self::stored(record);
                Ok(slot.clone())
            }
            None => Err(DataStoreError::not_found(&self.name, &record.key)),
        }
    }

    async fn update_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        let mut rows = self.rows.write().await;

        if let Some(missing) = records.iter().find(|record| !rows.contains_key(&record.key)) {
            return Err(DataStoreError::not_found(&self.name, &missing.key));
        }

        let count = records.len();
        for record in records {
            let record = Self::stored(record);
            rows.insert(record.key.clone(), record);
        }

        Ok(count)
    }

    async fn delete(&self, key: &EntityKey) -> DataStoreResult<bool> {
        Ok(self.rows.write().await.remove(key).is_some())
    }

    async fn delete_many(&self, keys: Vec<EntityKey>) -> DataStoreResult<usize> {
        let mut rows = self.rows.write().await;
        Ok(keys.iter().filter(|key| rows.remove(*key).is_some()).count())
    }

    async fn get(&self, key: &EntityKey) -> DataStoreResult<Option<Record>> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn query(&self, query: Query) -> DataStoreResult<RecordStream> {
        let matched = {
            let rows = self.rows.read().await;
            eval::run_query(rows.values().cloned().map(Ok), &query)?
        };

        Ok(stream::iter(matched.into_iter().map(Ok)).boxed())
    }

    async fn count(&self, conditions: Vec<Condition>) -> DataStoreResult<u64> {
        let rows = self.rows.read().await;
        if conditions.is_empty() {
            return Ok(rows.len() as u64);
        }

        let mut count = 0;
        for record in rows.values() {
            if eval::matches_all(&conditions, record)? {
                count += 1;
            }
        }

        Ok(count)
    }
}

/// Builder for [`InMemoryStore`].
///
/// ```ignore
/// use dblayer::{backend::StoreBackendBuilder, memory::InMemoryStore};
///
/// let store = InMemoryStore::builder().batch_size(250).build().await?;
/// ```
#[derive(Default)]
pub struct InMemoryStoreBuilder {
    options: MemoryOptions,
}

impl InMemoryStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(mut self, options: MemoryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.options.batch_size = batch_size;
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(self) -> DataStoreResult<Self::Backend> {
        Ok(InMemoryStore::with_options(self.options))
    }
}
