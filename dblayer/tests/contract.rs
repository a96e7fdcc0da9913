//! Behaviour every backend must share, run against the memory store, the table
//! emulator and a temporary sled database.

#![cfg(all(feature = "memory", feature = "sled", feature = "table"))]

use async_trait::async_trait;
use dblayer::{
    backend::RecordStream,
    memory::InMemoryStore,
    prelude::*,
    sled::SledStore,
    table::TableStore,
};
use futures::{StreamExt, TryStreamExt, stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Device {
    #[serde(skip)]
    id: EntityKey,
    #[serde(skip)]
    etag: Option<String>,
    model: String,
    firmware: i32,
}

impl Entity for Device {
    type Id = EntityKey;

    fn id(&self) -> EntityKey {
        self.id.clone()
    }

    fn set_id(&mut self, id: EntityKey) {
        self.id = id;
    }

    fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn set_etag(&mut self, etag: Option<String>) {
        self.etag = etag;
    }

    fn collection_name() -> &'static str {
        "devices"
    }
}

fn device(site: &str, serial: usize, firmware: i32) -> Device {
    Device {
        id: EntityKey::new(site, format!("{serial:04}")),
        etag: None,
        model: format!("sensor-{}", serial % 3),
        firmware,
    }
}

fn fleet(count: usize) -> Vec<Device> {
    (0..count)
        .map(|i| device(&format!("site-{}", i % 5), i, (i % 10) as i32))
        .collect()
}

fn without_etag(mut device: Device) -> Device {
    device.etag = None;
    device
}

async fn open_stores(batch_size: usize) -> Vec<(&'static str, DynDataStore)> {
    let stores = vec![
        (
            "memory",
            DataStore::from_builder(InMemoryStore::builder().batch_size(batch_size))
                .await
                .unwrap()
                .into_dyn(),
        ),
        (
            "table",
            DataStore::from_builder(TableStore::builder().emulator().batch_size(batch_size))
                .await
                .unwrap()
                .into_dyn(),
        ),
        (
            "sled",
            DataStore::from_builder(SledStore::builder().temporary().batch_size(batch_size))
                .await
                .unwrap()
                .into_dyn(),
        ),
    ];

    for (_, store) in &stores {
        store.initialize().await.unwrap();
    }
    stores
}

#[tokio::test]
async fn inserted_entities_read_back_equal() {
    for (backend, store) in open_stores(100).await {
        let devices = store.collection::<Device>().unwrap();
        let original = device("site-1", 7, 3);

        let stored = devices.insert(&original).await.unwrap();
        assert_eq!(without_etag(stored), original, "{backend}");

        let fetched = devices.get(&original.id).await.unwrap();
        assert_eq!(without_etag(fetched), original, "{backend}");

        let err = devices.insert(&original).await.unwrap_err();
        assert!(err.is_conflict(), "{backend}: {err}");

        store.dispose().await.unwrap();
    }
}

#[tokio::test]
async fn deleted_entities_are_not_found() {
    for (backend, store) in open_stores(100).await {
        let devices = store.collection::<Device>().unwrap();
        let original = device("site-1", 1, 1);
        devices.insert(&original).await.unwrap();

        assert!(devices.delete(&original.id).await.unwrap(), "{backend}");
        assert!(!devices.delete(&original.id).await.unwrap(), "{backend}");

        let err = devices.get(&original.id).await.unwrap_err();
        assert!(err.is_not_found(), "{backend}: {err}");

        let err = devices.update(&original).await.unwrap_err();
        assert!(err.is_not_found(), "{backend}: {err}");
    }
}

#[tokio::test]
async fn upsert_is_idempotent() {
    for (backend, store) in open_stores(100).await {
        let devices = store.collection::<Device>().unwrap();
        let original = device("site-2", 4, 8);

        devices.upsert(&original).await.unwrap();
        devices.upsert(&original).await.unwrap();

        assert_eq!(devices.count().await.unwrap(), 1, "{backend}");
        assert_eq!(without_etag(devices.get(&original.id).await.unwrap()), original, "{backend}");

        assert_eq!(devices.upsert_many(&fleet(12)).await.unwrap(), 12, "{backend}");
        assert_eq!(devices.upsert_many(&fleet(12)).await.unwrap(), 12, "{backend}");
        assert_eq!(devices.count().await.unwrap(), 13, "{backend}");
    }
}

#[tokio::test]
async fn predicate_delete_clears_more_than_three_batches() {
    let batch_size = 20;
    for (backend, store) in open_stores(batch_size).await {
        let devices = store.collection::<Device>().unwrap();
        let count = 3 * batch_size + 1;

        assert_eq!(devices.insert_many(&fleet(count)).await.unwrap(), count, "{backend}");
        assert_eq!(devices.delete_where(Vec::new()).await.unwrap(), count, "{backend}");
        assert_eq!(devices.count().await.unwrap(), 0, "{backend}");
    }
}

#[tokio::test]
async fn find_returns_exactly_the_matches_in_order() {
    for (backend, store) in open_stores(100).await {
        let devices = store.collection::<Device>().unwrap();
        let all = fleet(40);
        devices.insert_many(&all).await.unwrap();

        let query = Query::builder()
            .filter(Filter::gte("firmware", 5))
            .matching(|d: &Device| d.model != "sensor-0")
            .order_by("firmware", SortDirection::Asc)
            .then_by("RowKey", SortDirection::Asc)
            .build();
        let found = devices.find(query).await.unwrap().try_collect::<Vec<_>>().await.unwrap();

        let mut expected = all
            .iter()
            .filter(|d| d.firmware >= 5 && d.model != "sensor-0")
            .cloned()
            .collect::<Vec<_>>();
        expected.sort_by(|a, b| (a.firmware, &a.id.row_key).cmp(&(b.firmware, &b.id.row_key)));

        let found = found.into_iter().map(without_etag).collect::<Vec<_>>();
        assert_eq!(found, expected, "{backend}");

        let counted = devices
            .count_where(vec![
                Filter::gte("firmware", 5).into(),
                Condition::from_fn(|d: &Device| d.model != "sensor-0"),
            ])
            .await
            .unwrap();
        assert_eq!(counted, expected.len() as u64, "{backend}");
    }
}

#[tokio::test]
async fn reads_window_and_page() {
    for (backend, store) in open_stores(100).await {
        let devices = store.collection::<Device>().unwrap();
        devices.insert_many(&fleet(25)).await.unwrap();

        let first = devices
            .get_where(vec![Filter::partition("site-3").into()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, EntityKey::new("site-3", "0003"), "{backend}");
        assert!(
            devices.get_where(vec![Filter::partition("nowhere").into()]).await.unwrap().is_none(),
            "{backend}"
        );

        let window = devices
            .get_all_ordered("RowKey", SortDirection::Desc, Some(3), 2)
            .await
            .unwrap()
            .map_ok(|d| d.id.row_key)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(window, vec!["0022", "0021", "0020"], "{backend}");

        let page = devices
            .find_page(Query::filtered([Filter::lt("firmware", 5).into()]), &PaginationParams::new(2, 5))
            .await
            .unwrap();
        assert_eq!(page.count, 15, "{backend}");
        assert_eq!(page.items.len(), 5, "{backend}");
        assert_eq!(page.next_page, Some(3), "{backend}");
        assert_eq!(page.previous_page, Some(1), "{backend}");
    }
}

#[tokio::test]
async fn delete_all_empties_the_collection() {
    for (backend, store) in open_stores(10).await {
        let devices = store.collection::<Device>().unwrap();
        assert!(!devices.delete_all().await.unwrap(), "{backend}");

        devices.insert_many(&fleet(35)).await.unwrap();
        assert!(devices.delete_all().await.unwrap(), "{backend}");
        assert_eq!(devices.count().await.unwrap(), 0, "{backend}");
    }
}

#[tokio::test]
async fn cancelled_handles_stop_before_the_backend() {
    for (backend, store) in open_stores(100).await {
        let cancel = CancellationToken::new();
        let devices = store.collection::<Device>().unwrap().with_cancellation(cancel.clone());
        devices.insert_many(&fleet(10)).await.unwrap();

        let mut stream = devices.get_all(None, 0).await.unwrap();
        assert!(stream.try_next().await.unwrap().is_some(), "{backend}");

        cancel.cancel();
        assert!(matches!(stream.try_next().await, Err(DataStoreError::Cancelled)), "{backend}");
        assert!(matches!(devices.delete_where(Vec::new()).await, Err(DataStoreError::Cancelled)));
        assert!(matches!(devices.insert(&device("x", 1, 1)).await, Err(DataStoreError::Cancelled)));

        let unbound = store.collection::<Device>().unwrap();
        assert_eq!(unbound.count().await.unwrap(), 10, "{backend}");
    }
}

/// Passes everything through, remembering the size of every fetch and delete batch.
#[derive(Debug)]
struct RecordingAdapter {
    inner: Arc<dyn CollectionAdapter>,
    fetches: Mutex<Vec<usize>>,
    deletes: Mutex<Vec<usize>>,
}

#[async_trait]
impl CollectionAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    async fn insert(&self, record: Record) -> DataStoreResult<Record> {
        self.inner.insert(record).await
    }

    async fn insert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        self.inner.insert_many(records).await
    }

    async fn upsert(&self, record: Record) -> DataStoreResult<Record> {
        self.inner.upsert(record).await
    }

    async fn upsert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        self.inner.upsert_many(records).await
    }

    async fn update(&self, record: Record) -> DataStoreResult<Record> {
        self.inner.update(record).await
    }

    async fn update_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        self.inner.update_many(records).await
    }

    async fn delete(&self, key: &EntityKey) -> DataStoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: Vec<EntityKey>) -> DataStoreResult<usize> {
        self.deletes.lock().push(keys.len());
        self.inner.delete_many(keys).await
    }

    async fn get(&self, key: &EntityKey) -> DataStoreResult<Option<Record>> {
        self.inner.get(key).await
    }

    async fn query(&self, query: Query) -> DataStoreResult<RecordStream> {
        let records = self.inner.query(query).await?.try_collect::<Vec<_>>().await?;
        self.fetches.lock().push(records.len());
        Ok(stream::iter(records.into_iter().map(Ok)).boxed())
    }

    async fn count(&self, conditions: Vec<Condition>) -> DataStoreResult<u64> {
        self.inner.count(conditions).await
    }
}

#[tokio::test]
async fn predicate_delete_runs_sequential_batches() {
    for (backend, store) in open_stores(100).await {
        let plain = store.collection::<Device>().unwrap();
        plain.insert_many(&fleet(250)).await.unwrap();

        let recorder = Arc::new(RecordingAdapter {
            inner: plain.adapter().clone(),
            fetches: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        });
        let devices = Collection::<Device>::from_adapter(recorder.clone());

        assert_eq!(devices.delete_where(Vec::new()).await.unwrap(), 250, "{backend}");
        assert_eq!(*recorder.fetches.lock(), vec![100, 100, 50, 0], "{backend}");
        assert_eq!(*recorder.deletes.lock(), vec![100, 100, 50], "{backend}");
        assert_eq!(plain.count().await.unwrap(), 0, "{backend}");
    }
}

#[tokio::test]
async fn table_updates_honour_concurrency_tokens() {
    let store = DataStore::from_builder(TableStore::builder().emulator()).await.unwrap();
    store.initialize().await.unwrap();
    let devices = store.collection::<Device>().unwrap();

    let stored = devices.insert(&device("site-1", 1, 1)).await.unwrap();
    let first_etag = stored.etag.clone().unwrap();

    let mut changed = stored.clone();
    changed.firmware = 2;
    let updated = devices.update(&changed).await.unwrap();
    assert_ne!(updated.etag.as_deref(), Some(first_etag.as_str()));

    let mut stale = stored.clone();
    stale.firmware = 3;
    let err = devices.update(&stale).await.unwrap_err();
    assert!(err.is_conflict(), "{err}");

    let mut blind = stored;
    blind.etag = Some(String::new());
    blind.firmware = 4;
    devices.update(&blind).await.unwrap();
    blind.etag = None;
    blind.firmware = 5;
    devices.update(&blind).await.unwrap();

    let current = devices.get(&blind.id).await.unwrap();
    assert_eq!(current.firmware, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_share_one_collection() {
    for (backend, store) in open_stores(100).await {
        let store = Arc::new(store);

        let handles = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.collection::<Device>() })
            })
            .collect::<Vec<_>>();

        let mut collections = Vec::new();
        for handle in handles {
            collections.push(handle.await.unwrap().unwrap());
        }

        assert!(
            collections.iter().all(|c| c.same_instance(&collections[0])),
            "{backend}"
        );
        assert_eq!(store.collection_names(), vec!["devices"], "{backend}");
    }
}

#[tokio::test]
async fn lifecycle_guards_every_operation() {
    let store = DataStore::from_builder(InMemoryStore::builder()).await.unwrap();
    assert!(matches!(store.collection::<Device>(), Err(DataStoreError::NotInitialized(_))));

    store.initialize().await.unwrap();
    store.initialize().await.unwrap();
    assert!(store.is_initialized());

    let devices = store.collection::<Device>().unwrap();
    devices.insert(&device("a", 1, 1)).await.unwrap();

    store.dispose().await.unwrap();
    store.dispose().await.unwrap();

    assert!(matches!(devices.count().await, Err(DataStoreError::NotInitialized(_))));
    assert!(matches!(store.collection::<Device>(), Err(DataStoreError::NotInitialized(_))));
    assert!(matches!(store.initialize().await, Err(DataStoreError::NotInitialized(_))));
}

#[tokio::test]
async fn dynamic_stores_expose_their_backend() {
    let store = DataStore::from_builder(SledStore::builder().temporary()).await.unwrap().into_dyn();
    assert!(store.backend_as::<SledStore>().is_some());
    assert!(store.backend_as::<InMemoryStore>().is_none());
}
