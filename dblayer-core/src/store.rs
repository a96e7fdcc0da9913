//! The database handle.
//!
//! A [`DataStore`] wraps one [`StoreBackend`], owns the registry of collection
//! adapters keyed by logical name, and drives the lifecycle
//! `uninitialized -> initialize -> ready -> dispose -> disposed`.
//!
//! # Example
//!
//! ```ignore
//! use dblayer::store::DataStore;
//!
//! let store = DataStore::new(backend);
//! store.initialize().await?;
//!
//! let orders = store.collection::<Order>()?;
//! orders.insert(&order).await?;
//!
//! store.dispose().await?;
//! ```

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    backend::{CollectionAdapter, DynStoreBackend, StoreBackend, StoreBackendBuilder},
    collection::Collection,
    entity::Entity,
    error::{DataStoreError, DataStoreResult},
};

const UNINITIALIZED: u8 = 0;
const READY: u8 = 1;
const DISPOSED: u8 = 2;

/// Lifecycle state shared between a data store and the collections it hands out.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    fn new() -> Self {
        Self { state: AtomicU8::new(UNINITIALIZED) }
    }

    /// A lifecycle that is always ready, for collections built outside a data store.
    pub(crate) fn detached() -> Self {
        Self { state: AtomicU8::new(READY) }
    }

    pub(crate) fn ensure_ready(&self) -> DataStoreResult<()> {
        match self.state.load(Ordering::Acquire) {
            READY => Ok(()),
            DISPOSED => Err(DataStoreError::NotInitialized(
                "data store has been disposed".to_string(),
            )),
            _ => Err(DataStoreError::NotInitialized(
                "initialize must be called before use".to_string(),
            )),
        }
    }
}

/// A database handle bound to a specific backend implementation.
pub struct DataStore<B: StoreBackend> {
    backend: B,
    initialized: OnceCell<()>,
    lifecycle: Arc<Lifecycle>,
    collections: Mutex<HashMap<String, Arc<dyn CollectionAdapter>>>,
}

/// A data store whose backend is selected at runtime.
pub type DynDataStore = DataStore<Box<dyn DynStoreBackend>>;

impl<B: StoreBackend> DataStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            initialized: OnceCell::new(),
            lifecycle: Arc::new(Lifecycle::new()),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the backend and wraps it. The store still needs [`initialize`](Self::initialize).
    pub async fn from_builder<Bd>(builder: Bd) -> DataStoreResult<Self>
    where
        Bd: StoreBackendBuilder<Backend = B>,
    {
        Ok(Self::new(builder.build().await?))
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns `true` between a successful [`initialize`](Self::initialize) and
    /// [`dispose`](Self::dispose).
    pub fn is_initialized(&self) -> bool {
        self.lifecycle.ensure_ready().is_ok()
    }

    /// Performs backend setup. Calling it again after success is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DataStoreError::Connection`] if the backend is unreachable, and
    /// [`DataStoreError::NotInitialized`] if the store was already disposed. A failed
    /// attempt may be retried.
    pub async fn initialize(&self) -> DataStoreResult<()> {
        if self.lifecycle.state.load(Ordering::Acquire) == DISPOSED {
            return Err(DataStoreError::NotInitialized(
                "data store has been disposed".to_string(),
            ));
        }

        self.initialized
            .get_or_try_init(|| async {
                self.backend.initialize().await?;

                if self
                    .lifecycle
                    .state
                    .compare_exchange(UNINITIALIZED, READY, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Disposed while the backend was starting; dispose skipped the
                    // shutdown, so release what was just opened.
                    warn!("data store disposed during initialize");
                    self.backend.shutdown().await?;
                    return Err(DataStoreError::NotInitialized(
                        "data store was disposed during initialize".to_string(),
                    ));
                }

                info!("data store initialized");
                Ok::<_, DataStoreError>(())
            })
            .await?;

        Ok(())
    }

    /// Returns the collection for `E` under its default name.
    pub fn collection<E: Entity>(&self) -> DataStoreResult<Collection<E>> {
        self.collection_named(E::collection_name())
    }

    /// Returns the collection registered under `name`, creating its adapter on
    /// first use. Every call for one name shares the same adapter.
    ///
    /// # Errors
    ///
    /// Returns [`DataStoreError::NotInitialized`] before `initialize` and after `dispose`.
    pub fn collection_named<E: Entity>(&self, name: &str) -> DataStoreResult<Collection<E>> {
        self.lifecycle.ensure_ready()?;

        let adapter = {
            let mut collections = self.collections.lock();
            match collections.get(name) {
                Some(adapter) => adapter.clone(),
                None => {
                    let adapter = self.backend.open_collection(name)?;
                    collections.insert(name.to_string(), adapter.clone());
                    debug!(collection = name, "opened collection");
                    adapter
                }
            }
        };

        Ok(Collection::new(adapter, self.lifecycle.clone()))
    }

    /// Names of the collections opened so far.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names = self.collections.lock().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Releases every cached collection and shuts the backend down.
    ///
    /// Idempotent. Collections handed out earlier fail with
    /// [`DataStoreError::NotInitialized`] afterwards. Every adapter is closed even if
    /// one fails; the first failure is returned.
    pub async fn dispose(&self) -> DataStoreResult<()> {
        let previous = self.lifecycle.state.swap(DISPOSED, Ordering::AcqRel);
        if previous == DISPOSED {
            return Ok(());
        }

        let adapters = self
            .collections
            .lock()
            .drain()
            .map(|(_, adapter)| adapter)
            .collect::<Vec<_>>();

        let mut first_error = None;
        for adapter in &adapters {
            if let Err(err) = adapter.close().await {
                warn!(collection = adapter.name(), error = %err, "failed to close collection");
                first_error.get_or_insert(err);
            }
        }

        if previous == READY {
            if let Err(err) = self.backend.shutdown().await {
                first_error.get_or_insert(err);
            }
        }

        info!(collections = adapters.len(), "data store disposed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<B: StoreBackend + 'static> DataStore<B> {
    /// Erases the backend type, keeping lifecycle state and open collections.
    pub fn into_dyn(self) -> DynDataStore {
        let backend: Box<dyn DynStoreBackend> = Box::new(self.backend);
        DataStore {
            backend,
            initialized: self.initialized,
            lifecycle: self.lifecycle,
            collections: self.collections,
        }
    }
}

impl DynDataStore {
    /// Returns the backend as `T` if that is its concrete type.
    pub fn backend_as<T: StoreBackend + 'static>(&self) -> Option<&T> {
        (*self.backend).as_any().downcast_ref::<T>()
    }
}

impl<B: StoreBackend> fmt::Debug for DataStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore")
            .field("backend", &self.backend)
            .field("lifecycle", &self.lifecycle)
            .field("collections", &self.collection_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::RecordStream,
        entity::{EntityKey, Record},
        query::Query,
    };
    use async_trait::async_trait;
    use futures::stream;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Debug, Default)]
    struct CountingBackend {
        initialized: AtomicUsize,
        opened: AtomicUsize,
        shutdowns: AtomicUsize,
        fail_initialize: bool,
        /// Holds `initialize` open until notified.
        gate: Option<Arc<Notify>>,
    }

    #[derive(Debug)]
    struct NullAdapter {
        name: String,
    }

    #[async_trait]
    impl CollectionAdapter for NullAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn batch_size(&self) -> usize {
            10
        }

        async fn insert(&self, record: Record) -> DataStoreResult<Record> {
            Ok(record)
        }

        async fn insert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
            Ok(records.len())
        }

        async fn upsert(&self, record: Record) -> DataStoreResult<Record> {
            Ok(record)
        }

        async fn upsert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
            Ok(records.len())
        }

        async fn update(&self, record: Record) -> DataStoreResult<Record> {
            Ok(record)
        }

        async fn update_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
            Ok(records.len())
        }

        async fn delete(&self, _key: &EntityKey) -> DataStoreResult<bool> {
            Ok(false)
        }

        async fn delete_many(&self, _keys: Vec<EntityKey>) -> DataStoreResult<usize> {
            Ok(0)
        }

        async fn get(&self, _key: &EntityKey) -> DataStoreResult<Option<Record>> {
            Ok(None)
        }

        async fn query(&self, _query: Query) -> DataStoreResult<RecordStream> {
            Ok(Box::pin(stream::empty()))
        }
    }

    #[async_trait]
    impl StoreBackend for CountingBackend {
        async fn initialize(&self) -> DataStoreResult<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_initialize {
                return Err(DataStoreError::Connection("unreachable".into()));
            }
            Ok(())
        }

        fn open_collection(&self, name: &str) -> DataStoreResult<Arc<dyn CollectionAdapter>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullAdapter { name: name.to_string() }))
        }

        async fn shutdown(&self) -> DataStoreResult<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        id: String,
    }

    impl Entity for Note {
        type Id = String;

        fn id(&self) -> String {
            self.id.clone()
        }

        fn set_id(&mut self, id: String) {
            self.id = id;
        }
    }

    #[tokio::test]
    async fn collections_require_initialize() {
        let store = DataStore::new(CountingBackend::default());
        assert!(matches!(
            store.collection::<Note>(),
            Err(DataStoreError::NotInitialized(_))
        ));
        assert!(!store.is_initialized());
    }

    #[tokio::test]
    async fn initialize_runs_backend_setup_once() {
        let store = DataStore::new(CountingBackend::default());
        store.initialize().await.unwrap();
        store.initialize().await.unwrap();

        assert!(store.is_initialized());
        assert_eq!(store.backend().initialized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_initialize_surfaces_connection_error_and_can_retry() {
        let store = DataStore::new(CountingBackend { fail_initialize: true, ..Default::default() });
        assert!(matches!(store.initialize().await, Err(DataStoreError::Connection(_))));
        assert!(store.initialize().await.is_err());
        assert_eq!(store.backend().initialized.load(Ordering::SeqCst), 2);
        assert!(!store.is_initialized());
    }

    #[tokio::test]
    async fn one_adapter_per_name() {
        let store = DataStore::new(CountingBackend::default());
        store.initialize().await.unwrap();

        let a = store.collection::<Note>().unwrap();
        let b = store.collection::<Note>().unwrap();
        let c = store.collection_named::<Note>("other").unwrap();

        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
        assert_eq!(store.backend().opened.load(Ordering::SeqCst), 2);
        assert_eq!(a.name(), std::any::type_name::<Note>());
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_invalidates_collections() {
        let store = DataStore::new(CountingBackend::default());
        store.initialize().await.unwrap();
        let notes = store.collection::<Note>().unwrap();

        store.dispose().await.unwrap();
        store.dispose().await.unwrap();

        assert_eq!(store.backend().shutdowns.load(Ordering::SeqCst), 1);
        assert!(store.collection_names().is_empty());
        assert!(matches!(notes.count().await, Err(DataStoreError::NotInitialized(_))));
        assert!(matches!(store.initialize().await, Err(DataStoreError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn dispose_during_initialize_still_shuts_the_backend_down() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(DataStore::new(CountingBackend {
            gate: Some(gate.clone()),
            ..Default::default()
        }));

        let starting = tokio::spawn({
            let store = store.clone();
            async move { store.initialize().await }
        });
        while store.backend().initialized.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        store.dispose().await.unwrap();
        assert_eq!(store.backend().shutdowns.load(Ordering::SeqCst), 0);

        gate.notify_one();
        let result = starting.await.unwrap();

        assert!(matches!(result, Err(DataStoreError::NotInitialized(_))));
        assert_eq!(store.backend().shutdowns.load(Ordering::SeqCst), 1);
        assert!(!store.is_initialized());
        assert!(matches!(store.initialize().await, Err(DataStoreError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn dyn_store_downcasts_to_its_backend() {
        let store = DataStore::new(CountingBackend::default()).into_dyn();
        store.initialize().await.unwrap();

        let backend = store.backend_as::<CountingBackend>().unwrap();
        assert_eq!(backend.initialized.load(Ordering::SeqCst), 1);
        assert!(store.collection::<Note>().is_ok());
    }
}
