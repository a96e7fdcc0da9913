//! The sled database handle.

use async_trait::async_trait;
use serde::Deserialize;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use dblayer_core::{
    backend::{CollectionAdapter, StoreBackend, StoreBackendBuilder},
    error::{DataStoreError, DataStoreResult},
};

use crate::{collection::SledCollection, error::SledError};

/// Default page cache (64 MB)
pub const DEFAULT_CACHE_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default keys per predicate-delete round
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Settings for [`SledStore`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SledOptions {
    /// Database directory. `None` opens a temporary database removed on drop.
    pub path: Option<PathBuf>,
    /// Page cache size in bytes.
    pub cache_capacity: u64,
    /// Flush to disk when the store shuts down.
    pub flush_on_shutdown: bool,
    pub batch_size: usize,
}

impl Default for SledOptions {
    fn default() -> Self {
        Self {
            path: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            flush_on_shutdown: true,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Storage backend over an embedded sled database.
///
/// The database is opened by `initialize`; each collection is a sled tree named
/// after the collection, opened on first use.
#[derive(Debug)]
pub struct SledStore {
    options: SledOptions,
    db: OnceCell<sled::Db>,
}

impl SledStore {
    pub fn new(options: SledOptions) -> Self {
        Self {
            options,
            db: OnceCell::new(),
        }
    }

    pub fn builder() -> SledStoreBuilder {
        SledStoreBuilder::default()
    }

    pub fn options(&self) -> &SledOptions {
        &self.options
    }

    /// The open database, once initialized.
    pub fn db(&self) -> Option<&sled::Db> {
        self.db.get()
    }

    fn open_db(options: &SledOptions) -> Result<sled::Db, SledError> {
        let config = sled::Config::default()
            .cache_capacity(options.cache_capacity)
            .mode(sled::Mode::HighThroughput);

        let config = match &options.path {
            Some(path) => config.path(path),
            None => config.temporary(true),
        };

        config.open().map_err(|e| {
            let location = options
                .path
                .as_ref()
                .map_or_else(|| "<temporary>".to_string(), |p| p.display().to_string());
            SledError::OpenFailed(format!("failed to open sled database at {location}: {e}"))
        })
    }
}

#[async_trait]
impl StoreBackend for SledStore {
    async fn initialize(&self) -> DataStoreResult<()> {
        // Concurrent callers wait on the same open; the database is opened once.
        self.db
            .get_or_try_init(|| async {
                let options = self.options.clone();
                let db = tokio::task::spawn_blocking(move || Self::open_db(&options))
                    .await
                    .map_err(|e| DataStoreError::Connection(e.to_string()))?
                    .map_err(|e| e.into_store_error("initialize", "sled"))?;

                info!(
                    path = ?self.options.path,
                    cache_mb = self.options.cache_capacity / (1024 * 1024),
                    "opened sled database"
                );
                Ok::<_, DataStoreError>(db)
            })
            .await?;

        Ok(())
    }

    fn open_collection(&self, name: &str) -> DataStoreResult<Arc<dyn CollectionAdapter>> {
        let db = self.db.get().cloned().ok_or_else(|| {
            DataStoreError::NotInitialized("sled database has not been opened".to_string())
        })?;

        debug!(collection = name, "created sled collection");
        Ok(Arc::new(SledCollection::new(
            name,
            db,
            self.options.batch_size.max(1),
        )))
    }

    async fn shutdown(&self) -> DataStoreResult<()> {
        let Some(db) = self.db.get().cloned() else {
            return Ok(());
        };

        if self.options.flush_on_shutdown {
            let flushed = tokio::task::spawn_blocking(move || db.flush())
                .await
                .map_err(|e| DataStoreError::adapter("shutdown", "sled", e))?
                .map_err(|e| SledError::from(e).into_store_error("shutdown", "sled"))?;
            info!(bytes = flushed, "flushed sled database");
        }

        Ok(())
    }
}

/// Builder for [`SledStore`].
///
/// ```ignore
/// use dblayer::{backend::StoreBackendBuilder, sled::SledStore};
///
/// let store = SledStore::builder().path("./data").batch_size(500).build().await?;
/// ```
#[derive(Default)]
pub struct SledStoreBuilder {
    options: SledOptions,
}

impl SledStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(mut self, options: SledOptions) -> Self {
        self.options = options;
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.path = Some(path.into());
        self
    }

    /// Uses a temporary database that is removed when the store is dropped.
    pub fn temporary(mut self) -> Self {
        self.options.path = None;
        self
    }

    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.options.cache_capacity = bytes;
        self
    }

    pub fn flush_on_shutdown(mut self, flush: bool) -> Self {
        self.options.flush_on_shutdown = flush;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.options.batch_size = batch_size;
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for SledStoreBuilder {
    type Backend = SledStore;

    async fn build(self) -> DataStoreResult<Self::Backend> {
        Ok(SledStore::new(self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn collections_need_an_open_database() {
        let store = SledStore::builder().temporary().build().await.unwrap();
        assert!(matches!(
            store.open_collection("things"),
            Err(DataStoreError::NotInitialized(_))
        ));

        store.initialize().await.unwrap();
        store.initialize().await.unwrap();
        assert!(store.open_collection("things").is_ok());
        store.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_initialize_opens_the_database_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SledStore::builder().path(dir.path().join("db")).build().await.unwrap());

        // A second open of the same path would fail on sled's file lock.
        let handles = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.initialize().await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(store.db().is_some());
        assert!(store.open_collection("things").is_ok());
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unopenable_path_is_a_connection_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"occupied").unwrap();

        let store = SledStore::builder().path(&file).build().await.unwrap();
        assert!(matches!(store.initialize().await, Err(DataStoreError::Connection(_))));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: SledOptions = serde_json::from_str(r#"{ "path": "/var/lib/app" }"#).unwrap();
        assert_eq!(options.path, Some(PathBuf::from("/var/lib/app")));
        assert_eq!(options.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert_eq!(options.batch_size, DEFAULT_BATCH_SIZE);
        assert!(options.flush_on_shutdown);
    }
}
