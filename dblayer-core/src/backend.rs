//! Storage backend abstraction.
//!
//! Two traits split the work between a storage technology and the generic layer:
//!
//! - [`StoreBackend`] owns the connection to one store: it is initialized once, hands
//!   out one [`CollectionAdapter`] per logical collection name, and is shut down once.
//! - [`CollectionAdapter`] performs the native operations for one collection. It is
//!   object safe; [`Collection`](crate::collection::Collection) only ever sees
//!   `Arc<dyn CollectionAdapter>`.
//!
//! [`StoreBackendBuilder`] is the factory every backend crate exposes.
//!
//! # Example
//!
//! ```ignore
//! use dblayer::backend::{StoreBackend, StoreBackendBuilder};
//!
//! let backend = InMemoryStoreBuilder::new().batch_size(50).build().await?;
//! backend.initialize().await?;
//! let adapter = backend.open_collection("orders")?;
//! adapter.insert(record).await?;
//! ```

use async_trait::async_trait;
use futures::{TryStreamExt, stream::BoxStream};
use std::{any::Any, fmt::Debug, sync::Arc};

use crate::{
    entity::{EntityKey, Record},
    error::{DataStoreError, DataStoreResult},
    query::{Condition, Projection, Query},
};

/// Lazy, forward-only sequence of records produced by an adapter query.
pub type RecordStream = BoxStream<'static, DataStoreResult<Record>>;

/// Native operations over one collection of one backend.
///
/// Every method maps backend failures into [`DataStoreError`](crate::error::DataStoreError);
/// no vendor error type crosses this boundary. Returned records carry the state the
/// backend accepted, including any token it assigned.
#[async_trait]
pub trait CollectionAdapter: Send + Sync + Debug {
    /// Logical collection name.
    fn name(&self) -> &str;

    /// Maximum number of keys fetched and deleted per step of a predicate delete.
    fn batch_size(&self) -> usize;

    /// Inserts a new record. An existing key is a conflict.
    async fn insert(&self, record: Record) -> DataStoreResult<Record>;

    /// Inserts records with the backend's batch primitive and returns the number
    /// the backend confirmed.
    async fn insert_many(&self, records: Vec<Record>) -> DataStoreResult<usize>;

    /// Inserts or replaces a record.
    async fn upsert(&self, record: Record) -> DataStoreResult<Record>;

    async fn upsert_many(&self, records: Vec<Record>) -> DataStoreResult<usize>;

    /// Replaces an existing record, honoring its token on backends that have one.
    async fn update(&self, record: Record) -> DataStoreResult<Record>;

    async fn update_many(&self, records: Vec<Record>) -> DataStoreResult<usize>;

    /// Removes a record. Returns `false` when the key did not exist.
    async fn delete(&self, key: &EntityKey) -> DataStoreResult<bool>;

    /// Removes records by key and returns how many existed.
    async fn delete_many(&self, keys: Vec<EntityKey>) -> DataStoreResult<usize>;

    async fn get(&self, key: &EntityKey) -> DataStoreResult<Option<Record>>;

    /// Runs a query. With [`Projection::KeysOnly`] returned records carry no body.
    async fn query(&self, query: Query) -> DataStoreResult<RecordStream>;

    /// Counts records matching every condition.
    ///
    /// The default counts a keys-only scan.
    async fn count(&self, conditions: Vec<Condition>) -> DataStoreResult<u64> {
        let query = Query {
            conditions,
            projection: Projection::KeysOnly,
            ..Query::default()
        };

        self.query(query)
            .await?
            .try_fold(0u64, |count, _| async move { Ok::<_, DataStoreError>(count + 1) })
            .await
    }

    /// Removes every record in one step, returning how many were removed.
    ///
    /// `None` means the backend has no such primitive and the caller should fall
    /// back to a predicate delete.
    async fn clear(&self) -> DataStoreResult<Option<usize>> {
        Ok(None)
    }

    /// Releases resources held by this adapter.
    async fn close(&self) -> DataStoreResult<()> {
        Ok(())
    }
}

/// One storage technology, as seen by a [`DataStore`](crate::store::DataStore).
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Performs backend setup, such as opening files or verifying connectivity.
    ///
    /// Called once per data store. Fails with
    /// [`DataStoreError::Connection`](crate::error::DataStoreError::Connection) if the
    /// backend is unreachable or misconfigured.
    async fn initialize(&self) -> DataStoreResult<()> {
        Ok(())
    }

    /// Creates the adapter for a logical collection name.
    ///
    /// Must not perform I/O; adapters defer setup to their first operation.
    fn open_collection(&self, name: &str) -> DataStoreResult<Arc<dyn CollectionAdapter>>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op.
    async fn shutdown(&self) -> DataStoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<B> StoreBackend for Arc<B>
where
    B: StoreBackend + ?Sized,
{
    async fn initialize(&self) -> DataStoreResult<()> {
        (**self).initialize().await
    }

    fn open_collection(&self, name: &str) -> DataStoreResult<Arc<dyn CollectionAdapter>> {
        (**self).open_collection(name)
    }

    async fn shutdown(&self) -> DataStoreResult<()> {
        (**self).shutdown().await
    }
}

/// Object-safe view of a [`StoreBackend`] that can be downcast to its concrete type.
///
/// Implemented for every `'static` backend.
pub trait DynStoreBackend: StoreBackend {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<B: StoreBackend + 'static> DynStoreBackend for B {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[async_trait]
impl StoreBackend for Box<dyn DynStoreBackend> {
    async fn initialize(&self) -> DataStoreResult<()> {
        (**self).initialize().await
    }

    fn open_collection(&self, name: &str) -> DataStoreResult<Arc<dyn CollectionAdapter>> {
        (**self).open_collection(name)
    }

    async fn shutdown(&self) -> DataStoreResult<()> {
        (**self).shutdown().await
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> DataStoreResult<Self::Backend>;
}
