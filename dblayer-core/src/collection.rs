//! Typed collections.
//!
//! A [`Collection<E>`] is the public operation surface over one logical collection.
//! It converts entities to records, delegates single-step operations to its
//! [`CollectionAdapter`], and runs the multi-step algorithms that are the same for
//! every backend: predicate deletes, first-match lookups and paged reads.
//!
//! # Example
//!
//! ```ignore
//! use dblayer::prelude::*;
//!
//! let orders = store.collection::<Order>()?;
//! orders.insert(&order).await?;
//!
//! let open = Query::builder()
//!     .filter(Filter::partition("acme"))
//!     .matching(|o: &Order| o.total > 100.0)
//!     .order_by("total", SortDirection::Desc)
//!     .build();
//! let mut stream = orders.find(open).await?;
//! while let Some(order) = stream.try_next().await? {
//!     println!("{order:?}");
//! }
//!
//! let removed = orders.delete_where(vec![Filter::eq("status", "void").into()]).await?;
//! ```

use futures::{StreamExt, TryStreamExt, stream::{self, BoxStream}};
use std::{fmt, marker::PhantomData, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    backend::{CollectionAdapter, RecordStream},
    entity::{Entity, EntityExt, EntityKey, Identity, Record},
    error::{DataStoreError, DataStoreResult},
    page::{Page, PaginationParams},
    query::{Condition, Projection, Query, Sort, SortDirection},
    store::Lifecycle,
};

/// Lazy, forward-only, cancellable sequence of entities.
pub type EntityStream<E> = BoxStream<'static, DataStoreResult<E>>;

/// A typed handle on one collection.
///
/// Handles are cheap to clone; clones share the adapter.
pub struct Collection<E: Entity> {
    adapter: Arc<dyn CollectionAdapter>,
    lifecycle: Arc<Lifecycle>,
    cancel: CancellationToken,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Collection<E> {
    pub(crate) fn new(adapter: Arc<dyn CollectionAdapter>, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            adapter,
            lifecycle,
            cancel: CancellationToken::new(),
            _entity: PhantomData,
        }
    }

    /// Wraps an adapter directly, outside any data store lifecycle.
    pub fn from_adapter(adapter: Arc<dyn CollectionAdapter>) -> Self {
        Self::new(adapter, Arc::new(Lifecycle::detached()))
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub fn adapter(&self) -> &Arc<dyn CollectionAdapter> {
        &self.adapter
    }

    /// Returns `true` when both handles share one adapter.
    pub fn same_instance<T: Entity>(&self, other: &Collection<T>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.adapter), Arc::as_ptr(&other.adapter))
    }

    /// Re-types this handle over the same adapter.
    pub fn with_type<T: Entity>(&self) -> Collection<T> {
        Collection {
            adapter: self.adapter.clone(),
            lifecycle: self.lifecycle.clone(),
            cancel: self.cancel.clone(),
            _entity: PhantomData,
        }
    }

    /// Binds a cancellation token; operations started after it fires fail with
    /// [`DataStoreError::Cancelled`].
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            adapter: self.adapter.clone(),
            lifecycle: self.lifecycle.clone(),
            cancel,
            _entity: PhantomData,
        }
    }

    fn check_cancelled(&self) -> DataStoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DataStoreError::Cancelled);
        }
        Ok(())
    }

    fn guard(&self) -> DataStoreResult<()> {
        self.lifecycle.ensure_ready()?;
        self.check_cancelled()
    }

    fn to_records(entities: &[E]) -> DataStoreResult<Vec<Record>> {
        entities.iter().map(EntityExt::to_record).collect()
    }

    fn entity_stream(&self, records: RecordStream) -> EntityStream<E> {
        let cancel = self.cancel.clone();

        stream::unfold(Some(records), move |state| {
            let cancel = cancel.clone();
            async move {
                let mut records = state?;
                if cancel.is_cancelled() {
                    return Some((Err(DataStoreError::Cancelled), None));
                }

                match records.next().await? {
                    Ok(record) => Some((E::from_record(record), Some(records))),
                    Err(err) => Some((Err(err), None)),
                }
            }
        })
        .boxed()
    }

    /// Inserts one entity and returns it as stored.
    ///
    /// # Errors
    ///
    /// Returns [`DataStoreError::Conflict`] if the key already exists.
    pub async fn insert(&self, entity: &E) -> DataStoreResult<E> {
        self.guard()?;
        let stored = self.adapter.insert(entity.to_record()?).await?;
        E::from_record(stored)
    }

    /// Inserts entities with the backend's batch primitive, returning the confirmed count.
    pub async fn insert_many(&self, entities: &[E]) -> DataStoreResult<usize> {
        self.guard()?;
        if entities.is_empty() {
            return Ok(0);
        }
        self.adapter.insert_many(Self::to_records(entities)?).await
    }

    /// Inserts or replaces one entity.
    pub async fn upsert(&self, entity: &E) -> DataStoreResult<E> {
        self.guard()?;
        let stored = self.adapter.upsert(entity.to_record()?).await?;
        E::from_record(stored)
    }

    pub async fn upsert_many(&self, entities: &[E]) -> DataStoreResult<usize> {
        self.guard()?;
        if entities.is_empty() {
            return Ok(0);
        }
        self.adapter.upsert_many(Self::to_records(entities)?).await
    }

    /// Replaces an existing entity.
    ///
    /// An unset or empty token overwrites unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`DataStoreError::NotFound`] if the key does not exist and
    /// [`DataStoreError::Conflict`] if the token is stale.
    pub async fn update(&self, entity: &E) -> DataStoreResult<E> {
        self.guard()?;
        let stored = self.adapter.update(entity.to_record()?).await?;
        E::from_record(stored)
    }

    pub async fn update_many(&self, entities: &[E]) -> DataStoreResult<usize> {
        self.guard()?;
        if entities.is_empty() {
            return Ok(0);
        }
        self.adapter.update_many(Self::to_records(entities)?).await
    }

    /// Deletes by key. Returns `false` if nothing was stored under it.
    pub async fn delete(&self, id: &E::Id) -> DataStoreResult<bool> {
        self.guard()?;
        self.adapter.delete(&id.to_key()).await
    }

    pub async fn delete_item(&self, entity: &E) -> DataStoreResult<bool> {
        self.delete(&entity.id()).await
    }

    /// Deletes by keys; missing keys count as zero.
    pub async fn delete_many(&self, ids: &[E::Id]) -> DataStoreResult<usize> {
        self.guard()?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.adapter
            .delete_many(ids.iter().map(Identity::to_key).collect())
            .await
    }

    pub async fn delete_items(&self, entities: &[E]) -> DataStoreResult<usize> {
        let ids = entities.iter().map(Entity::id).collect::<Vec<_>>();
        self.delete_many(&ids).await
    }

    /// Deletes every entity matching all `conditions`, in batches of the adapter's
    /// batch size, and returns the total removed.
    ///
    /// Each round fetches up to one batch of matching keys and deletes them. Rounds
    /// run one after another until a fetch comes back empty; cancellation is checked
    /// before each fetch and before each delete. Batches already deleted stay deleted
    /// when a later round fails.
    ///
    /// # Errors
    ///
    /// Returns [`DataStoreError::Adapter`] when a non-empty batch deletes nothing,
    /// since the loop would otherwise never end.
    pub async fn delete_where(&self, conditions: Vec<Condition>) -> DataStoreResult<usize> {
        self.lifecycle.ensure_ready()?;

        let batch_size = self.adapter.batch_size().max(1);
        let mut deleted = 0;

        loop {
            self.check_cancelled()?;

            let query = Query {
                conditions: conditions.clone(),
                take: Some(batch_size),
                projection: Projection::KeysOnly,
                ..Query::default()
            };
            let keys = self
                .adapter
                .query(query)
                .await?
                .map_ok(|record| record.key)
                .try_collect::<Vec<EntityKey>>()
                .await?;

            if keys.is_empty() {
                break;
            }

            self.check_cancelled()?;

            let fetched = keys.len();
            let removed = self.adapter.delete_many(keys).await?;
            debug!(collection = self.name(), fetched, removed, "deleted batch");

            if removed == 0 {
                return Err(DataStoreError::adapter(
                    "delete_where",
                    self.name(),
                    format!("{fetched} matching keys were fetched but none could be deleted"),
                ));
            }

            deleted += removed;
        }

        Ok(deleted)
    }

    /// Deletes everything. Returns `true` if anything was removed.
    pub async fn delete_all(&self) -> DataStoreResult<bool> {
        self.guard()?;

        if let Some(removed) = self.adapter.clear().await? {
            debug!(collection = self.name(), removed, "cleared collection");
            return Ok(removed > 0);
        }

        Ok(self.delete_where(Vec::new()).await? > 0)
    }

    /// Reads one entity by key.
    ///
    /// # Errors
    ///
    /// Returns [`DataStoreError::NotFound`] if the key does not exist.
    pub async fn get(&self, id: &E::Id) -> DataStoreResult<E> {
        self.guard()?;

        let key = id.to_key();
        match self.adapter.get(&key).await? {
            Some(record) => E::from_record(record),
            None => Err(DataStoreError::not_found(self.name(), key)),
        }
    }

    /// Returns the first entity matching all `conditions` in the adapter's default
    /// order, or `None`.
    pub async fn get_where(&self, conditions: Vec<Condition>) -> DataStoreResult<Option<E>> {
        self.guard()?;

        let query = Query {
            conditions,
            take: Some(1),
            ..Query::default()
        };
        let mut records = self.adapter.query(query).await?;

        match records.try_next().await? {
            Some(record) => Ok(Some(E::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// Streams every entity in the adapter's default order.
    pub async fn get_all(&self, take: Option<usize>, skip: usize) -> DataStoreResult<EntityStream<E>> {
        self.find(Query { take, skip, ..Query::default() }).await
    }

    /// Streams every entity ordered by `field`.
    pub async fn get_all_ordered(
        &self,
        field: impl Into<String>,
        direction: SortDirection,
        take: Option<usize>,
        skip: usize,
    ) -> DataStoreResult<EntityStream<E>> {
        self.find(Query {
            order: vec![Sort { field: field.into(), direction }],
            take,
            skip,
            ..Query::default()
        })
        .await
    }

    /// Streams the entities matching `query`.
    ///
    /// A keys-only projection is rejected here, since bodies are needed to rebuild
    /// entities; use [`count_where`](Self::count_where) or the adapter directly.
    pub async fn find(&self, query: Query) -> DataStoreResult<EntityStream<E>> {
        self.guard()?;

        if query.projection == Projection::KeysOnly {
            return Err(DataStoreError::adapter(
                "find",
                self.name(),
                "keys-only projections cannot produce entities",
            ));
        }

        let records = self.adapter.query(query).await?;
        Ok(self.entity_stream(records))
    }

    pub async fn count(&self) -> DataStoreResult<u64> {
        self.count_where(Vec::new()).await
    }

    /// Counts entities matching all `conditions`.
    pub async fn count_where(&self, conditions: Vec<Condition>) -> DataStoreResult<u64> {
        self.guard()?;
        self.adapter.count(conditions).await
    }

    /// Reads one page of `query`'s matches together with the total match count.
    ///
    /// The window in `params` replaces any `skip`/`take` on the query.
    pub async fn find_page(
        &self,
        query: Query,
        params: &PaginationParams,
    ) -> DataStoreResult<Page<E>> {
        let count = self.count_where(query.conditions.clone()).await?;

        let windowed = Query {
            skip: params.offset(),
            take: Some(params.limit()),
            ..query
        };
        let items = self.find(windowed).await?.try_collect::<Vec<_>>().await?;

        Ok(Page::from_window(items, count, params))
    }
}

impl<E: Entity> Clone for Collection<E> {
    fn clone(&self) -> Self {
        self.with_type::<E>()
    }
}

impl<E: Entity> fmt::Debug for Collection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("entity", &std::any::type_name::<E>())
            .field("adapter", &self.adapter)
            .finish()
    }
}
