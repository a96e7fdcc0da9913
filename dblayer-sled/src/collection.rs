//! One collection stored as a sled tree.

use async_trait::async_trait;
use futures::{StreamExt, stream};
use sled::{
    Batch, Tree,
    transaction::{ConflictableTransactionError, ConflictableTransactionResult},
};
use tokio::sync::OnceCell;
use tracing::debug;

use dblayer_core::{
    backend::{CollectionAdapter, RecordStream},
    entity::{EntityKey, Record},
    error::{DataStoreError, DataStoreResult},
    eval,
    query::{Condition, Expr, FieldOp, PARTITION_KEY_FIELD, Query},
};

use crate::{
    codec,
    error::{Result, SledError},
};

type Entry = (EntityKey, Vec<u8>, Vec<u8>);

/// Adapter over one sled tree.
///
/// Writes are atomic per record; the batch variants of insert, update and delete
/// run as a single sled transaction. Concurrency tokens are ignored.
#[derive(Debug)]
pub struct SledCollection {
    name: String,
    db: sled::Db,
    tree: OnceCell<Tree>,
    batch_size: usize,
}

impl SledCollection {
    pub(crate) fn new(name: &str, db: sled::Db, batch_size: usize) -> Self {
        Self {
            name: name.to_string(),
            db,
            tree: OnceCell::new(),
            batch_size,
        }
    }

    async fn tree(&self) -> DataStoreResult<Tree> {
        let tree = self
            .tree
            .get_or_try_init(|| async {
                let db = self.db.clone();
                let name = self.name.clone();
                let tree = tokio::task::spawn_blocking(move || db.open_tree(name))
                    .await
                    .map_err(|e| SledError::TaskFailed(e.to_string()))??;

                debug!(collection = %self.name, "opened sled tree");
                Ok::<_, SledError>(tree)
            })
            .await
            .map_err(|e| e.into_store_error("open_tree", &self.name))?;

        Ok(tree.clone())
    }

    /// Runs `f` against the tree on the blocking pool.
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> DataStoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Tree) -> Result<T> + Send + 'static,
    {
        let tree = self.tree().await?;
        tokio::task::spawn_blocking(move || f(tree))
            .await
            .map_err(|e| SledError::TaskFailed(e.to_string()))
            .and_then(|result| result)
            .map_err(|e| e.into_store_error(operation, &self.name))
    }

    fn encode(record: &Record) -> Result<Entry> {
        Ok((
            record.key.clone(),
            codec::encode_key(&record.key)?,
            codec::encode_value(&record.body)?,
        ))
    }

    fn encode_all(records: &[Record]) -> Result<Vec<Entry>> {
        records.iter().map(Self::encode).collect()
    }

    fn encode_error(&self, operation: &'static str, err: SledError) -> DataStoreError {
        err.into_store_error(operation, &self.name)
    }
}

/// Partition key pinned by a top-level equality condition, if any.
fn partition_scope(conditions: &[Condition]) -> Option<String> {
    fn pinned(expr: &Expr) -> Option<&str> {
        match expr {
            Expr::Field {
                field,
                op: FieldOp::Eq,
                value: bson::Bson::String(value),
            } if field == PARTITION_KEY_FIELD => Some(value.as_str()),
            Expr::And(exprs) => exprs.iter().find_map(pinned),
            _ => None,
        }
    }

    conditions
        .iter()
        .filter_map(Condition::as_expr)
        .find_map(pinned)
        .map(str::to_string)
}

/// Decoded records of the tree, limited to one partition when `prefix` is set.
fn scan(
    tree: &Tree,
    prefix: Option<&[u8]>,
    collection: &str,
) -> impl Iterator<Item = DataStoreResult<Record>> {
    let entries = match prefix {
        Some(prefix) => tree.scan_prefix(prefix),
        None => tree.iter(),
    };

    let collection = collection.to_string();
    entries.map(move |entry| {
        entry
            .map_err(SledError::from)
            .and_then(|(key, value)| codec::decode_record(&key, &value))
            .map_err(|e| e.into_store_error("query", &collection))
    })
}

/// Resolves the scan prefix for `conditions`. `Err(())` means no record can match.
fn scan_prefix(conditions: &[Condition]) -> std::result::Result<Option<Vec<u8>>, ()> {
    match partition_scope(conditions) {
        Some(partition_key) => codec::partition_prefix(&partition_key)
            .map(Some)
            .map_err(|_| ()),
        None => Ok(None),
    }
}

#[async_trait]
impl CollectionAdapter for SledCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn insert(&self, record: Record) -> DataStoreResult<Record> {
        let (key, key_bytes, value) =
            Self::encode(&record).map_err(|e| self.encode_error("insert", e))?;

        self.blocking("insert", move |tree| {
            tree.compare_and_swap(key_bytes, None::<&[u8]>, Some(value))?
                .map_err(|_| SledError::KeyExists(key))
        })
        .await?;

        Ok(record.with_etag(None))
    }

    async fn insert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        let entries = Self::encode_all(&records).map_err(|e| self.encode_error("insert_many", e))?;

        self.blocking("insert_many", move |tree| {
            let count = tree.transaction(|tx| -> ConflictableTransactionResult<usize, SledError> {
                for (key, key_bytes, value) in &entries {
                    if tx.get(key_bytes.as_slice())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(SledError::KeyExists(
                            key.clone(),
                        )));
                    }
                    tx.insert(key_bytes.as_slice(), value.as_slice())?;
                }
                Ok(entries.len())
            })?;
            Ok(count)
        })
        .await
    }

    async fn upsert(&self, record: Record) -> DataStoreResult<Record> {
        let (_, key_bytes, value) =
            Self::encode(&record).map_err(|e| self.encode_error("upsert", e))?;

        self.blocking("upsert", move |tree| {
            tree.insert(key_bytes, value)?;
            Ok(())
        })
        .await?;

        Ok(record.with_etag(None))
    }

    async fn upsert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        let entries = Self::encode_all(&records).map_err(|e| self.encode_error("upsert_many", e))?;
        let count = entries.len();

        self.blocking("upsert_many", move |tree| {
            let mut batch = Batch::default();
            for (_, key_bytes, value) in entries {
                batch.insert(key_bytes, value);
            }
            tree.apply_batch(batch)?;
            Ok(count)
        })
        .await
    }

    async fn update(&self, record: Record) -> DataStoreResult<Record> {
        let (key, key_bytes, value) =
            Self::encode(&record).map_err(|e| self.encode_error("update", e))?;

        self.blocking("update", move |tree| {
            tree.fetch_and_update(key_bytes, |old| old.map(|_| value.clone()))?
                .map(|_| ())
                .ok_or(SledError::KeyMissing(key))
        })
        .await?;

        Ok(record.with_etag(None))
    }

    async fn update_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        let entries = Self::encode_all(&records).map_err(|e| self.encode_error("update_many", e))?;

        self.blocking("update_many", move |tree| {
            let count = tree.transaction(|tx| -> ConflictableTransactionResult<usize, SledError> {
                for (key, key_bytes, value) in &entries {
                    if tx.get(key_bytes.as_slice())?.is_none() {
                        return Err(ConflictableTransactionError::Abort(SledError::KeyMissing(
                            key.clone(),
                        )));
                    }
                    tx.insert(key_bytes.as_slice(), value.as_slice())?;
                }
                Ok(entries.len())
            })?;
            Ok(count)
        })
        .await
    }

    async fn delete(&self, key: &EntityKey) -> DataStoreResult<bool> {
        // Keys that cannot be encoded were never stored.
        let Ok(key_bytes) = codec::encode_key(key) else {
            return Ok(false);
        };

        self.blocking("delete", move |tree| Ok(tree.remove(key_bytes)?.is_some()))
            .await
    }

    async fn delete_many(&self, keys: Vec<EntityKey>) -> DataStoreResult<usize> {
        let encoded = keys
            .iter()
            .filter_map(|key| codec::encode_key(key).ok())
            .collect::<Vec<_>>();

        self.blocking("delete_many", move |tree| {
            let removed = tree.transaction(|tx| -> ConflictableTransactionResult<usize, SledError> {
                let mut removed = 0;
                for key_bytes in &encoded {
                    if tx.remove(key_bytes.as_slice())?.is_some() {
                        removed += 1;
                    }
                }
                Ok(removed)
            })?;
            Ok(removed)
        })
        .await
    }

    async fn get(&self, key: &EntityKey) -> DataStoreResult<Option<Record>> {
        let Ok(key_bytes) = codec::encode_key(key) else {
            return Ok(None);
        };

        self.blocking("get", move |tree| {
            tree.get(&key_bytes)?
                .map(|value| codec::decode_record(&key_bytes, &value))
                .transpose()
        })
        .await
    }

    async fn query(&self, query: Query) -> DataStoreResult<RecordStream> {
        let Ok(prefix) = scan_prefix(&query.conditions) else {
            return Ok(stream::empty().boxed());
        };

        let name = self.name.clone();
        let records = self
            .blocking("query", move |tree| {
                let records = scan(&tree, prefix.as_deref(), &name);
                eval::run_query(records, &query).map_err(SledError::Evaluation)
            })
            .await?;

        Ok(stream::iter(records.into_iter().map(Ok)).boxed())
    }

    async fn count(&self, conditions: Vec<Condition>) -> DataStoreResult<u64> {
        let Ok(prefix) = scan_prefix(&conditions) else {
            return Ok(0);
        };

        let name = self.name.clone();
        self.blocking("count", move |tree| {
            if conditions.is_empty() {
                return Ok(tree.len() as u64);
            }

            let mut count = 0;
            for record in scan(&tree, prefix.as_deref(), &name) {
                let record = record.map_err(SledError::Evaluation)?;
                if eval::matches_all(&conditions, &record).map_err(SledError::Evaluation)? {
                    count += 1;
                }
            }
            Ok(count)
        })
        .await
    }

    async fn clear(&self) -> DataStoreResult<Option<usize>> {
        let removed = self
            .blocking("clear", |tree| {
                let removed = tree.len();
                tree.clear()?;
                Ok(removed)
            })
            .await?;

        debug!(collection = %self.name, removed, "cleared sled tree");
        Ok(Some(removed))
    }

    async fn close(&self) -> DataStoreResult<()> {
        if let Some(tree) = self.tree.get() {
            tree.flush_async()
                .await
                .map_err(|e| SledError::from(e).into_store_error("close", &self.name))?;
        }
        Ok(())
    }
}
