use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::{StreamExt, TryStreamExt, stream};
use mongodb::{
    Client, Collection as MongoCollection, Database,
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{ClientOptions, FindOptions},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use dblayer_core::{
    backend::{CollectionAdapter, RecordStream, StoreBackend, StoreBackendBuilder},
    entity::{EntityKey, Record},
    error::{DataStoreError, DataStoreResult},
    eval,
    query::{Condition, Projection, Query},
};

use crate::{
    query::{ID_FIELD, PARTITION_FIELD, ROW_FIELD, sort_document, translate_conditions},
    sanitizer::ValueSanitizer,
};

const DUPLICATE_KEY: i32 = 11000;

/// Settings for [`MongoDbStore`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MongoDbOptions {
    /// Connection string, e.g. `mongodb://localhost:27017`.
    pub uri: String,
    pub database: String,
    /// Reported to the server in the connection handshake.
    pub app_name: Option<String>,
    pub batch_size: usize,
}

impl Default for MongoDbOptions {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "dblayer".to_string(),
            app_name: None,
            batch_size: 1000,
        }
    }
}

#[derive(Debug)]
pub struct MongoDbStore {
    client: Client,
    database: String,
    batch_size: usize,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self {
            client,
            database,
            batch_size: MongoDbOptions::default().batch_size,
        }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client
            .database(&self.database)
            .collection(&ValueSanitizer::sanitize_string(collection_name))
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn initialize(&self) -> DataStoreResult<()> {
        self.client
            .database(&self.database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| DataStoreError::Connection(e.to_string()))?;

        info!(database = %self.database, "connected to MongoDB");
        Ok(())
    }

    fn open_collection(&self, name: &str) -> DataStoreResult<Arc<dyn CollectionAdapter>> {
        debug!(collection = name, "created MongoDB collection");
        Ok(Arc::new(MongoCollectionAdapter {
            name: name.to_string(),
            database: self.client.database(&self.database),
            collection: self.get_collection(name),
            batch_size: self.batch_size,
        }))
    }

    async fn shutdown(&self) -> DataStoreResult<()> {
        self.client.clone().shutdown().await;
        info!(database = %self.database, "disconnected from MongoDB");
        Ok(())
    }
}

/// Stored `_id` of a record.
fn document_id(key: &EntityKey) -> Document {
    doc! {
        PARTITION_FIELD: key.partition_key.as_str(),
        ROW_FIELD: key.row_key.as_str(),
    }
}

fn id_filter(key: &EntityKey) -> Document {
    doc! { ID_FIELD: document_id(key) }
}

/// Builds the stored document: the escaped body with the compound `_id` first.
fn prepare_document(record: &Record) -> Document {
    let mut document = doc! { ID_FIELD: document_id(&record.key) };
    for (key, value) in ValueSanitizer::sanitize_document(&record.body) {
        if key != ID_FIELD {
            document.insert(key, value);
        }
    }
    document
}

fn restore_record(mut document: Document) -> DataStoreResult<Record> {
    let key = match document.remove(ID_FIELD) {
        Some(Bson::Document(id)) => match (id.get_str(PARTITION_FIELD), id.get_str(ROW_FIELD)) {
            (Ok(partition_key), Ok(row_key)) => EntityKey::new(partition_key, row_key),
            _ => {
                return Err(DataStoreError::Serialization(format!(
                    "stored _id {id} is not a partition/row key"
                )));
            }
        },
        other => {
            return Err(DataStoreError::Serialization(format!(
                "stored document has no compound _id: {other:?}"
            )));
        }
    };

    Ok(Record::new(key, ValueSanitizer::restore_document(document)))
}

/// `updates` statements that replace each record by key, in order.
fn replace_statements(records: &[Record], upsert: bool) -> Vec<Document> {
    records
        .iter()
        .map(|record| {
            doc! {
                "q": id_filter(&record.key),
                "u": prepare_document(record),
                "upsert": upsert,
                "multi": false,
            }
        })
        .collect()
}

/// Reads a count from a command reply; servers reply with any numeric width.
fn reply_count(reply: &Document, field: &str) -> u64 {
    match reply.get(field) {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or_default(),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or_default(),
        Some(Bson::Double(n)) if *n >= 0.0 => *n as u64,
        _ => 0,
    }
}

/// First entry of a reply's `writeErrors`, as `(statement index, code, message)`.
fn first_write_error(reply: &Document) -> Option<(usize, i32, String)> {
    let error = reply.get_array("writeErrors").ok()?.iter().find_map(Bson::as_document)?;
    let index = match error.get("index") {
        Some(Bson::Int32(n)) => usize::try_from(*n).unwrap_or_default(),
        Some(Bson::Int64(n)) => usize::try_from(*n).unwrap_or_default(),
        _ => 0,
    };
    let code = error.get_i32("code").unwrap_or_default();
    let message = error.get_str("errmsg").unwrap_or("write error").to_string();
    Some((index, code, message))
}

fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == DUPLICATE_KEY,
        ErrorKind::InsertMany(insert_error) => insert_error
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY)),
        _ => false,
    }
}

/// Adapter over one MongoDB collection.
#[derive(Debug)]
pub struct MongoCollectionAdapter {
    name: String,
    database: Database,
    collection: MongoCollection<Document>,
    batch_size: usize,
}

impl MongoCollectionAdapter {
    fn error(&self, operation: &'static str, key: Option<&EntityKey>, err: MongoError) -> DataStoreError {
        if is_duplicate_key(&err) {
            let key = key.map_or_else(|| "batch".to_string(), ToString::to_string);
            return DataStoreError::conflict(&self.name, key, "an entity with this key already exists");
        }

        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. } => DataStoreError::Connection(err.to_string()),
            _ => DataStoreError::adapter(operation, &self.name, err),
        }
    }

    async fn replace(&self, record: &Record, upsert: bool) -> DataStoreResult<bool> {
        let result = self
            .collection
            .replace_one(id_filter(&record.key), prepare_document(record))
            .upsert(upsert)
            .await
            .map_err(|e| self.error(if upsert { "upsert" } else { "update" }, Some(&record.key), e))?;

        Ok(result.matched_count > 0 || result.upserted_id.is_some())
    }

    /// Replaces `records` with one ordered `update` command per batch and
    /// returns how many statements matched or upserted. A failing batch stops
    /// the call; earlier batches stay applied.
    async fn replace_many(&self, records: &[Record], upsert: bool) -> DataStoreResult<usize> {
        let operation = if upsert { "upsert_many" } else { "update_many" };
        let mut applied = 0;

        for batch in records.chunks(self.batch_size.max(1)) {
            let command = doc! {
                "update": self.collection.name(),
                "updates": replace_statements(batch, upsert),
                "ordered": true,
            };
            let reply = self
                .database
                .run_command(command)
                .await
                .map_err(|e| self.error(operation, None, e))?;

            if let Some((index, code, message)) = first_write_error(&reply) {
                let key = batch.get(index).map_or_else(|| "batch".to_string(), |r| r.key.to_string());
                return Err(if code == DUPLICATE_KEY {
                    DataStoreError::conflict(&self.name, key, message)
                } else {
                    DataStoreError::adapter(operation, &self.name, format!("{key}: {message}"))
                });
            }

            let matched = reply_count(&reply, "n") as usize;
            if !upsert && matched < batch.len() {
                return Err(DataStoreError::not_found(&self.name, self.first_missing(batch).await?));
            }

            debug!(collection = %self.name, operation, matched, "replaced batch");
            applied += matched;
        }

        Ok(applied)
    }

    /// Key of the first record in `batch` with no stored document.
    async fn first_missing(&self, batch: &[Record]) -> DataStoreResult<String> {
        let ids = batch.iter().map(|record| document_id(&record.key)).collect::<Vec<_>>();
        let stored = self
            .collection
            .find(doc! { ID_FIELD: { "$in": ids } })
            .projection(doc! { ID_FIELD: 1 })
            .await
            .map_err(|e| self.error("update_many", None, e))?
            .map(|document| document.map_err(|e| DataStoreError::adapter("update_many", &self.name, e)).and_then(restore_record))
            .map_ok(|record| record.key)
            .try_collect::<Vec<_>>()
            .await?;

        Ok(batch
            .iter()
            .find(|record| !stored.contains(&record.key))
            .map_or_else(|| "batch".to_string(), |record| record.key.to_string()))
    }

    fn cursor_stream(&self, cursor: mongodb::Cursor<Document>) -> RecordStream {
        let name = self.name.clone();
        cursor
            .map(move |document| {
                document
                    .map_err(|e| DataStoreError::adapter("query", &name, e))
                    .and_then(restore_record)
            })
            .boxed()
    }
}

#[async_trait]
impl CollectionAdapter for MongoCollectionAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn insert(&self, record: Record) -> DataStoreResult<Record> {
        self.collection
            .insert_one(prepare_document(&record))
            .await
            .map_err(|e| self.error("insert", Some(&record.key), e))?;

        Ok(record.with_etag(None))
    }

    async fn insert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let result = self
            .collection
            .insert_many(records.iter().map(prepare_document))
            .await
            .map_err(|e| self.error("insert_many", None, e))?;

        Ok(result.inserted_ids.len())
    }

    async fn upsert(&self, record: Record) -> DataStoreResult<Record> {
        self.replace(&record, true).await?;
        Ok(record.with_etag(None))
    }

    async fn upsert_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        self.replace_many(&records, true).await
    }

    async fn update(&self, record: Record) -> DataStoreResult<Record> {
        if !self.replace(&record, false).await? {
            return Err(DataStoreError::not_found(&self.name, &record.key));
        }
        Ok(record.with_etag(None))
    }

    async fn update_many(&self, records: Vec<Record>) -> DataStoreResult<usize> {
        self.replace_many(&records, false).await
    }

    async fn delete(&self, key: &EntityKey) -> DataStoreResult<bool> {
        let result = self
            .collection
            .delete_one(id_filter(key))
            .await
            .map_err(|e| self.error("delete", Some(key), e))?;

        Ok(result.deleted_count > 0)
    }

    async fn delete_many(&self, keys: Vec<EntityKey>) -> DataStoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let ids = keys.iter().map(document_id).collect::<Vec<_>>();
        let result = self
            .collection
            .delete_many(doc! { ID_FIELD: { "$in": ids } })
            .await
            .map_err(|e| self.error("delete_many", None, e))?;

        Ok(result.deleted_count as usize)
    }

    async fn get(&self, key: &EntityKey) -> DataStoreResult<Option<Record>> {
        self.collection
            .find_one(id_filter(key))
            .await
            .map_err(|e| self.error("get", Some(key), e))?
            .map(restore_record)
            .transpose()
    }

    async fn query(&self, query: Query) -> DataStoreResult<RecordStream> {
        if query.take == Some(0) {
            return Ok(stream::empty().boxed());
        }

        let translated = translate_conditions(&query.conditions);
        let native = translated.residual.is_empty();

        debug!(
            collection = %self.name,
            filter = %translated.filter,
            residual = translated.residual.len(),
            "planned MongoDB query"
        );

        let mut options = FindOptions::default();
        if native {
            if !query.order.is_empty() {
                options.sort = Some(sort_document(&query.order));
            }
            if query.skip > 0 {
                options.skip = Some(query.skip as u64);
            }
            if let Some(take) = query.take {
                options.limit = Some(take as i64);
            }
            if query.projection == Projection::KeysOnly {
                options.projection = Some(doc! { ID_FIELD: 1 });
            }
        }

        let cursor = self
            .collection
            .find(translated.filter)
            .with_options(options)
            .await
            .map_err(|e| self.error("query", None, e))?;
        let records = self.cursor_stream(cursor);

        if native {
            return Ok(records);
        }

        Ok(eval::refine_stream(records, &query, translated.residual))
    }

    async fn count(&self, conditions: Vec<Condition>) -> DataStoreResult<u64> {
        let translated = translate_conditions(&conditions);

        if translated.residual.is_empty() {
            return self
                .collection
                .count_documents(translated.filter)
                .await
                .map_err(|e| self.error("count", None, e));
        }

        let cursor = self
            .collection
            .find(translated.filter)
            .await
            .map_err(|e| self.error("count", None, e))?;

        self.cursor_stream(cursor)
            .try_fold(0u64, |count, record| {
                let residual = &translated.residual;
                let matched = eval::matches_all(residual, &record);
                async move { Ok(count + u64::from(matched?)) }
            })
            .await
    }

    async fn clear(&self) -> DataStoreResult<Option<usize>> {
        let result = self
            .collection
            .delete_many(doc! {})
            .await
            .map_err(|e| self.error("clear", None, e))?;

        Ok(Some(result.deleted_count as usize))
    }
}

pub struct MongoDbStoreBuilder {
    options: MongoDbOptions,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            options: MongoDbOptions {
                uri: dsn.to_string(),
                database: database.to_string(),
                ..MongoDbOptions::default()
            },
        }
    }

    pub fn from_options(options: MongoDbOptions) -> Self {
        Self { options }
    }

    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.options.app_name = Some(app_name.into());
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.options.batch_size = batch_size;
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> DataStoreResult<Self::Backend> {
        let mut client_options = ClientOptions::parse(&self.options.uri)
            .await
            .map_err(|e| DataStoreError::Connection(e.to_string()))?;
        if let Some(app_name) = self.options.app_name {
            client_options.app_name = Some(app_name);
        }

        let client =
            Client::with_options(client_options).map_err(|e| DataStoreError::Connection(e.to_string()))?;

        Ok(MongoDbStore {
            client,
            database: self.options.database,
            batch_size: self.options.batch_size.max(1),
        })
    }
}
