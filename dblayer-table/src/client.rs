//! The table-service boundary.
//!
//! [`TableClient`] is the surface a table-service SDK offers: single-entity
//! operations, atomic single-partition batches, and segmented queries with a
//! continuation token. [`TableStore`](crate::store::TableStore) is written against
//! this trait only; [`MemoryTableClient`](crate::emulator::MemoryTableClient) is an
//! in-process implementation of it.

use async_trait::async_trait;
use bson::Document;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use thiserror::Error;

use dblayer_core::{entity::EntityKey, query::Expr};

/// Most operations one batch may carry.
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// Most entities one query segment returns.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Property names the service owns. They are never stored as user properties.
pub const RESERVED_PROPERTIES: [&str; 4] = ["PartitionKey", "RowKey", "Timestamp", "ETag"];

#[derive(Debug, Error)]
pub enum TableError {
    /// 409
    #[error("entity {0} already exists")]
    EntityAlreadyExists(EntityKey),

    /// 404 for an entity
    #[error("entity {0} was not found")]
    ResourceNotFound(EntityKey),

    /// 412
    #[error("precondition failed for entity {0}: the etag does not match")]
    PreconditionFailed(EntityKey),

    /// 404 for the table itself
    #[error("table {0} does not exist")]
    TableNotFound(String),

    /// 400 raised before any operation of a batch ran
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// 400 for a filter the service cannot evaluate
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// An operation inside a batch failed; nothing in the batch was applied.
    #[error("batch operation {index} failed: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<TableError>,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl TableError {
    /// HTTP status the service answers with for this error.
    pub fn status(&self) -> u16 {
        match self {
            TableError::EntityAlreadyExists(_) => 409,
            TableError::ResourceNotFound(_) | TableError::TableNotFound(_) => 404,
            TableError::PreconditionFailed(_) => 412,
            TableError::InvalidBatch(_) | TableError::InvalidQuery(_) => 400,
            TableError::Batch { source, .. } => source.status(),
            TableError::Transport(_) => 503,
        }
    }

    /// The innermost error, looking through batch wrappers.
    pub fn root(&self) -> &TableError {
        match self {
            TableError::Batch { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type TableResult<T> = Result<T, TableError>;

/// One row of a table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    /// Assigned by the service on every write.
    pub etag: Option<String>,
    /// Last-modified time, assigned by the service.
    pub timestamp: Option<DateTime<Utc>>,
    pub properties: Document,
}

impl TableEntity {
    pub fn new(key: &EntityKey, properties: Document) -> Self {
        Self {
            partition_key: key.partition_key.clone(),
            row_key: key.row_key.clone(),
            etag: None,
            timestamp: None,
            properties,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.partition_key, &self.row_key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableOperation {
    /// Fails with 409 if the entity exists.
    Insert(TableEntity),
    InsertOrReplace(TableEntity),
    /// Fails with 404 if missing, 412 if `if_match` is neither `*` nor the current etag.
    Replace { entity: TableEntity, if_match: String },
    Delete { key: EntityKey, if_match: String },
    /// Point read; only valid alone, never inside a batch.
    Retrieve(EntityKey),
}

impl TableOperation {
    pub fn partition_key(&self) -> &str {
        match self {
            TableOperation::Insert(entity)
            | TableOperation::InsertOrReplace(entity)
            | TableOperation::Replace { entity, .. } => &entity.partition_key,
            TableOperation::Delete { key, .. } | TableOperation::Retrieve(key) => &key.partition_key,
        }
    }

    pub fn row_key(&self) -> &str {
        match self {
            TableOperation::Insert(entity)
            | TableOperation::InsertOrReplace(entity)
            | TableOperation::Replace { entity, .. } => &entity.row_key,
            TableOperation::Delete { key, .. } | TableOperation::Retrieve(key) => &key.row_key,
        }
    }
}

/// A server-side filter.
///
/// `text` is the OData rendering sent over the wire; `expr` is the expression it
/// was rendered from, for clients that evaluate filters locally.
#[derive(Debug, Clone, PartialEq)]
pub struct TableFilter {
    pub text: String,
    pub expr: Expr,
}

/// Resume point of a segmented query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    pub next_partition_key: String,
    pub next_row_key: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableQuery {
    pub filter: Option<TableFilter>,
    /// Select only `PartitionKey`, `RowKey` and the etag.
    pub select_keys_only: bool,
    /// Page size hint, capped at [`MAX_PAGE_SIZE`].
    pub top: Option<usize>,
    pub continuation: Option<ContinuationToken>,
}

/// One page of query results in partition-then-row order.
#[derive(Debug, Clone, Default)]
pub struct QuerySegment {
    pub entities: Vec<TableEntity>,
    /// Present when more results follow.
    pub continuation: Option<ContinuationToken>,
}

/// Operations a table-service SDK exposes.
#[async_trait]
pub trait TableClient: Send + Sync + Debug {
    /// Checks that the service is reachable with the configured credentials.
    async fn ping(&self) -> TableResult<()>;

    /// Returns `true` when the table was created by this call.
    async fn create_table_if_not_exists(&self, table: &str) -> TableResult<bool>;

    /// Runs one operation. Returns the stored entity for writes and hits, `None`
    /// for deletes and retrieve misses.
    async fn execute(&self, table: &str, operation: TableOperation) -> TableResult<Option<TableEntity>>;

    /// Runs up to [`MAX_BATCH_OPERATIONS`] operations on one partition atomically.
    async fn execute_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> TableResult<Vec<Option<TableEntity>>>;

    async fn query(&self, table: &str, query: &TableQuery) -> TableResult<QuerySegment>;
}
