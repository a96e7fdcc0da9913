//! Errors raised inside the sled adapter before they are mapped to [`DataStoreError`].

use sled::transaction::TransactionError;
use thiserror::Error;

use dblayer_core::{entity::EntityKey, error::DataStoreError};

#[derive(Debug, Error)]
pub enum SledError {
    /// Database failed to open
    #[error("Database open failed: {0}")]
    OpenFailed(String),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] sled::Error),

    /// Key cannot be encoded, e.g. a partition key containing NUL
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Stored bytes do not decode
    #[error("Corrupt entry {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("Entity {0} already exists")]
    KeyExists(EntityKey),

    #[error("Entity {0} does not exist")]
    KeyMissing(EntityKey),

    /// A predicate failed while scanning
    #[error(transparent)]
    Evaluation(DataStoreError),

    /// Task execution failed
    #[error("Task execution failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, SledError>;

impl SledError {
    /// Maps this error into the store-wide taxonomy for `operation` on `collection`.
    pub fn into_store_error(self, operation: &'static str, collection: &str) -> DataStoreError {
        match self {
            SledError::OpenFailed(message) => DataStoreError::Connection(message),
            SledError::KeyExists(key) => {
                DataStoreError::conflict(collection, key, "an entity with this key already exists")
            }
            SledError::KeyMissing(key) => DataStoreError::not_found(collection, key),
            SledError::Evaluation(err) => err,
            err @ SledError::Corrupt { .. } => DataStoreError::Serialization(err.to_string()),
            err => DataStoreError::adapter(operation, collection, err),
        }
    }
}

impl From<TransactionError<SledError>> for SledError {
    fn from(err: TransactionError<SledError>) -> Self {
        match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => SledError::Storage(err),
        }
    }
}
