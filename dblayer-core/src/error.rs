//! Error types and result types for data store operations.
//!
//! Every adapter maps its backend's native failures into [`DataStoreError`] so callers
//! only ever see one failure model, whatever storage technology sits underneath.
//! Use [`DataStoreResult<T>`] as the return type for fallible operations.

use bson::error::Error as BsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with a data store.
#[derive(Error, Debug)]
pub enum DataStoreError {
    /// The database handle was used before `initialize` or after `dispose`.
    #[error("Data store not initialized: {0}")]
    NotInitialized(String),
    /// The backend is unreachable or misconfigured.
    #[error("Connection error: {0}")]
    Connection(String),
    /// An insert hit an existing key, or an update failed its concurrency-token check.
    #[error("Conflict on {key} in collection {collection}: {reason}")]
    Conflict {
        collection: String,
        key: String,
        reason: String,
    },
    /// A point lookup or update addressed a key that does not exist.
    #[error("Entity {key} not found in collection {collection}")]
    NotFound { collection: String, key: String },
    /// Cooperative cancellation was observed between steps of an operation.
    #[error("Operation cancelled")]
    Cancelled,
    /// Converting an entity to or from its stored representation failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// A backend-specific failure, wrapped with the operation and its target.
    #[error("Backend error during {operation} on {context}: {message}")]
    Adapter {
        operation: &'static str,
        context: String,
        message: String,
    },
}

impl DataStoreError {
    /// Wraps a backend failure for `operation` on `context` (a collection name, optionally with a key).
    pub fn adapter(
        operation: &'static str,
        context: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        DataStoreError::Adapter {
            operation,
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn conflict(
        collection: impl Into<String>,
        key: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        DataStoreError::Conflict {
            collection: collection.into(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found(collection: impl Into<String>, key: impl ToString) -> Self {
        DataStoreError::NotFound {
            collection: collection.into(),
            key: key.to_string(),
        }
    }

    /// Returns `true` for [`DataStoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, DataStoreError::NotFound { .. })
    }

    /// Returns `true` for [`DataStoreError::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, DataStoreError::Conflict { .. })
    }
}

/// A specialized `Result` type for data store operations.
pub type DataStoreResult<T> = Result<T, DataStoreError>;

impl From<BsonError> for DataStoreError {
    fn from(err: BsonError) -> Self {
        DataStoreError::Serialization(err.to_string())
    }
}
