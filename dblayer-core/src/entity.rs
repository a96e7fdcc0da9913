//! Identity and entity contracts, and the untyped record every adapter works with.
//!
//! Application types implement [`Entity`]; their key type implements [`Identity`].
//! On the way to a backend an entity becomes a [`Record`]: its [`EntityKey`], its body
//! serialized as a BSON document, and its concurrency token if it carries one.

use bson::{Bson, Document, Uuid, de::deserialize_from_bson, ser::serialize_to_bson};
use serde::{Deserialize, Serialize};
use std::{fmt, hash::Hash};

use crate::error::{DataStoreError, DataStoreResult};

/// Concurrency token that forces an unconditional overwrite.
pub const WILDCARD_ETAG: &str = "*";

/// The persisted shape of an identity: a partition key and a row key.
///
/// Equality, ordering and hashing take both fields into account. Ordering is by
/// partition key first, then row key, which is also the default scan order of the
/// ordered backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub partition_key: String,
    pub row_key: String,
}

impl EntityKey {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey:{};RowKey:{};", self.partition_key, self.row_key)
    }
}

/// A key type that uniquely addresses one entity within a collection.
///
/// Implementations must round-trip through [`EntityKey`]: `from_key(x.to_key()) == x`.
pub trait Identity: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Returns the persisted two-part form of this key.
    fn to_key(&self) -> EntityKey;

    /// Rebuilds a key from its persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`DataStoreError::Serialization`] if the stored key cannot be parsed.
    fn from_key(key: EntityKey) -> DataStoreResult<Self>;
}

impl Identity for EntityKey {
    fn to_key(&self) -> EntityKey {
        self.clone()
    }

    fn from_key(key: EntityKey) -> DataStoreResult<Self> {
        Ok(key)
    }
}

impl Identity for String {
    fn to_key(&self) -> EntityKey {
        EntityKey::new("", self.as_str())
    }

    fn from_key(key: EntityKey) -> DataStoreResult<Self> {
        Ok(key.row_key)
    }
}

impl Identity for Uuid {
    fn to_key(&self) -> EntityKey {
        EntityKey::new("", self.to_string())
    }

    fn from_key(key: EntityKey) -> DataStoreResult<Self> {
        Uuid::parse_str(&key.row_key)
            .map_err(|e| DataStoreError::Serialization(format!("invalid uuid key {}: {e}", key.row_key)))
    }
}

/// Core trait that all entities stored in a data store must implement.
///
/// # Example
///
/// ```ignore
/// use dblayer::prelude::*;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct Order {
///     pub customer: String,
///     pub number: String,
///     pub total: f64,
///     #[serde(skip)]
///     pub etag: Option<String>,
/// }
///
/// impl Entity for Order {
///     type Id = EntityKey;
///
///     fn id(&self) -> EntityKey {
///         EntityKey::new(&self.customer, &self.number)
///     }
///
///     fn set_id(&mut self, id: EntityKey) {
///         self.customer = id.partition_key;
///         self.number = id.row_key;
///     }
///
///     fn etag(&self) -> Option<&str> {
///         self.etag.as_deref()
///     }
///
///     fn set_etag(&mut self, etag: Option<String>) {
///         self.etag = etag;
///     }
/// }
/// ```
pub trait Entity: Serialize + for<'de> Deserialize<'de> + Send + Sync + Clone + 'static {
    /// The key type addressing this entity.
    type Id: Identity;

    /// Returns this entity's key.
    fn id(&self) -> Self::Id;

    /// Writes `id` onto this entity.
    fn set_id(&mut self, id: Self::Id);

    /// Returns the concurrency token, if this entity carries one.
    ///
    /// Only backends with optimistic concurrency read it; the others ignore it.
    fn etag(&self) -> Option<&str> {
        None
    }

    /// Stores the concurrency token assigned by the backend.
    fn set_etag(&mut self, _etag: Option<String>) {}

    /// Returns the default collection name for this entity type.
    ///
    /// Defaults to the fully-qualified type name.
    fn collection_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A stored item as adapters see it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: EntityKey,
    /// The serialized entity. Empty for keys-only projections.
    pub body: Document,
    /// The concurrency token; `None` means unset.
    pub etag: Option<String>,
}

impl Record {
    pub fn new(key: EntityKey, body: Document) -> Self {
        Self { key, body, etag: None }
    }

    /// Creates a body-less record, as returned by keys-only projections.
    pub fn key_only(key: EntityKey) -> Self {
        Self::new(key, Document::new())
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    /// Returns the concurrency token to send as a precondition.
    ///
    /// An unset or empty token becomes [`WILDCARD_ETAG`], i.e. last write wins.
    pub fn etag_or_wildcard(&self) -> &str {
        match self.etag.as_deref() {
            Some(etag) if !etag.is_empty() => etag,
            _ => WILDCARD_ETAG,
        }
    }

    /// Drops the body, keeping key and token.
    pub fn into_key_only(self) -> Self {
        Self {
            key: self.key,
            body: Document::new(),
            etag: self.etag,
        }
    }
}

/// Conversion utilities between entities and records.
///
/// Automatically implemented for all types that implement [`Entity`].
pub trait EntityExt: Entity {
    /// Serializes this entity's fields into a BSON document.
    fn to_document(&self) -> DataStoreResult<Document>;

    /// Builds the record sent to adapters.
    fn to_record(&self) -> DataStoreResult<Record>;

    /// Rebuilds an entity from a full record, applying its key and token.
    fn from_record(record: Record) -> DataStoreResult<Self>;
}

impl<E: Entity> EntityExt for E {
    fn to_document(&self) -> DataStoreResult<Document> {
        match serialize_to_bson(self)? {
            Bson::Document(document) => Ok(document),
            other => Err(DataStoreError::Serialization(format!(
                "entity {} must serialize to a document, got {:?}",
                std::any::type_name::<E>(),
                other.element_type()
            ))),
        }
    }

    fn to_record(&self) -> DataStoreResult<Record> {
        Ok(Record {
            key: self.id().to_key(),
            body: self.to_document()?,
            etag: self
                .etag()
                .filter(|etag| !etag.is_empty())
                .map(str::to_string),
        })
    }

    fn from_record(record: Record) -> DataStoreResult<Self> {
        let mut entity: E = deserialize_from_bson(Bson::Document(record.body))?;
        entity.set_id(E::Id::from_key(record.key)?);
        entity.set_etag(record.etag);

        Ok(entity)
    }
}
