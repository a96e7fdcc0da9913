//! Main dblayer crate providing one data-access interface over several stores.
//!
//! Application code defines entities once and performs CRUD and query operations
//! through a [`Collection`](collection::Collection) without knowing which storage
//! technology sits underneath. This crate re-exports the core types and the
//! backends selected through Cargo features.
//!
//! # Features
//!
//! - **Uniform operations** - Insert, upsert, update, delete, get, find and count on every backend
//! - **Hybrid queries** - Structural filters run natively where the backend can, closures in-process
//! - **Predicate deletes** - Unbounded deletes run as sequential, cancellable batches
//! - **Optimistic concurrency** - Etags are honoured by backends that support them
//!
//! # Quick Start
//!
//! ```ignore
//! use dblayer::{prelude::*, memory::InMemoryStore};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct Device {
//!     #[serde(skip)]
//!     pub id: EntityKey,
//!     pub model: String,
//!     pub firmware: i32,
//! }
//!
//! impl Entity for Device {
//!     type Id = EntityKey;
//!
//!     fn id(&self) -> EntityKey { self.id.clone() }
//!     fn set_id(&mut self, id: EntityKey) { self.id = id; }
//!     fn collection_name() -> &'static str { "devices" }
//! }
//!
//! #[tokio::main]
//! async fn main() -> DataStoreResult<()> {
//!     let store = DataStore::from_builder(InMemoryStore::builder()).await?;
//!     store.initialize().await?;
//!
//!     let devices = store.collection::<Device>()?;
//!     devices.insert(&Device {
//!         id: EntityKey::new("site-1", "dev-7"),
//!         model: "sensor".into(),
//!         firmware: 3,
//!     }).await?;
//!
//!     let outdated = devices
//!         .delete_where(vec![Filter::lt("firmware", 4).into()])
//!         .await?;
//!     println!("removed {outdated} devices");
//!
//!     store.dispose().await
//! }
//! ```
//!
//! # Dynamic Dispatch
//!
//! When the backend is chosen at runtime, erase its type with
//! [`DataStore::into_dyn`](store::DataStore::into_dyn). The resulting
//! [`DynDataStore`](store::DynDataStore) hands out the same typed collections.
//!
//! ```ignore
//! let store: DynDataStore = if use_disk {
//!     DataStore::from_builder(SledStore::builder().path("data/db")).await?.into_dyn()
//! } else {
//!     DataStore::from_builder(InMemoryStore::builder()).await?.into_dyn()
//! };
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-process ordered maps, for tests and small deployments (`memory` feature)
//! - [`sled`] - Embedded persistent key-value engine (`sled` feature)
//! - [`table`] - Cloud partitioned table store behind a `TableClient` (`table` feature)
//! - [`mongodb`] - MongoDB document database (`mongodb` feature)

pub mod prelude;

pub use dblayer_core::{backend, collection, entity, error, eval, page, query, store};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend.
#[cfg(feature = "memory")]
pub mod memory {
    pub use dblayer_memory::{InMemoryStore, InMemoryStoreBuilder, MemoryOptions};
}

/// Embedded key-value backend on sled.
#[cfg(feature = "sled")]
pub mod sled {
    pub use dblayer_sled::{SledCollection, SledError, SledOptions, SledStore, SledStoreBuilder};
}

/// Cloud table-store backend and its in-process emulator.
#[cfg(feature = "table")]
pub mod table {
    pub use dblayer_table::{
        MemoryTableClient, TableClient, TableCollection, TableEntity, TableError, TableOperation,
        TableOptions, TableQuery, TableStore, TableStoreBuilder,
    };
}

/// MongoDB storage backend.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use dblayer_mongodb::{MongoDbOptions, MongoDbStore, MongoDbStoreBuilder};
}
