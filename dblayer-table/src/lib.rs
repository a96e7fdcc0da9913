//! Cloud table-store backend for dblayer.
//!
//! A table service stores schemaless entities addressed by a partition key and a
//! row key, with a service-assigned etag for optimistic concurrency. This crate
//! maps collections onto tables through the [`TableClient`] trait, the operations
//! a table SDK exposes, and ships [`MemoryTableClient`], an in-process emulator of
//! the service.
//!
//! # Features
//!
//! - **Optimistic concurrency** - Updates carry the entity's etag; an empty etag overwrites
//! - **Partition batches** - Batch writes are grouped per partition and chunked at the service limit
//! - **Hybrid queries** - Filters with an OData form run on the service, the rest in-process
//!
//! # Quick Start
//!
//! ```ignore
//! use dblayer::{prelude::*, table::TableStore};
//!
//! let store = DataStore::from_builder(TableStore::builder().client(sdk_client)).await?;
//! store.initialize().await?;
//!
//! let orders = store.collection::<Order>()?;
//! let stored = orders.insert(&order).await?;
//! orders.update(&stored).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as dblayer_table;

pub mod client;
pub mod emulator;
pub mod odata;
pub mod store;

pub use client::{
    MAX_BATCH_OPERATIONS, MAX_PAGE_SIZE, QuerySegment, TableClient, TableEntity, TableError,
    TableOperation, TableQuery,
};
pub use emulator::MemoryTableClient;
pub use store::{TableCollection, TableOptions, TableStore, TableStoreBuilder, physical_table_name};
