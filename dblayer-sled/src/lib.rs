//! Embedded key-value backend for dblayer, built on sled.
//!
//! Every collection is a sled tree in one database directory. Entity keys are
//! laid out so that sled's byte order matches partition-then-row order, which makes
//! a partition-key filter a prefix scan.
//!
//! # Features
//!
//! - **Durable storage** - Data lives on disk and is flushed on shutdown
//! - **Transactional batches** - Batch insert, update and delete commit as one sled transaction
//! - **Fast clear** - Deleting every entity truncates the tree in one step
//!
//! # Quick Start
//!
//! ```ignore
//! use dblayer::{prelude::*, sled::SledStore};
//!
//! let store = DataStore::from_builder(SledStore::builder().path("./data")).await?;
//! store.initialize().await?;
//!
//! let readings = store.collection::<Reading>()?;
//! readings.upsert(&reading).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as dblayer_sled;

pub mod codec;
pub mod collection;
pub mod error;
pub mod store;

pub use collection::SledCollection;
pub use error::SledError;
pub use store::{SledOptions, SledStore, SledStoreBuilder};
