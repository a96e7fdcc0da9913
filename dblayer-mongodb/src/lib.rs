//! MongoDB backend for dblayer.
//!
//! Each collection maps onto a MongoDB collection of the same (escaped) name. A record
//! is stored with its key as a compound `_id` of `{ p: partition, r: row }`, so
//! partition scans and point lookups hit the primary index.
//!
//! To use this backend, enable the `mongodb` feature:
//!
//! ```toml
//! [dependencies]
//! dblayer = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Native queries** - Filters, ordering and windows run on the server whenever they translate
//! - **Escaped field names** - Dots, dollar signs and NUL bytes in keys survive a round trip
//! - **Fast clear** - Deleting every record is a single server-side command
//!
//! # Example
//!
//! ```ignore
//! use dblayer::{prelude::*, mongodb::MongoDbStore};
//!
//! let store = DataStore::from_builder(
//!     MongoDbStore::builder("mongodb://localhost:27017", "inventory").app_name("inventory-api"),
//! )
//! .await?;
//! store.initialize().await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as dblayer_mongodb;

pub mod query;
pub mod sanitizer;
pub mod store;

pub use store::{MongoCollectionAdapter, MongoDbOptions, MongoDbStore, MongoDbStoreBuilder};
