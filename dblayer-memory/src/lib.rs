//! In-memory storage backend for dblayer.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! Each collection is an ordered map from key to record behind an async-aware read-write
//! lock. It is the reference backend for tests and small deployments.
//!
//! # Features
//!
//! - **Key-ordered scans** - Default ordering is partition key, then row key
//! - **Atomic batches** - A batch insert or update either applies fully or not at all
//! - **Full query support** - Every predicate runs in-process
//!
//! # Quick Start
//!
//! ```ignore
//! use dblayer::{prelude::*, memory::InMemoryStore};
//!
//! let store = DataStore::new(InMemoryStore::builder().batch_size(100).build().await?);
//! store.initialize().await?;
//!
//! let devices = store.collection::<Device>()?;
//! devices.insert(&device).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as dblayer_memory;

pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder, MemoryOptions};
