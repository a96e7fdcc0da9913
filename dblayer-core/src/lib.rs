//! A uniform entity data-access layer over heterogeneous storage backends.
//!
//! This crate is the core of the dblayer project and provides:
//!
//! - **Entity contracts** ([`entity`]) - Keys, entities and the records adapters exchange
//! - **Query model** ([`query`]) - Structural filters, compiled predicates, ordering and windows
//! - **In-process evaluation** ([`eval`]) - The fallback every adapter can run queries on
//! - **Backend abstraction** ([`backend`]) - Traits implemented once per storage technology
//! - **Collections** ([`collection`]) - The typed operation surface, including predicate deletes
//! - **Data store** ([`store`]) - The database handle: collection registry and lifecycle
//! - **Error handling** ([`error`]) - One failure model for every backend
//! - **Paging** ([`page`]) - Page results and pagination parameters
//!
//! # Example
//!
//! ```ignore
//! use dblayer::prelude::*;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct Device {
//!     #[serde(skip)]
//!     pub id: EntityKey,
//!     pub model: String,
//! }
//!
//! impl Entity for Device {
//!     type Id = EntityKey;
//!
//!     fn id(&self) -> EntityKey {
//!         self.id.clone()
//!     }
//!
//!     fn set_id(&mut self, id: EntityKey) {
//!         self.id = id;
//!     }
//!
//!     fn collection_name() -> &'static str {
//!         "devices"
//!     }
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as dblayer_core;

pub mod backend;
pub mod collection;
pub mod entity;
pub mod error;
pub mod eval;
pub mod page;
pub mod query;
pub mod store;
