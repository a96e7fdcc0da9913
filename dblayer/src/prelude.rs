//! Convenient re-exports of commonly used types from dblayer.
//!
//! ```ignore
//! use dblayer::prelude::*;
//! ```

pub use dblayer_core::{
    backend::{CollectionAdapter, DynStoreBackend, StoreBackend, StoreBackendBuilder},
    collection::{Collection, EntityStream},
    entity::{Entity, EntityExt, EntityKey, Identity, Record},
    error::{DataStoreError, DataStoreResult},
    page::{Page, PaginationParams},
    query::{Condition, Expr, FieldOp, Filter, Projection, Query, QueryBuilder, QueryVisitor, Sort, SortDirection},
    store::{DataStore, DynDataStore},
};
pub use tokio_util::sync::CancellationToken;
