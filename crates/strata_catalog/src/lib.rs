//! Versioned in-memory catalog core for the Strata SQL layer.
//!
//! The catalog answers "what tables and schemas existed at schema version V
//! (or at read timestamp T)?" while a stream of DDL diffs keeps mutating the
//! current version. Historical snapshots and the current one coexist: every
//! entry in the ordered indices is tagged with the schema version that wrote
//! it, deletions are tombs rather than physical removals, and heavy table
//! handles live in a byte-bounded cache rebuilt on demand from the remote
//! metadata store.
//!
//! Layering, leaves first:
//! - [`index`]: concurrent ordered indices with descending version walks
//! - [`sieve`]: the byte-bounded handle cache
//! - [`single_flight`]: coalescing of duplicate loads
//! - [`store`]: the shared catalog state ([`CatalogData`])
//! - [`snapshot`]: pinned read views ([`CatalogSnapshot`])
//! - [`applier`]: DDL diff application ([`DiffApplier`])

pub mod applier;
pub mod errors;
pub mod index;
pub mod meta;
pub mod metrics;
pub mod model;
pub mod sieve;
pub mod single_flight;
pub mod snapshot;
pub mod store;

pub use applier::DiffApplier;
pub use errors::{CatalogError, MetaError};
pub use meta::{
    AllocatorFactory, Allocators, BasicTable, BasicTableFactory, CatalogEnv, CatalogTable, MetaKv,
    MetaSnapshot, SchemaTables, TableHandleFactory, TableRef,
};
pub use metrics::{CatalogMetrics, CatalogMetricsSnapshot};
pub use model::{
    is_special_db, DbInfo, DiffKind, SchemaDiff, SpecialAttributeFilter, TableInfo, TableNameInfo,
};
pub use snapshot::{CatalogSnapshot, TableInfoResult};
pub use store::{CatalogConfig, CatalogData, ReferredForeignKey};
