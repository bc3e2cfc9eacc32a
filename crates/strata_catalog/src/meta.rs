//! Interfaces to the remote metadata store and table-handle construction.
//!
//! The catalog consumes these through narrow traits so the SQL layer can wire
//! in its real KV client, allocator subsystem and table runtime; tests plug in
//! in-memory fakes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::MetaError;
use crate::model::{DbInfo, TableInfo, TableNameInfo, TABLE_INFO_VERSION_UTF8MB4};
use crate::sieve::MemSized;

/// Read-only client for the remote metadata store.
#[async_trait]
pub trait MetaKv: Send + Sync {
    /// Open a read snapshot at `ts`. `read_timeout` bounds each read issued
    /// through the returned snapshot.
    async fn snapshot(
        &self,
        ts: u64,
        read_timeout: Duration,
    ) -> Result<Box<dyn MetaSnapshot>, MetaError>;
}

/// One timestamped view of the metadata store.
#[async_trait]
pub trait MetaSnapshot: Send + Sync {
    /// Table descriptor, or `None` when the table does not exist at this ts.
    async fn get_table(&self, db_id: i64, table_id: i64) -> Result<Option<TableInfo>, MetaError>;
    /// All table descriptors of a database.
    async fn list_tables(&self, db_id: i64) -> Result<Vec<TableInfo>, MetaError>;
    /// `(id, name)` rows of a database, cheaper than full descriptors.
    async fn list_simple_tables(&self, db_id: i64) -> Result<Vec<TableNameInfo>, MetaError>;
    /// Database descriptor, or `None` when the database does not exist.
    async fn get_database(&self, db_id: i64) -> Result<Option<DbInfo>, MetaError>;
}

/// Kinds of auto-id allocators a table may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorKind {
    RowId,
    AutoIncrement,
    AutoRandom,
}

/// One allocator attached to a table handle. Allocation itself lives outside
/// the catalog; the core only carries the bundle alongside the handle.
#[derive(Clone, Debug)]
pub struct AllocatorSlot {
    pub kind: AllocatorKind,
    pub base: i64,
}

/// Allocator bundle built for one table descriptor.
#[derive(Clone, Debug, Default)]
pub struct Allocators {
    pub slots: Vec<AllocatorSlot>,
}

/// Builds allocator bundles from descriptors.
pub trait AllocatorFactory: Send + Sync {
    fn allocators_from_table_info(&self, db_id: i64, table: &TableInfo) -> Allocators;
}

/// Fully materialised runtime table object.
pub trait CatalogTable: Send + Sync {
    fn meta(&self) -> &TableInfo;
    fn allocators(&self) -> &Allocators;
}

/// Shared table handle; snapshots hold it by value for the duration of use,
/// so cache eviction never invalidates a reader.
pub type TableRef = Arc<dyn CatalogTable>;

impl MemSized for TableRef {
    fn approx_mem_usage(&self) -> u64 {
        self.meta().approx_mem_usage()
    }
}

/// Builds table handles from descriptors.
pub trait TableHandleFactory: Send + Sync {
    fn table_from_meta(&self, allocators: Allocators, table: TableInfo)
        -> anyhow::Result<TableRef>;
}

/// Plain table handle carrying only the descriptor and its allocators.
pub struct BasicTable {
    meta: TableInfo,
    allocators: Allocators,
}

impl BasicTable {
    pub fn new(allocators: Allocators, meta: TableInfo) -> Self {
        BasicTable { meta, allocators }
    }
}

impl CatalogTable for BasicTable {
    fn meta(&self) -> &TableInfo {
        &self.meta
    }

    fn allocators(&self) -> &Allocators {
        &self.allocators
    }
}

/// Factory producing [`BasicTable`] handles; engines with richer runtime state
/// substitute their own.
#[derive(Default)]
pub struct BasicTableFactory;

impl TableHandleFactory for BasicTableFactory {
    fn table_from_meta(
        &self,
        allocators: Allocators,
        table: TableInfo,
    ) -> anyhow::Result<TableRef> {
        Ok(Arc::new(BasicTable::new(allocators, table)))
    }
}

/// External collaborators a catalog needs to materialise table handles.
pub struct CatalogEnv {
    pub meta: Arc<dyn MetaKv>,
    pub allocator_factory: Arc<dyn AllocatorFactory>,
    pub table_factory: Arc<dyn TableHandleFactory>,
}

/// Lowercase charset and collation names on the table and each column.
/// Descriptors written by old clients may carry mixed case.
pub fn normalize_charset_case(table: &mut TableInfo) {
    lowercase_in_place(&mut table.charset);
    lowercase_in_place(&mut table.collate);
    for column in &mut table.columns {
        lowercase_in_place(&mut column.charset);
        lowercase_in_place(&mut column.collate);
    }
}

fn lowercase_in_place(s: &mut String) {
    if s.chars().any(|c| c.is_ascii_uppercase()) {
        *s = s.to_lowercase();
    }
}

/// Upgrade legacy `utf8` descriptors to `utf8mb4`. Only descriptors below
/// [`TABLE_INFO_VERSION_UTF8MB4`] are touched; newer ones chose `utf8`
/// deliberately.
pub fn upgrade_legacy_utf8(table: &mut TableInfo) {
    if table.version >= TABLE_INFO_VERSION_UTF8MB4 {
        return;
    }
    upgrade_charset_pair(&mut table.charset, &mut table.collate);
    for column in &mut table.columns {
        upgrade_charset_pair(&mut column.charset, &mut column.collate);
    }
}

fn upgrade_charset_pair(charset: &mut String, collate: &mut String) {
    if charset != "utf8" {
        return;
    }
    *charset = "utf8mb4".to_string();
    if let Some(rest) = collate.clone().strip_prefix("utf8_") {
        *collate = format!("utf8mb4_{rest}");
    } else if collate.is_empty() {
        *collate = "utf8mb4_bin".to_string();
    }
}

/// Bundle of pre-built tables served for one synthetic database. Keys are
/// lowercase table names.
pub struct SchemaTables {
    pub db_info: Arc<DbInfo>,
    pub tables: HashMap<String, TableRef>,
}
