//! The catalog store: versioned indices, table cache and version log.
//!
//! `CatalogData` owns all state shared between snapshots and the diff
//! applier. Mutations come from a single externally-serialised applier;
//! readers walk the indices without locks and pin a version before looking
//! anything up, so a partially-applied version is never observed through a
//! published snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::errors::CatalogError;
use crate::index::{
    AttrKey, AttrValue, ByIdKey, ByNameKey, OrderedIndex, PartitionKey, PartitionValue,
    SchemaEntry, SchemaIdKey, SchemaIdName, SchemaNameKey, TableEntry,
};
use crate::meta::{SchemaTables, TableRef};
use crate::metrics::{CatalogMetrics, MetricsStatusHook};
use crate::model::{has_special_attributes, DbInfo, TableInfo};
use crate::sieve::Sieve;
use crate::single_flight::SingleFlight;

/// Tunables for the catalog core.
#[derive(Clone, Copy, Debug)]
pub struct CatalogConfig {
    /// Byte bound of the table-handle cache.
    pub table_cache_capacity: u64,
    /// Per-read timeout applied to metadata KV snapshots.
    pub kv_read_timeout: Duration,
    /// Initial delay before retrying a read rejected by an ongoing flashback.
    pub flashback_retry_interval: Duration,
    /// Retry budget for the flashback condition; exhaustion surfaces the
    /// last error.
    pub flashback_max_retries: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            table_cache_capacity: 512 * 1024 * 1024,
            kv_read_timeout: Duration::from_secs(3),
            flashback_retry_interval: Duration::from_millis(200),
            flashback_max_retries: 10,
        }
    }
}

/// Cache key of one materialised table handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableCacheKey {
    pub table_id: i64,
    pub schema_version: i64,
}

/// One `(schema version, timestamp)` pair in the descending version log.
/// `timestamp == 0` means the commit timestamp of that version is unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionTs {
    pub schema_version: i64,
    pub timestamp: u64,
}

/// Back-pointer from a referenced table to a foreign key declared on a child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferredForeignKey {
    /// Lowercase schema of the referencing table.
    pub child_schema: String,
    /// Lowercase name of the referencing table.
    pub child_table: String,
    pub fk_name: String,
}

/// Core data of the versioned catalog.
pub struct CatalogData {
    /// Sorted by `(db_name, table_name, schema_version)`. A table unchanged
    /// across a version bump is not re-inserted; the newest entry at or below
    /// the snapshot version applies.
    by_name: OrderedIndex<ByNameKey, TableEntry>,
    /// Sorted by `(table_id, schema_version)`; also carries the owning db id
    /// needed to re-address the descriptor in the metadata KV. Kept in step
    /// with `by_name` on every mutation.
    by_id: OrderedIndex<ByIdKey, TableEntry>,
    /// Sorted by `(lowercase db_name, schema_version)`; full descriptors.
    schema_by_name: OrderedIndex<SchemaNameKey, SchemaEntry>,
    /// Sorted by `(db_id, schema_version)`; names only, to stay light.
    schema_by_id: OrderedIndex<SchemaIdKey, SchemaIdName>,
    /// Sorted by `(partition_id, schema_version)`; partition to table.
    pid2tid: OrderedIndex<PartitionKey, PartitionValue>,
    /// Sorted by `(db_name, table_id, schema_version)`; descriptors of tables
    /// with at least one special attribute, kept resident to answer filtered
    /// listings without touching the KV.
    resident_attrs: OrderedIndex<AttrKey, AttrValue>,
    table_cache: Sieve<TableCacheKey, TableRef>,
    /// Synthetic catalogs by lowercase name; never versioned, never tombed.
    specials: RwLock<HashMap<String, Arc<SchemaTables>>>,
    /// Descending `(schema_version, timestamp)` pairs.
    version_log: RwLock<Vec<VersionTs>>,
    latest_version: AtomicI64,
    /// Referenced `(schema, table)` to foreign keys pointing at it.
    referred_fks: RwLock<HashMap<(String, String), Vec<ReferredForeignKey>>>,
    loader_group: SingleFlight<Result<TableRef, CatalogError>>,
    metrics: Arc<CatalogMetrics>,
    config: CatalogConfig,
}

impl CatalogData {
    pub fn new(config: CatalogConfig) -> Self {
        let metrics = Arc::new(CatalogMetrics::default());
        let table_cache = Sieve::new(config.table_cache_capacity);
        table_cache.set_status_hook(Arc::new(MetricsStatusHook(metrics.clone())));
        CatalogData {
            by_name: OrderedIndex::new(),
            by_id: OrderedIndex::new(),
            schema_by_name: OrderedIndex::new(),
            schema_by_id: OrderedIndex::new(),
            pid2tid: OrderedIndex::new(),
            resident_attrs: OrderedIndex::new(),
            table_cache,
            specials: RwLock::new(HashMap::new()),
            version_log: RwLock::new(Vec::new()),
            latest_version: AtomicI64::new(0),
            referred_fks: RwLock::new(HashMap::new()),
            loader_group: SingleFlight::new(),
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CatalogMetrics> {
        &self.metrics
    }

    /// Index a table at a version and install its handle in the cache.
    pub fn add(&self, entry: TableEntry, handle: TableRef) {
        debug_assert!(!entry.tomb, "add takes live entries");
        self.by_id.set(entry.by_id_key(), entry.clone());
        self.by_name.set(entry.by_name_key(), entry.clone());
        self.table_cache.set(
            TableCacheKey {
                table_id: entry.table_id,
                schema_version: entry.schema_version,
            },
            handle.clone(),
        );

        let meta = handle.meta();
        for def in meta.partition_definitions() {
            self.pid2tid.set(
                PartitionKey {
                    partition_id: def.id,
                    schema_version: entry.schema_version,
                },
                PartitionValue {
                    table_id: meta.id,
                    tomb: false,
                },
            );
        }
        if has_special_attributes(meta) {
            self.resident_attrs.set(
                AttrKey {
                    db_name: entry.db_name.clone(),
                    table_id: entry.table_id,
                    schema_version: entry.schema_version,
                },
                AttrValue {
                    table_info: Some(Arc::new(meta.clone())),
                    tomb: false,
                },
            );
        }
    }

    /// Tomb a table at a version. Partition tombs are written by the diff
    /// applier, which knows the partition ids of the dropped descriptor.
    pub fn remove(&self, mut entry: TableEntry) {
        entry.tomb = true;
        self.by_id.set(entry.by_id_key(), entry.clone());
        self.by_name.set(entry.by_name_key(), entry.clone());
        self.resident_attrs.set(
            AttrKey {
                db_name: entry.db_name.clone(),
                table_id: entry.table_id,
                schema_version: entry.schema_version,
            },
            AttrValue {
                table_info: None,
                tomb: true,
            },
        );
        self.table_cache.remove(&TableCacheKey {
            table_id: entry.table_id,
            schema_version: entry.schema_version,
        });
    }

    /// Index a database at a version. The descriptor's table list is cleared:
    /// tables live exclusively in the table indices.
    pub fn add_db(&self, schema_version: i64, mut db_info: DbInfo) {
        db_info.tables = Vec::new();
        let db_info = Arc::new(db_info);
        self.schema_by_id.set(
            SchemaIdKey {
                db_id: db_info.id,
                schema_version,
            },
            SchemaIdName {
                name: db_info.name.clone(),
                tomb: false,
            },
        );
        self.schema_by_name.set(
            SchemaNameKey {
                db_name: db_info.name_lower(),
                schema_version,
            },
            SchemaEntry {
                db_info,
                tomb: false,
            },
        );
    }

    /// Tomb a database at a version.
    pub fn delete_db(&self, schema_version: i64, db_info: &DbInfo) {
        self.schema_by_id.set(
            SchemaIdKey {
                db_id: db_info.id,
                schema_version,
            },
            SchemaIdName {
                name: db_info.name.clone(),
                tomb: true,
            },
        );
        let mut tombed = db_info.clone();
        tombed.tables = Vec::new();
        self.schema_by_name.set(
            SchemaNameKey {
                db_name: db_info.name_lower(),
                schema_version,
            },
            SchemaEntry {
                db_info: Arc::new(tombed),
                tomb: true,
            },
        );
    }

    /// Register a synthetic catalog. The first registration of a name wins.
    pub fn add_special_db(&self, mut db_info: DbInfo, tables: HashMap<String, TableRef>) {
        db_info.tables = Vec::new();
        let lower = db_info.name_lower();
        let bundle = Arc::new(SchemaTables {
            db_info: Arc::new(db_info),
            tables,
        });
        self.specials.write().entry(lower).or_insert(bundle);
    }

    pub fn special_db(&self, lower_name: &str) -> Option<Arc<SchemaTables>> {
        self.specials.read().get(lower_name).cloned()
    }

    pub fn for_each_special(&self, mut visit: impl FnMut(&Arc<SchemaTables>)) {
        for bundle in self.specials.read().values() {
            visit(bundle);
        }
    }

    /// Record the commit timestamp of a schema version and move the published
    /// version forward. Called once per version, after all its writes are in.
    pub fn publish(&self, schema_version: i64, timestamp: u64) {
        {
            let mut log = self.version_log.write();
            match log.first().copied() {
                Some(front) if front.schema_version == schema_version => {
                    // A version published with an unknown timestamp may learn
                    // it later.
                    if front.timestamp == 0 && timestamp != 0 {
                        log[0].timestamp = timestamp;
                    }
                }
                Some(front) if front.schema_version > schema_version => {
                    tracing::warn!(
                        schema_version,
                        newest = front.schema_version,
                        "ignoring out-of-order version publish"
                    );
                }
                _ => log.insert(
                    0,
                    VersionTs {
                        schema_version,
                        timestamp,
                    },
                ),
            }
        }
        self.latest_version.fetch_max(schema_version, Ordering::SeqCst);
    }

    /// Newest published schema version, `0` before the first publish.
    pub fn latest_version(&self) -> i64 {
        self.latest_version.load(Ordering::SeqCst)
    }

    /// Highest schema version whose commit interval contains `ts`.
    ///
    /// The scan is linear: timestamps may be zero (unknown) which breaks
    /// binary search, the log is short, and in steady state the newest entry
    /// answers.
    pub fn version_by_ts(&self, ts: u64) -> Option<i64> {
        let log = self.version_log.read();
        for (i, vt) in log.iter().enumerate() {
            if vt.timestamp == 0 || ts < vt.timestamp {
                // Unknown timestamp, or a version newer than ts: keep looking
                // for an older one.
                continue;
            }
            if i == 0 {
                return Some(vt.schema_version);
            }
            let prev = log[i - 1];
            // The interval is only proven when the next version is adjacent
            // and committed after ts.
            if prev.schema_version == vt.schema_version + 1 && prev.timestamp > ts {
                return Some(vt.schema_version);
            }
            break;
        }
        None
    }

    pub fn cache_capacity(&self) -> u64 {
        self.table_cache.capacity()
    }

    /// Bytes resident in the table cache. Exported for tests.
    pub fn cache_used_bytes(&self) -> u64 {
        self.table_cache.used_bytes()
    }

    /// Whether a handle is resident under `key`, without touching its visited
    /// bit. Exported for tests.
    pub fn cache_contains(&self, key: &TableCacheKey) -> bool {
        self.table_cache.contains(key)
    }

    /// Resize the table cache, synchronously evicting down to the new bound.
    pub fn set_cache_capacity(&self, capacity: u64) {
        self.table_cache.set_capacity_and_wait_evict(capacity);
    }

    /// Record back-pointers for every foreign key declared on `table`.
    pub fn register_referred_foreign_keys(&self, child_schema: &str, table: &TableInfo) {
        if table.foreign_keys.is_empty() {
            return;
        }
        let child_schema = child_schema.to_lowercase();
        let child_table = table.name_lower();
        let mut referred = self.referred_fks.write();
        for fk in &table.foreign_keys {
            let bucket = referred
                .entry((fk.ref_schema.to_lowercase(), fk.ref_table.to_lowercase()))
                .or_default();
            let entry = ReferredForeignKey {
                child_schema: child_schema.clone(),
                child_table: child_table.clone(),
                fk_name: fk.name.clone(),
            };
            if !bucket.contains(&entry) {
                bucket.push(entry);
            }
        }
    }

    /// Drop the back-pointers owned by `table`, using its own foreign-key
    /// list to find the buckets.
    pub fn delete_referred_foreign_keys(&self, child_schema: &str, table: &TableInfo) {
        if table.foreign_keys.is_empty() {
            return;
        }
        let child_schema = child_schema.to_lowercase();
        let child_table = table.name_lower();
        let mut referred = self.referred_fks.write();
        for fk in &table.foreign_keys {
            let key = (fk.ref_schema.to_lowercase(), fk.ref_table.to_lowercase());
            if let Some(bucket) = referred.get_mut(&key) {
                bucket.retain(|r| {
                    !(r.child_schema == child_schema
                        && r.child_table == child_table
                        && r.fk_name == fk.name)
                });
                if bucket.is_empty() {
                    referred.remove(&key);
                }
            }
        }
    }

    /// Foreign keys currently pointing at `(schema, table)`.
    pub fn referred_foreign_keys(&self, schema: &str, table: &str) -> Vec<ReferredForeignKey> {
        self.referred_fks
            .read()
            .get(&(schema.to_lowercase(), table.to_lowercase()))
            .cloned()
            .unwrap_or_default()
    }

    /// Reclaim entries no snapshot at or above `min_live_version` can observe:
    /// per logical key, everything older than the newest entry at or below the
    /// floor, and that entry itself when it is a tomb. Version-log entries
    /// below the floor are dropped as well.
    pub fn gc(&self, min_live_version: i64) {
        gc_versioned_index(
            &self.by_id,
            min_live_version,
            |k| k.table_id,
            |k| k.schema_version,
            |v: &TableEntry| v.tomb,
        );
        gc_versioned_index(
            &self.by_name,
            min_live_version,
            |k| (k.db_name.clone(), k.table_name.clone()),
            |k| k.schema_version,
            |v: &TableEntry| v.tomb,
        );
        gc_versioned_index(
            &self.schema_by_name,
            min_live_version,
            |k| k.db_name.clone(),
            |k| k.schema_version,
            |v: &SchemaEntry| v.tomb,
        );
        gc_versioned_index(
            &self.schema_by_id,
            min_live_version,
            |k| k.db_id,
            |k| k.schema_version,
            |v: &SchemaIdName| v.tomb,
        );
        gc_versioned_index(
            &self.pid2tid,
            min_live_version,
            |k| k.partition_id,
            |k| k.schema_version,
            |v: &PartitionValue| v.tomb,
        );
        gc_versioned_index(
            &self.resident_attrs,
            min_live_version,
            |k| (k.db_name.clone(), k.table_id),
            |k| k.schema_version,
            |v: &AttrValue| v.tomb,
        );

        let mut log = self.version_log.write();
        log.retain(|vt| vt.schema_version >= min_live_version);
    }

    pub(crate) fn by_id_index(&self) -> &OrderedIndex<ByIdKey, TableEntry> {
        &self.by_id
    }

    pub(crate) fn by_name_index(&self) -> &OrderedIndex<ByNameKey, TableEntry> {
        &self.by_name
    }

    pub(crate) fn schema_by_name_index(&self) -> &OrderedIndex<SchemaNameKey, SchemaEntry> {
        &self.schema_by_name
    }

    pub(crate) fn schema_by_id_index(&self) -> &OrderedIndex<SchemaIdKey, SchemaIdName> {
        &self.schema_by_id
    }

    pub(crate) fn partition_index(&self) -> &OrderedIndex<PartitionKey, PartitionValue> {
        &self.pid2tid
    }

    pub(crate) fn resident_attr_index(&self) -> &OrderedIndex<AttrKey, AttrValue> {
        &self.resident_attrs
    }

    pub(crate) fn cache(&self) -> &Sieve<TableCacheKey, TableRef> {
        &self.table_cache
    }

    pub(crate) fn loader_group(&self) -> &SingleFlight<Result<TableRef, CatalogError>> {
        &self.loader_group
    }

    /// Write a partition tomb directly; used by the diff applier which knows
    /// the dropped descriptor's partition ids.
    pub(crate) fn tomb_partition(&self, partition_id: i64, schema_version: i64, table_id: i64) {
        self.pid2tid.set(
            PartitionKey {
                partition_id,
                schema_version,
            },
            PartitionValue {
                table_id,
                tomb: true,
            },
        );
    }
}

impl Default for CatalogData {
    fn default() -> Self {
        Self::new(CatalogConfig::default())
    }
}

/// Remove the entries of one versioned index that are shadowed at `floor`.
fn gc_versioned_index<K, V, G>(
    index: &OrderedIndex<K, V>,
    floor: i64,
    group_of: impl Fn(&K) -> G,
    version_of: impl Fn(&K) -> i64,
    is_tomb: impl Fn(&V) -> bool,
) where
    K: Ord + Clone + Send + 'static,
    V: Send + 'static,
    G: PartialEq,
{
    let mut to_remove: Vec<K> = Vec::new();
    let mut current_group: Option<G> = None;
    // Newest entry at or below the floor within the current group.
    let mut keeper: Option<(K, bool)> = None;

    index.scan(|key, value| {
        let group = group_of(key);
        if current_group.as_ref() != Some(&group) {
            if let Some((prev_key, prev_tomb)) = keeper.take() {
                if prev_tomb {
                    to_remove.push(prev_key);
                }
            }
            current_group = Some(group);
        }
        if version_of(key) <= floor {
            if let Some((shadowed, _)) = keeper.take() {
                to_remove.push(shadowed);
            }
            keeper = Some((key.clone(), is_tomb(value)));
        }
        true
    });
    if let Some((prev_key, prev_tomb)) = keeper {
        if prev_tomb {
            to_remove.push(prev_key);
        }
    }

    for key in &to_remove {
        index.remove(key);
    }
}
