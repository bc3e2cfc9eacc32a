//! Snapshot views over the catalog store.
//!
//! A `CatalogSnapshot` is pinned to a `(schema_version, ts)` pair. Index walks
//! filter by the pinned version, so a snapshot never observes entries tagged
//! with a newer version even while the applier keeps writing. Handle lookups
//! go through the table cache and fall back to the metadata KV, coalesced so
//! concurrent misses on the same table issue one load.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::errors::{CatalogError, MetaError};
use crate::index::{
    ByIdKey, ByNameKey, OrderedIndex, PartitionKey, SchemaIdKey, SchemaNameKey, TableEntry,
    MAX_SCHEMA_VERSION,
};
use crate::meta::{normalize_charset_case, upgrade_legacy_utf8, CatalogEnv, TableRef};
use crate::metrics::CatalogMetrics;
use crate::model::{
    is_special_db, is_system_schema_id, table_id_is_valid, DbInfo, PartitionDefinition,
    SpecialAttributeFilter, TableInfo,
};
use crate::store::{CatalogConfig, CatalogData, ReferredForeignKey, TableCacheKey};

/// Per-database bucket returned by filtered attribute listings.
#[derive(Clone, Debug)]
pub struct TableInfoResult {
    /// Lowercase database name.
    pub db_name: String,
    pub table_infos: Vec<Arc<TableInfo>>,
}

/// Read handle over the catalog pinned to a `(schema_version, ts)` pair.
///
/// Cloning is a value copy; siblings at other timestamps do not invalidate
/// their parent.
#[derive(Clone)]
pub struct CatalogSnapshot {
    data: Arc<CatalogData>,
    env: Arc<CatalogEnv>,
    schema_version: i64,
    ts: u64,
}

impl CatalogSnapshot {
    pub fn new(data: Arc<CatalogData>, env: Arc<CatalogEnv>, schema_version: i64, ts: u64) -> Self {
        CatalogSnapshot {
            data,
            env,
            schema_version,
            ts,
        }
    }

    /// Snapshot pinned at the newest published version.
    pub fn at_latest(data: Arc<CatalogData>, env: Arc<CatalogEnv>, ts: u64) -> Self {
        let schema_version = data.latest_version();
        Self::new(data, env, schema_version, ts)
    }

    pub fn schema_version(&self) -> i64 {
        self.schema_version
    }

    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Sibling snapshot at the same version but a new read timestamp.
    pub fn clone_and_update_ts(&self, ts: u64) -> Self {
        let mut sibling = self.clone();
        sibling.ts = ts;
        sibling
    }

    /// Table handle by id; `None` when the id is not visible at the pinned
    /// version. Load failures are logged and reported as absence.
    pub async fn table_by_id(&self, table_id: i64) -> Option<TableRef> {
        self.table_by_id_inner(table_id, false).await
    }

    async fn table_by_id_inner(&self, table_id: i64, no_refill: bool) -> Option<TableRef> {
        if !table_id_is_valid(table_id) {
            return None;
        }
        if is_system_schema_id(table_id) {
            return self.special_table_by_id(table_id);
        }

        let current_key = TableCacheKey {
            table_id,
            schema_version: self.schema_version,
        };
        if let Some(handle) = self.data.cache().get(&current_key) {
            return Some(handle);
        }

        let item = search_table(
            self.data.by_id_index(),
            self.schema_version,
            ByIdKey {
                table_id,
                schema_version: MAX_SCHEMA_VERSION,
            },
            |key| key.table_id == table_id,
            |key| key.schema_version,
        )?;

        // The entry-version key is shared by every snapshot whose walk lands
        // on the same entry; refill the current-version key to shortcut the
        // next lookup at this version.
        let entry_key = TableCacheKey {
            table_id: item.table_id,
            schema_version: item.schema_version,
        };
        if let Some(handle) = self.data.cache().get(&entry_key) {
            if !no_refill {
                self.data.cache().set(current_key, handle.clone());
            }
            return Some(handle);
        }

        match load_table(
            &self.data,
            &self.env,
            item.db_id,
            item.table_id,
            self.ts,
            self.schema_version,
        )
        .await
        {
            Ok(handle) => {
                if !no_refill {
                    self.data.cache().set(entry_key, handle.clone());
                }
                Some(handle)
            }
            Err(err) => {
                tracing::warn!(table_id, error = %err, "table reload failed");
                None
            }
        }
    }

    /// Table handle by name.
    pub async fn table_by_name(&self, schema: &str, table: &str) -> Result<TableRef, CatalogError> {
        let schema_lower = schema.to_lowercase();
        let table_lower = table.to_lowercase();
        if is_special_db(&schema_lower) {
            if let Some(bundle) = self.data.special_db(&schema_lower) {
                if let Some(handle) = bundle.tables.get(&table_lower) {
                    return Ok(handle.clone());
                }
            }
            return Err(CatalogError::TableNotExists {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        }

        let start = Instant::now();
        let item = search_table(
            self.data.by_name_index(),
            self.schema_version,
            ByNameKey {
                db_name: schema_lower.clone(),
                table_name: table_lower.clone(),
                schema_version: MAX_SCHEMA_VERSION,
            },
            |key| key.db_name == schema_lower && key.table_name == table_lower,
            |key| key.schema_version,
        )
        .ok_or_else(|| CatalogError::TableNotExists {
            schema: schema.to_string(),
            table: table.to_string(),
        })?;

        let entry_key = TableCacheKey {
            table_id: item.table_id,
            schema_version: item.schema_version,
        };
        if let Some(handle) = self.data.cache().get(&entry_key) {
            self.data
                .metrics()
                .observe_table_by_name_hit(start.elapsed());
            return Ok(handle);
        }

        // Evicted: rebuild the handle from the metadata store.
        let handle = load_table(
            &self.data,
            &self.env,
            item.db_id,
            item.table_id,
            self.ts,
            self.schema_version,
        )
        .await?;
        self.data.cache().set(entry_key, handle.clone());
        self.data
            .metrics()
            .observe_table_by_name_miss(start.elapsed());
        Ok(handle)
    }

    pub async fn table_exists(&self, schema: &str, table: &str) -> bool {
        self.table_by_name(schema, table).await.is_ok()
    }

    /// Bare descriptor by name.
    pub async fn table_info_by_name(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<TableInfo, CatalogError> {
        let handle = self.table_by_name(schema, table).await?;
        Ok(handle.meta().clone())
    }

    /// Bare descriptor by id.
    pub async fn table_info_by_id(&self, table_id: i64) -> Option<TableInfo> {
        let handle = self.table_by_id(table_id).await?;
        Some(handle.meta().clone())
    }

    /// Database descriptor by name; tombs report absence.
    pub fn schema_by_name(&self, schema: &str) -> Option<Arc<DbInfo>> {
        let lower = schema.to_lowercase();
        if is_special_db(&lower) {
            return self.data.special_db(&lower).map(|b| b.db_info.clone());
        }

        let mut found = None;
        self.data.schema_by_name_index().descend(
            &SchemaNameKey {
                db_name: lower.clone(),
                schema_version: MAX_SCHEMA_VERSION,
            },
            |key, value| {
                if key.db_name != lower {
                    return false;
                }
                if key.schema_version <= self.schema_version {
                    if !value.tomb {
                        found = Some(value.db_info.clone());
                    }
                    return false;
                }
                true
            },
        );
        found
    }

    /// Database descriptor by id. The id index stores only names; the hit is
    /// chained through the name index for the full descriptor.
    pub fn schema_by_id(&self, db_id: i64) -> Option<Arc<DbInfo>> {
        if is_system_schema_id(db_id) {
            let mut found = None;
            self.data.for_each_special(|bundle| {
                if bundle.db_info.id == db_id && found.is_none() {
                    found = Some(bundle.db_info.clone());
                }
            });
            return found;
        }

        let mut name = None;
        self.data.schema_by_id_index().descend(
            &SchemaIdKey {
                db_id,
                schema_version: MAX_SCHEMA_VERSION,
            },
            |key, value| {
                if key.db_id != db_id {
                    return false;
                }
                if key.schema_version <= self.schema_version {
                    if !value.tomb {
                        name = Some(value.name.clone());
                    }
                    return false;
                }
                true
            },
        );
        self.schema_by_name(&name?)
    }

    pub fn schema_exists(&self, schema: &str) -> bool {
        self.schema_by_name(schema).is_some()
    }

    /// Every database visible at the pinned version, including the synthetic
    /// catalogs.
    pub fn all_schemas(&self) -> Vec<Arc<DbInfo>> {
        let mut schemas = Vec::new();
        self.for_each_schema(|db| schemas.push(db.clone()));
        schemas
    }

    /// Names of every visible database.
    pub fn all_schema_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.for_each_schema(|db| names.push(db.name.clone()));
        names
    }

    fn for_each_schema(&self, mut visit: impl FnMut(&Arc<DbInfo>)) {
        // Reverse order puts the newest version of each name first; runs of
        // the same name are deduped by keeping that first one.
        let mut last_name: Option<String> = None;
        self.data.schema_by_name_index().reverse(|key, value| {
            if key.schema_version > self.schema_version {
                return true;
            }
            if last_name.as_deref() == Some(key.db_name.as_str()) {
                return true;
            }
            last_name = Some(key.db_name.clone());
            if !value.tomb {
                visit(&value.db_info);
            }
            true
        });
        self.data.for_each_special(|bundle| visit(&bundle.db_info));
    }

    /// Resolve a partition id to its table, owning database and definition.
    pub async fn find_table_by_partition_id(
        &self,
        partition_id: i64,
    ) -> Option<(TableRef, Arc<DbInfo>, Option<PartitionDefinition>)> {
        let mut table_id = None;
        self.data.partition_index().descend(
            &PartitionKey {
                partition_id,
                schema_version: MAX_SCHEMA_VERSION,
            },
            |key, value| {
                if key.partition_id != partition_id {
                    return false;
                }
                if key.schema_version > self.schema_version {
                    return true;
                }
                if !value.tomb {
                    table_id = Some(value.table_id);
                }
                false
            },
        );

        let handle = self.table_by_id(table_id?).await?;
        let db_info = self.schema_by_id(handle.meta().db_id)?;
        let definition = handle
            .meta()
            .partition_definitions()
            .iter()
            .find(|def| def.id == partition_id)
            .cloned();
        Some((handle, db_info, definition))
    }

    /// Like [`Self::find_table_by_partition_id`], returning the descriptor.
    pub async fn find_table_info_by_partition_id(
        &self,
        partition_id: i64,
    ) -> Option<(TableInfo, Arc<DbInfo>, Option<PartitionDefinition>)> {
        let (handle, db_info, definition) = self.find_table_by_partition_id(partition_id).await?;
        Some((handle.meta().clone(), db_info, definition))
    }

    /// Handles of every table in a database.
    ///
    /// Resident state does not hold the per-database table list, so this is a
    /// pull-through to the metadata KV at the snapshot timestamp. Handles are
    /// resolved without promoting cache entries to the current-version key.
    pub async fn schema_tables(&self, schema: &str) -> Result<Vec<TableRef>, CatalogError> {
        let lower = schema.to_lowercase();
        if is_special_db(&lower) {
            if let Some(bundle) = self.data.special_db(&lower) {
                return Ok(bundle.tables.values().cloned().collect());
            }
        }

        let Some(db_info) = self.schema_by_name(schema) else {
            return Ok(Vec::new());
        };
        let rows = match self
            .list_from_meta("list_simple_tables", |snapshot, db_id| async move {
                snapshot.list_simple_tables(db_id).await
            }, db_info.id)
            .await
        {
            Ok(rows) => rows,
            Err(CatalogError::Metadata(MetaError::DbNotExists { .. })) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(handle) = self.table_by_id_inner(row.id, true).await {
                tables.push(handle);
            }
        }
        Ok(tables)
    }

    /// Descriptors of every table in a database, straight from the KV.
    pub async fn schema_table_infos(&self, schema: &str) -> Result<Vec<TableInfo>, CatalogError> {
        let lower = schema.to_lowercase();
        if is_special_db(&lower) {
            if let Some(bundle) = self.data.special_db(&lower) {
                return Ok(bundle
                    .tables
                    .values()
                    .map(|handle| handle.meta().clone())
                    .collect());
            }
            return Ok(Vec::new());
        }

        let Some(db_info) = self.schema_by_name(schema) else {
            return Ok(Vec::new());
        };
        match self
            .list_from_meta("list_tables", |snapshot, db_id| async move {
                snapshot.list_tables(db_id).await
            }, db_info.id)
            .await
        {
            Ok(infos) => Ok(infos),
            Err(CatalogError::Metadata(MetaError::DbNotExists { .. })) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn list_from_meta<T, F, Fut>(
        &self,
        what: &str,
        list: F,
        db_id: i64,
    ) -> Result<T, CatalogError>
    where
        F: Fn(Arc<dyn crate::meta::MetaSnapshot>, i64) -> Fut,
        Fut: Future<Output = Result<T, MetaError>>,
    {
        let config = *self.data.config();
        with_flashback_retry(&config, self.data.metrics(), what, || {
            let list = &list;
            async move {
                let snapshot: Arc<dyn crate::meta::MetaSnapshot> = Arc::from(
                    self.env.meta.snapshot(self.ts, config.kv_read_timeout).await?,
                );
                list(snapshot, db_id).await
            }
        })
        .await
    }

    /// Tables visible at the pinned version that carry the filtered
    /// attribute, grouped by database, no duplicates, no tombs.
    pub fn list_tables_with_special_attribute(
        &self,
        filter: SpecialAttributeFilter,
    ) -> Vec<TableInfoResult> {
        let mut results: Vec<TableInfoResult> = Vec::new();
        let mut current: Option<TableInfoResult> = None;
        let mut last_table_id = 0i64;

        self.data.resident_attr_index().reverse(|key, value| {
            if key.schema_version > self.schema_version {
                return true;
            }
            // Reverse order visits the newest version of each table first;
            // older versions of the same id are duplicates.
            if last_table_id != 0 && last_table_id == key.table_id {
                return true;
            }
            last_table_id = key.table_id;

            if value.tomb {
                return true;
            }
            let Some(table_info) = value.table_info.as_ref() else {
                return true;
            };
            if !filter.matches(table_info) {
                return true;
            }

            match current.as_mut() {
                Some(bucket) if bucket.db_name == key.db_name => {
                    bucket.table_infos.push(table_info.clone());
                }
                Some(bucket) => {
                    results.push(std::mem::replace(
                        bucket,
                        TableInfoResult {
                            db_name: key.db_name.clone(),
                            table_infos: vec![table_info.clone()],
                        },
                    ));
                }
                None => {
                    current = Some(TableInfoResult {
                        db_name: key.db_name.clone(),
                        table_infos: vec![table_info.clone()],
                    });
                }
            }
            true
        });

        if let Some(bucket) = current {
            if !bucket.table_infos.is_empty() {
                results.push(bucket);
            }
        }
        results
    }

    /// Foreign keys currently pointing at `(schema, table)`.
    pub fn referred_foreign_keys(&self, schema: &str, table: &str) -> Vec<ReferredForeignKey> {
        self.data.referred_foreign_keys(schema, table)
    }

    /// Drop the cached handles of a table. Test hook.
    pub fn evict_table(&self, schema: &str, table: &str) {
        let schema_lower = schema.to_lowercase();
        let table_lower = table.to_lowercase();
        let Some(item) = search_table(
            self.data.by_name_index(),
            self.schema_version,
            ByNameKey {
                db_name: schema_lower.clone(),
                table_name: table_lower.clone(),
                schema_version: MAX_SCHEMA_VERSION,
            },
            |key| key.db_name == schema_lower && key.table_name == table_lower,
            |key| key.schema_version,
        ) else {
            return;
        };
        self.data.cache().remove(&TableCacheKey {
            table_id: item.table_id,
            schema_version: self.schema_version,
        });
        self.data.cache().remove(&TableCacheKey {
            table_id: item.table_id,
            schema_version: item.schema_version,
        });
    }

    fn special_table_by_id(&self, table_id: i64) -> Option<TableRef> {
        let mut found = None;
        self.data.for_each_special(|bundle| {
            if found.is_some() {
                return;
            }
            found = bundle
                .tables
                .values()
                .find(|handle| handle.meta().id == table_id)
                .cloned();
        });
        found
    }
}

/// Generalised versioned lookup over a table index: walk downward from the
/// seed, stay within the key region, and keep the entry with the largest
/// version at or below the snapshot version. A winning tomb means absent.
fn search_table<K>(
    index: &OrderedIndex<K, TableEntry>,
    schema_version: i64,
    seed: K,
    same_key: impl Fn(&K) -> bool,
    version_of: impl Fn(&K) -> i64,
) -> Option<TableEntry>
where
    K: Ord + Send + 'static,
{
    let mut best: Option<TableEntry> = None;
    index.descend(&seed, |key, value| {
        if !same_key(key) {
            return false;
        }
        if version_of(key) > schema_version {
            // Newer than the snapshot: skip, keep walking down.
            return true;
        }
        match &best {
            Some(current) if current.schema_version >= value.schema_version => {}
            _ => best = Some(value.clone()),
        }
        true
    });
    best.filter(|entry| !entry.tomb)
}

/// Retry `op` while the metadata store reports the transient flashback
/// condition, with exponential back-off and a bounded attempt budget.
pub(crate) async fn with_flashback_retry<T, F, Fut>(
    config: &CatalogConfig,
    metrics: &CatalogMetrics,
    what: &str,
    mut op: F,
) -> Result<T, CatalogError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MetaError>>,
{
    let max_attempts = config.flashback_max_retries.max(1);
    let mut delay = config.flashback_retry_interval;
    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_flashback_in_progress() => {
                let MetaError::Other(last) = err else {
                    return Err(CatalogError::Metadata(err));
                };
                if attempt == max_attempts {
                    return Err(CatalogError::FlashbackRetriesExhausted {
                        attempts: max_attempts,
                        last,
                    });
                }
                metrics.inc_flashback_retries();
                tracing::warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "metadata read blocked by flashback, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(3));
            }
            Err(err) => return Err(CatalogError::Metadata(err)),
        }
    }
    unreachable!("flashback retry loop always returns")
}

/// Rebuild a table handle from the metadata store. Concurrent loads of the
/// same `(db, table, version)` are coalesced; every waiter shares the one
/// result. The caller inserts into the cache on success.
pub(crate) async fn load_table(
    data: &CatalogData,
    env: &CatalogEnv,
    db_id: i64,
    table_id: i64,
    ts: u64,
    schema_version: i64,
) -> Result<TableRef, CatalogError> {
    let key = format!("{db_id}-{table_id}-{schema_version}");
    data.loader_group()
        .run(&key, || async move {
            data.metrics().inc_table_loads();
            let config = *data.config();
            let descriptor = with_flashback_retry(
                &config,
                data.metrics(),
                "get_table",
                || async move {
                    let snapshot = env.meta.snapshot(ts, config.kv_read_timeout).await?;
                    snapshot.get_table(db_id, table_id).await
                },
            )
            .await?;

            let Some(mut table) = descriptor else {
                return Err(CatalogError::table_not_exists_by_id(db_id, table_id));
            };
            normalize_charset_case(&mut table);
            upgrade_legacy_utf8(&mut table);

            let allocators = env.allocator_factory.allocators_from_table_info(db_id, &table);
            let schema = table.db_id;
            let name = table.name.clone();
            env.table_factory
                .table_from_meta(allocators, table)
                .map_err(|err| CatalogError::BuildTableHandle {
                    schema: format!("(schema id {schema})"),
                    table: name,
                    message: format!("{err:#}"),
                })
        })
        .await
}
