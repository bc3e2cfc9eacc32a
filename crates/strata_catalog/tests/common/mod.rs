//! Shared helpers for integration tests: an in-memory metadata KV with
//! controllable failures, and wiring for a catalog under test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use strata_catalog::applier::DiffApplier;
use strata_catalog::errors::MetaError;
use strata_catalog::meta::{
    AllocatorFactory, Allocators, BasicTableFactory, CatalogEnv, MetaKv, MetaSnapshot,
};
use strata_catalog::model::{DbInfo, TableInfo, TableNameInfo};
use strata_catalog::store::{CatalogConfig, CatalogData};

#[derive(Default)]
struct MetaState {
    dbs: HashMap<i64, DbInfo>,
    tables: HashMap<(i64, i64), TableInfo>,
}

/// In-memory stand-in for the remote metadata store.
#[derive(Default)]
pub struct MockMetaKv {
    state: Mutex<MetaState>,
    get_table_calls: AtomicU64,
    /// Fail this many upcoming reads with the transient flashback error.
    flashback_failures: AtomicU32,
    /// Artificial latency per `get_table`, for coalescing tests.
    load_delay_ms: AtomicU64,
}

impl MockMetaKv {
    pub fn put_db(&self, db: DbInfo) {
        self.state.lock().unwrap().dbs.insert(db.id, db);
    }

    pub fn remove_db(&self, db_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.dbs.remove(&db_id);
        state.tables.retain(|(owner, _), _| *owner != db_id);
    }

    pub fn put_table(&self, table: TableInfo) {
        self.state
            .lock()
            .unwrap()
            .tables
            .insert((table.db_id, table.id), table);
    }

    pub fn remove_table(&self, db_id: i64, table_id: i64) {
        self.state.lock().unwrap().tables.remove(&(db_id, table_id));
    }

    pub fn get_table_calls(&self) -> u64 {
        self.get_table_calls.load(Ordering::SeqCst)
    }

    pub fn fail_with_flashback(&self, times: u32) {
        self.flashback_failures.store(times, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn take_flashback_failure(&self) -> bool {
        self.flashback_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct MockSnapshot {
    kv: Arc<MockMetaKv>,
}

struct MockMetaKvHandle(Arc<MockMetaKv>);

#[async_trait]
impl MetaKv for MockMetaKvHandle {
    async fn snapshot(
        &self,
        _ts: u64,
        _read_timeout: Duration,
    ) -> Result<Box<dyn MetaSnapshot>, MetaError> {
        Ok(Box::new(MockSnapshot { kv: self.0.clone() }))
    }
}

#[async_trait]
impl MetaSnapshot for MockSnapshot {
    async fn get_table(&self, db_id: i64, table_id: i64) -> Result<Option<TableInfo>, MetaError> {
        if self.kv.take_flashback_failure() {
            return Err(MetaError::other(anyhow::anyhow!(
                "region is in flashback progress"
            )));
        }
        let delay = self.kv.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.kv.get_table_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.kv.state.lock().unwrap();
        Ok(state.tables.get(&(db_id, table_id)).cloned())
    }

    async fn list_tables(&self, db_id: i64) -> Result<Vec<TableInfo>, MetaError> {
        if self.kv.take_flashback_failure() {
            return Err(MetaError::other(anyhow::anyhow!(
                "region is in flashback progress"
            )));
        }
        let state = self.kv.state.lock().unwrap();
        if !state.dbs.contains_key(&db_id) {
            return Err(MetaError::DbNotExists { db_id });
        }
        let mut tables: Vec<TableInfo> = state
            .tables
            .iter()
            .filter(|((owner, _), _)| *owner == db_id)
            .map(|(_, table)| table.clone())
            .collect();
        tables.sort_by_key(|t| t.id);
        Ok(tables)
    }

    async fn list_simple_tables(&self, db_id: i64) -> Result<Vec<TableNameInfo>, MetaError> {
        let tables = self.list_tables(db_id).await?;
        Ok(tables
            .into_iter()
            .map(|t| TableNameInfo {
                id: t.id,
                name: t.name,
            })
            .collect())
    }

    async fn get_database(&self, db_id: i64) -> Result<Option<DbInfo>, MetaError> {
        if self.kv.take_flashback_failure() {
            return Err(MetaError::other(anyhow::anyhow!(
                "region is in flashback progress"
            )));
        }
        let state = self.kv.state.lock().unwrap();
        Ok(state.dbs.get(&db_id).cloned())
    }
}

struct FixedAllocators;

impl AllocatorFactory for FixedAllocators {
    fn allocators_from_table_info(&self, _db_id: i64, _table: &TableInfo) -> Allocators {
        Allocators::default()
    }
}

/// Everything a test needs to drive a catalog end to end.
pub struct Harness {
    pub data: Arc<CatalogData>,
    pub env: Arc<CatalogEnv>,
    pub kv: Arc<MockMetaKv>,
    pub applier: DiffApplier,
}

pub fn harness() -> Harness {
    harness_with_config(CatalogConfig::default())
}

pub fn harness_with_config(config: CatalogConfig) -> Harness {
    let kv = Arc::new(MockMetaKv::default());
    let data = Arc::new(CatalogData::new(config));
    let env = Arc::new(CatalogEnv {
        meta: Arc::new(MockMetaKvHandle(kv.clone())),
        allocator_factory: Arc::new(FixedAllocators),
        table_factory: Arc::new(BasicTableFactory),
    });
    let applier = DiffApplier::new(data.clone(), env.clone());
    Harness {
        data,
        env,
        kv,
        applier,
    }
}

/// Short flashback retry budget so failure tests stay fast.
pub fn fast_retry_config() -> CatalogConfig {
    CatalogConfig {
        flashback_retry_interval: Duration::from_millis(5),
        flashback_max_retries: 3,
        ..CatalogConfig::default()
    }
}

pub fn db(id: i64, name: &str) -> DbInfo {
    DbInfo {
        id,
        name: name.to_string(),
        charset: "utf8mb4".to_string(),
        collate: "utf8mb4_bin".to_string(),
        ..Default::default()
    }
}

pub fn table(db_id: i64, id: i64, name: &str) -> TableInfo {
    TableInfo {
        id,
        db_id,
        name: name.to_string(),
        charset: "utf8mb4".to_string(),
        collate: "utf8mb4_bin".to_string(),
        version: 2,
        ..Default::default()
    }
}
