//! Demand loading, coalescing and cache-bound behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{db, harness, harness_with_config, table};
use strata_catalog::model::{DiffKind, SchemaDiff};
use strata_catalog::store::CatalogConfig;

fn diff(version: i64, kind: DiffKind, schema_id: i64, table_id: i64) -> SchemaDiff {
    SchemaDiff {
        version,
        kind,
        schema_id,
        table_id,
        old_schema_id: 0,
        old_table_id: 0,
        affected: Vec::new(),
    }
}

#[tokio::test]
async fn concurrent_lookups_of_an_evicted_table_fetch_once() {
    let h = harness();
    h.kv.put_db(db(1, "app"));
    h.kv.put_table(table(1, 7, "orders"));

    h.applier
        .apply(&diff(1, DiffKind::CreateSchema, 1, 0), 10)
        .await
        .expect("create schema");
    h.applier
        .apply(&diff(2, DiffKind::CreateTable, 1, 7), 20)
        .await
        .expect("create table");
    let snap = Arc::new(h.applier.publish(2, 20));
    let creation_fetches = h.kv.get_table_calls();

    snap.evict_table("app", "orders");
    h.kv.set_load_delay(Duration::from_millis(50));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let snap = snap.clone();
        tasks.push(tokio::spawn(async move { snap.table_by_id(7).await }));
    }
    for task in tasks {
        let handle = task.await.expect("join").expect("loaded");
        assert_eq!(handle.meta().id, 7);
    }
    assert_eq!(h.kv.get_table_calls(), creation_fetches + 1);
}

#[tokio::test]
async fn reload_after_eviction_serves_by_name_lookups() {
    let h = harness();
    h.kv.put_db(db(1, "app"));
    h.kv.put_table(table(1, 7, "orders"));

    h.applier
        .apply(&diff(1, DiffKind::CreateSchema, 1, 0), 10)
        .await
        .expect("create schema");
    h.applier
        .apply(&diff(2, DiffKind::CreateTable, 1, 7), 20)
        .await
        .expect("create table");
    let snap = h.applier.publish(2, 20);

    snap.evict_table("app", "orders");
    let handle = snap.table_by_name("app", "orders").await.expect("reloaded");
    assert_eq!(handle.meta().id, 7);

    let metrics = h.data.metrics().snapshot();
    assert_eq!(metrics.table_by_name_misses, 1);

    // Served from cache again after the reload.
    snap.table_by_name("app", "orders").await.expect("cached");
    let metrics = h.data.metrics().snapshot();
    assert_eq!(metrics.table_by_name_hits, 1);
}

#[tokio::test]
async fn lookup_fails_when_the_descriptor_is_gone_from_the_store() {
    let h = harness();
    h.kv.put_db(db(1, "app"));
    h.kv.put_table(table(1, 7, "orders"));

    h.applier
        .apply(&diff(1, DiffKind::CreateSchema, 1, 0), 10)
        .await
        .expect("create schema");
    h.applier
        .apply(&diff(2, DiffKind::CreateTable, 1, 7), 20)
        .await
        .expect("create table");
    let snap = h.applier.publish(2, 20);

    snap.evict_table("app", "orders");
    h.kv.remove_table(1, 7);
    // The index still lists the table; the reload surfaces the null
    // descriptor as absence.
    assert!(snap.table_by_name("app", "orders").await.is_err());
    assert!(snap.table_by_id(7).await.is_none());
}

#[tokio::test]
async fn cache_capacity_is_enforced_and_adjustable() {
    // Capacity fits only a few of the ~260-byte basic handles.
    let h = harness_with_config(CatalogConfig {
        table_cache_capacity: 800,
        ..CatalogConfig::default()
    });
    h.kv.put_db(db(1, "app"));
    h.applier
        .apply(&diff(1, DiffKind::CreateSchema, 1, 0), 10)
        .await
        .expect("create schema");
    for i in 0..6i64 {
        let table_id = 100 + i;
        h.kv.put_table(table(1, table_id, &format!("t{i}")));
        h.applier
            .apply(&diff(2 + i, DiffKind::CreateTable, 1, table_id), 20 + i as u64)
            .await
            .expect("create table");
        h.applier.publish(2 + i, 20 + i as u64);
    }

    assert!(h.data.cache_used_bytes() <= 800);
    let evicted_so_far = h.data.metrics().snapshot().cache_evictions;
    assert!(evicted_so_far > 0);

    h.data.set_cache_capacity(0);
    assert_eq!(h.data.cache_used_bytes(), 0);
    assert_eq!(h.data.cache_capacity(), 0);

    // Lookups still work, reloading through the KV every time.
    let snap = h.applier.publish(7, 100);
    assert!(snap.table_by_id(100).await.is_some());
}

#[tokio::test]
async fn schema_tables_lists_without_promoting_cache_keys() {
    let h = harness();
    h.kv.put_db(db(1, "app"));
    h.kv.put_table(table(1, 7, "orders"));
    h.kv.put_table(table(1, 8, "customers"));

    h.applier
        .apply(&diff(1, DiffKind::CreateSchema, 1, 0), 10)
        .await
        .expect("create schema");
    h.applier
        .apply(&diff(2, DiffKind::CreateTable, 1, 7), 20)
        .await
        .expect("create orders");
    h.applier
        .apply(&diff(3, DiffKind::CreateTable, 1, 8), 30)
        .await
        .expect("create customers");
    // Several empty version bumps later...
    let snap = h.applier.publish(9, 90);

    let names: Vec<String> = {
        let mut tables = snap.schema_tables("app").await.expect("listed");
        tables.sort_by_key(|t| t.meta().id);
        tables.iter().map(|t| t.meta().name.clone()).collect()
    };
    assert_eq!(names, vec!["orders".to_string(), "customers".to_string()]);

    // Enumeration resolves through the entry-version keys only; nothing was
    // promoted to the current version.
    use strata_catalog::store::TableCacheKey;
    let current_key = TableCacheKey {
        table_id: 7,
        schema_version: 9,
    };
    assert!(!h.data.cache_contains(&current_key));

    // A direct lookup at this version does promote.
    snap.table_by_id(7).await.expect("direct lookup");
    assert!(h.data.cache_contains(&current_key));
}

#[tokio::test]
async fn schema_tables_for_unknown_database_is_empty() {
    let h = harness();
    let snap = h.applier.publish(1, 10);
    assert!(snap.schema_tables("nope").await.expect("no error").is_empty());
    assert!(snap
        .schema_table_infos("nope")
        .await
        .expect("no error")
        .is_empty());
}
