//! Concurrent ordered indices over versioned catalog entries.
//!
//! Every index maps a composite key ending in `schema_version` to the entry
//! payload. Readers walk an index downward from a seed at
//! `schema_version = i64::MAX` to land on the newest entry for a logical key;
//! the skiplist keeps iteration consistent under concurrent writers.

use std::ops::Bound;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::model::{DbInfo, TableInfo};

/// Seed version strictly greater than any published schema version.
pub const MAX_SCHEMA_VERSION: i64 = i64::MAX;

/// Sorted associative container safe for concurrent reads and writes.
///
/// Iteration visits a consistent ordering even while writers insert; a reader
/// may or may not observe entries inserted after its walk began, which is
/// tolerable because snapshots filter by pinned version.
pub struct OrderedIndex<K, V> {
    map: SkipMap<K, V>,
}

impl<K, V> OrderedIndex<K, V>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
{
    pub fn new() -> Self {
        OrderedIndex { map: SkipMap::new() }
    }

    /// Insert or replace the entry at `key`.
    pub fn set(&self, key: K, value: V) {
        self.map.insert(key, value);
    }

    /// Remove the entry at exactly `key`.
    pub fn remove(&self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Walk entries in descending order starting at the greatest key `<= seed`.
    /// The visitor returns `false` to stop.
    pub fn descend<F>(&self, seed: &K, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let range = (Bound::Unbounded, Bound::Included(seed));
        for entry in self.map.range(range).rev() {
            if !visit(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Walk entries in ascending order starting at the least key `>= seed`.
    pub fn ascend<F>(&self, seed: &K, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let range = (Bound::Included(seed), Bound::Unbounded);
        for entry in self.map.range(range) {
            if !visit(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Full traversal from greatest to least key.
    pub fn reverse<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for entry in self.map.iter().rev() {
            if !visit(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Full traversal from least to greatest key.
    pub fn scan<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for entry in self.map.iter() {
            if !visit(entry.key(), entry.value()) {
                break;
            }
        }
    }
}

impl<K, V> Default for OrderedIndex<K, V>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Key of the by-id table index: `table_id` ascending, then `schema_version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByIdKey {
    pub table_id: i64,
    pub schema_version: i64,
}

/// Key of the by-name table index: `db_name`, `table_name`, `schema_version`.
/// Names are lowercase.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByNameKey {
    pub db_name: String,
    pub table_name: String,
    pub schema_version: i64,
}

/// Key of the resident-attribute index: `db_name`, `table_id`, `schema_version`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AttrKey {
    pub db_name: String,
    pub table_id: i64,
    pub schema_version: i64,
}

/// Key of the partition index: `partition_id`, `schema_version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionKey {
    pub partition_id: i64,
    pub schema_version: i64,
}

/// Key of the name-keyed schema index: lowercase `db_name`, `schema_version`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaNameKey {
    pub db_name: String,
    pub schema_version: i64,
}

/// Key of the id-keyed schema index: `db_id`, `schema_version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaIdKey {
    pub db_id: i64,
    pub schema_version: i64,
}

/// Entry shared by the two table indices. The two indices are co-mutated:
/// every add and every remove writes both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableEntry {
    /// Lowercase owning database name.
    pub db_name: String,
    pub db_id: i64,
    /// Lowercase table name.
    pub table_name: String,
    pub table_id: i64,
    pub schema_version: i64,
    pub tomb: bool,
}

impl TableEntry {
    pub fn by_id_key(&self) -> ByIdKey {
        ByIdKey {
            table_id: self.table_id,
            schema_version: self.schema_version,
        }
    }

    pub fn by_name_key(&self) -> ByNameKey {
        ByNameKey {
            db_name: self.db_name.clone(),
            table_name: self.table_name.clone(),
            schema_version: self.schema_version,
        }
    }
}

/// Value of the name-keyed schema index: the full descriptor.
#[derive(Clone, Debug)]
pub struct SchemaEntry {
    pub db_info: Arc<DbInfo>,
    pub tomb: bool,
}

/// Value of the id-keyed schema index: only the original-case name, to keep
/// the id index light; the full descriptor is fetched through the name index.
#[derive(Clone, Debug)]
pub struct SchemaIdName {
    pub name: String,
    pub tomb: bool,
}

/// Value of the partition index.
#[derive(Clone, Copy, Debug)]
pub struct PartitionValue {
    pub table_id: i64,
    pub tomb: bool,
}

/// Value of the resident-attribute index. `table_info` is `None` on tombs.
#[derive(Clone, Debug)]
pub struct AttrValue {
    pub table_info: Option<Arc<TableInfo>>,
    pub tomb: bool,
}
