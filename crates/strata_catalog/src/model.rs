//! Descriptor model for databases, tables, partitions and DDL diffs.
//!
//! These types mirror what the remote metadata store serves. The catalog never
//! mutates a descriptor in place once it is indexed; schema changes insert new
//! versions instead.

use serde::{Deserialize, Serialize};

/// Ids of tables belonging to the synthetic system schemas carry this bit.
/// Such tables are served from the special-DB registry and never enter the
/// versioned indices.
pub const SYSTEM_SCHEMA_ID_FLAG: i64 = 1 << 62;

/// Lowercase names of the synthetic databases served from the registry.
pub const INFORMATION_SCHEMA_NAME: &str = "information_schema";
pub const PERFORMANCE_SCHEMA_NAME: &str = "performance_schema";
pub const METRICS_SCHEMA_NAME: &str = "metrics_schema";

/// Whether `id` addresses a table inside a synthetic system schema.
pub fn is_system_schema_id(id: i64) -> bool {
    id & SYSTEM_SCHEMA_ID_FLAG > 0
}

/// Id `0` is reserved for "unset" in DDL diffs.
pub fn table_id_is_valid(id: i64) -> bool {
    id != 0
}

/// Whether `name` (already lowercased) is one of the synthetic databases.
pub fn is_special_db(name: &str) -> bool {
    name == INFORMATION_SCHEMA_NAME
        || name == PERFORMANCE_SCHEMA_NAME
        || name == METRICS_SCHEMA_NAME
}

/// Descriptor version below which `utf8` columns are upgraded to `utf8mb4`
/// when a table is loaded from the metadata store.
pub const TABLE_INFO_VERSION_UTF8MB4: u64 = 2;

/// Schema-change lifecycle state of a table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    /// Visible to all reads and writes.
    #[default]
    Public,
    /// Mid-DDL: writable but not readable.
    WriteOnly,
    /// Mid-DDL: only delete operations apply.
    DeleteOnly,
}

/// Database descriptor as served by the metadata store.
///
/// The in-memory catalog clears `tables` on insertion: tables live exclusively
/// in the table indices, never inside the database descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DbInfo {
    pub id: i64,
    /// Original-case name. Index keys use the lowercase form.
    pub name: String,
    pub charset: String,
    pub collate: String,
    #[serde(default)]
    pub placement_policy: Option<PolicyRef>,
    /// Populated by `ListTables`-style responses only; cleared before the
    /// descriptor is indexed.
    #[serde(default)]
    pub tables: Vec<TableInfo>,
}

impl DbInfo {
    /// Lowercase name used by the name-keyed schema index.
    pub fn name_lower(&self) -> String {
        self.name.to_lowercase()
    }
}

/// Column descriptor; only the fields the catalog core consumes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: i64,
    pub name: String,
    pub charset: String,
    pub collate: String,
}

/// Time-to-live policy attached to a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TtlInfo {
    /// Column the TTL clock reads.
    pub column_name: String,
    pub interval_secs: u64,
    pub enable: bool,
}

/// Columnar replica attached to a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub count: u64,
    pub available: bool,
}

/// Reference to a placement policy by id and name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyRef {
    pub id: i64,
    pub name: String,
}

/// One partition of a partitioned table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionDefinition {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub placement_policy: Option<PolicyRef>,
}

/// Partitioning metadata of a table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub definitions: Vec<PartitionDefinition>,
}

/// Foreign key declared on a table, pointing at the referenced table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub ref_schema: String,
    pub ref_table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub ref_columns: Vec<String>,
}

/// Table descriptor as served by the metadata store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: i64,
    /// Owning database id; needed to address the descriptor in the KV.
    pub db_id: i64,
    /// Original-case name. Index keys use the lowercase form.
    pub name: String,
    pub charset: String,
    pub collate: String,
    /// Descriptor format version, used for legacy charset upgrades.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub state: TableState,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub ttl: Option<TtlInfo>,
    #[serde(default)]
    pub replica: Option<ReplicaInfo>,
    #[serde(default)]
    pub placement_policy: Option<PolicyRef>,
    #[serde(default)]
    pub partition: Option<PartitionInfo>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyInfo>,
}

impl TableInfo {
    /// Lowercase name used by the name-keyed table index.
    pub fn name_lower(&self) -> String {
        self.name.to_lowercase()
    }

    /// Partition definitions, empty for unpartitioned tables.
    pub fn partition_definitions(&self) -> &[PartitionDefinition] {
        self.partition
            .as_ref()
            .map(|p| p.definitions.as_slice())
            .unwrap_or_default()
    }

    /// Cheap size estimate used by the byte-bounded table cache.
    pub fn approx_mem_usage(&self) -> u64 {
        let mut bytes = 256u64;
        bytes += self.name.len() as u64;
        bytes += self.columns.len() as u64 * 96;
        for col in &self.columns {
            bytes += (col.name.len() + col.charset.len() + col.collate.len()) as u64;
        }
        bytes += self.partition_definitions().len() as u64 * 64;
        bytes += self.foreign_keys.len() as u64 * 128;
        bytes
    }
}

/// Lightweight `(id, name)` row returned by bulk table listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNameInfo {
    pub id: i64,
    pub name: String,
}

/// Filter over the resident-attribute index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialAttributeFilter {
    /// Public tables carrying a TTL policy.
    Ttl,
    /// Tables with a columnar replica.
    Replica,
    /// Tables with a placement policy on the table or any partition.
    PlacementPolicy,
    /// Partitioned tables.
    Partition,
    /// Any of the above.
    All,
}

impl SpecialAttributeFilter {
    /// Whether `table` carries the attribute this filter selects.
    pub fn matches(&self, table: &TableInfo) -> bool {
        match self {
            SpecialAttributeFilter::Ttl => {
                table.state == TableState::Public && table.ttl.is_some()
            }
            SpecialAttributeFilter::Replica => table.replica.is_some(),
            SpecialAttributeFilter::PlacementPolicy => {
                table.placement_policy.is_some()
                    || table
                        .partition_definitions()
                        .iter()
                        .any(|def| def.placement_policy.is_some())
            }
            SpecialAttributeFilter::Partition => table.partition.is_some(),
            SpecialAttributeFilter::All => has_special_attributes(table),
        }
    }
}

/// Whether a table belongs in the resident-attribute index at all.
pub fn has_special_attributes(table: &TableInfo) -> bool {
    SpecialAttributeFilter::Ttl.matches(table)
        || SpecialAttributeFilter::Replica.matches(table)
        || SpecialAttributeFilter::PlacementPolicy.matches(table)
        || SpecialAttributeFilter::Partition.matches(table)
}

/// Kind of schema change carried by a [`SchemaDiff`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffKind {
    CreateSchema,
    DropSchema,
    RecoverSchema,
    ModifySchemaCharsetAndCollate,
    ModifySchemaDefaultPlacement,
    CreateTable,
    DropTable,
    TruncateTable,
    RenameTable,
    AlterTable,
}

/// One incremental DDL change at a monotonic schema version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub version: i64,
    pub kind: DiffKind,
    pub schema_id: i64,
    #[serde(default)]
    pub table_id: i64,
    /// Source database for cross-database renames.
    #[serde(default)]
    pub old_schema_id: i64,
    /// Previous table id for rewrites that allocate a new one (truncate).
    #[serde(default)]
    pub old_table_id: i64,
    /// Extra `(schema, table)` pairs affected by the same change, used by
    /// batched creation such as recover-schema.
    #[serde(default)]
    pub affected: Vec<AffectedOption>,
}

/// Companion table touched by a diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedOption {
    pub schema_id: i64,
    pub table_id: i64,
    #[serde(default)]
    pub old_schema_id: i64,
    #[serde(default)]
    pub old_table_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(f: impl FnOnce(&mut TableInfo)) -> TableInfo {
        let mut t = TableInfo {
            id: 1,
            db_id: 2,
            name: "t".to_string(),
            ..TableInfo::default()
        };
        f(&mut t);
        t
    }

    #[test]
    fn system_schema_bit() {
        assert!(is_system_schema_id(SYSTEM_SCHEMA_ID_FLAG | 17));
        assert!(!is_system_schema_id(17));
    }

    #[test]
    fn ttl_filter_requires_public_state() {
        let ttl = TtlInfo {
            column_name: "created_at".to_string(),
            interval_secs: 3600,
            enable: true,
        };
        let public = table_with(|t| t.ttl = Some(ttl.clone()));
        assert!(SpecialAttributeFilter::Ttl.matches(&public));

        let hidden = table_with(|t| {
            t.ttl = Some(ttl);
            t.state = TableState::WriteOnly;
        });
        assert!(!SpecialAttributeFilter::Ttl.matches(&hidden));
    }

    #[test]
    fn placement_filter_sees_partition_level_refs() {
        let table = table_with(|t| {
            t.partition = Some(PartitionInfo {
                definitions: vec![PartitionDefinition {
                    id: 100,
                    name: "p0".to_string(),
                    placement_policy: Some(PolicyRef {
                        id: 7,
                        name: "east".to_string(),
                    }),
                }],
            });
        });
        assert!(SpecialAttributeFilter::PlacementPolicy.matches(&table));
        // Partitioning alone is also a special attribute.
        assert!(has_special_attributes(&table_with(|t| {
            t.partition = Some(PartitionInfo::default());
        })));
    }

    #[test]
    fn plain_table_has_no_special_attributes() {
        assert!(!has_special_attributes(&table_with(|_| {})));
    }
}
