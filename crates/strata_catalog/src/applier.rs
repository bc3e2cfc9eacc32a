//! Application of DDL diffs onto the catalog store.
//!
//! The applier is driven by a single external producer of schema versions.
//! Each diff mutates only the entries it touches; older versions stay
//! reachable. A version becomes visible to new snapshots only through
//! [`DiffApplier::publish`], after every write for that version is in.

use std::sync::Arc;

use crate::errors::CatalogError;
use crate::index::TableEntry;
use crate::meta::CatalogEnv;
use crate::model::{table_id_is_valid, DbInfo, DiffKind, SchemaDiff};
use crate::snapshot::{load_table, with_flashback_retry, CatalogSnapshot};
use crate::store::CatalogData;

/// Translates [`SchemaDiff`] records into catalog store mutations.
pub struct DiffApplier {
    data: Arc<CatalogData>,
    env: Arc<CatalogEnv>,
}

impl DiffApplier {
    pub fn new(data: Arc<CatalogData>, env: Arc<CatalogEnv>) -> Self {
        DiffApplier { data, env }
    }

    /// Apply one diff, reading the metadata store at `ts` where descriptors
    /// are needed. Returns the affected table and partition ids. Aborts on
    /// the first non-transient error; the partially-written version is never
    /// published.
    pub async fn apply(&self, diff: &SchemaDiff, ts: u64) -> Result<Vec<i64>, CatalogError> {
        match diff.kind {
            DiffKind::CreateSchema => self.apply_create_schema(diff, ts).await,
            DiffKind::DropSchema => self.apply_drop_schema(diff, ts).await,
            DiffKind::RecoverSchema => self.apply_recover_schema(diff, ts).await,
            DiffKind::ModifySchemaCharsetAndCollate => {
                self.apply_modify_schema(diff, ts, |db, from_kv| {
                    db.charset = from_kv.charset.clone();
                    db.collate = from_kv.collate.clone();
                })
                .await
            }
            DiffKind::ModifySchemaDefaultPlacement => {
                self.apply_modify_schema(diff, ts, |db, from_kv| {
                    db.placement_policy = from_kv.placement_policy.clone();
                })
                .await
            }
            DiffKind::CreateTable
            | DiffKind::DropTable
            | DiffKind::TruncateTable
            | DiffKind::RenameTable
            | DiffKind::AlterTable => self.apply_table_update(diff, ts).await,
        }
    }

    /// Make `schema_version` visible and hand back a snapshot pinned to it.
    pub fn publish(&self, schema_version: i64, ts: u64) -> CatalogSnapshot {
        self.data.publish(schema_version, ts);
        CatalogSnapshot::new(self.data.clone(), self.env.clone(), schema_version, ts)
    }

    /// Working view at the version being built; sees this diff's own writes.
    fn view(&self, schema_version: i64, ts: u64) -> CatalogSnapshot {
        CatalogSnapshot::new(self.data.clone(), self.env.clone(), schema_version, ts)
    }

    async fn apply_create_schema(
        &self,
        diff: &SchemaDiff,
        ts: u64,
    ) -> Result<Vec<i64>, CatalogError> {
        let db_info = self
            .get_database(diff.schema_id, ts)
            .await?
            .ok_or_else(|| CatalogError::database_not_exists_by_id(diff.schema_id))?;
        self.data.add_db(diff.version, db_info);
        Ok(Vec::new())
    }

    async fn apply_drop_schema(
        &self,
        diff: &SchemaDiff,
        ts: u64,
    ) -> Result<Vec<i64>, CatalogError> {
        let view = self.view(diff.version, ts);
        let Some(db_info) = view.schema_by_id(diff.schema_id) else {
            return Ok(Vec::new());
        };

        let mut affected = Vec::new();
        let tables = view.schema_tables(&db_info.name).await?;
        for handle in tables {
            self.apply_drop_table(&view, diff.version, &db_info, handle.meta().id, &mut affected)
                .await;
        }
        self.data.delete_db(diff.version, &db_info);
        Ok(affected)
    }

    async fn apply_recover_schema(
        &self,
        diff: &SchemaDiff,
        ts: u64,
    ) -> Result<Vec<i64>, CatalogError> {
        let view = self.view(diff.version, ts);
        if let Some(existing) = view.schema_by_id(diff.schema_id) {
            return Err(CatalogError::DatabaseExists {
                db: existing.name.clone(),
            });
        }
        let db_info = self
            .get_database(diff.schema_id, ts)
            .await?
            .ok_or_else(|| CatalogError::database_not_exists_by_id(diff.schema_id))?;
        self.data.add_db(diff.version, db_info);

        let db_info = view
            .schema_by_id(diff.schema_id)
            .ok_or_else(|| CatalogError::database_not_exists_by_id(diff.schema_id))?;
        let mut affected = Vec::new();
        for opt in &diff.affected {
            self.apply_create_table(diff.version, &db_info, opt.table_id, ts, &mut affected)
                .await?;
        }
        Ok(affected)
    }

    /// Re-index a database with one field refreshed from the authoritative
    /// KV descriptor, bumping its version.
    async fn apply_modify_schema(
        &self,
        diff: &SchemaDiff,
        ts: u64,
        copy_field: impl FnOnce(&mut DbInfo, &DbInfo),
    ) -> Result<Vec<i64>, CatalogError> {
        let from_kv = self
            .get_database(diff.schema_id, ts)
            .await?
            .ok_or_else(|| CatalogError::database_not_exists_by_id(diff.schema_id))?;
        let view = self.view(diff.version, ts);
        let current = view
            .schema_by_id(diff.schema_id)
            .ok_or_else(|| CatalogError::database_not_exists_by_id(diff.schema_id))?;

        let mut updated = (*current).clone();
        copy_field(&mut updated, &from_kv);
        self.data.delete_db(diff.version, &from_kv);
        self.data.add_db(diff.version, updated);
        Ok(Vec::new())
    }

    async fn apply_table_update(
        &self,
        diff: &SchemaDiff,
        ts: u64,
    ) -> Result<Vec<i64>, CatalogError> {
        let view = self.view(diff.version, ts);
        let db_info = view
            .schema_by_id(diff.schema_id)
            .ok_or_else(|| CatalogError::database_not_exists_by_id(diff.schema_id))?;

        let (old_table_id, new_table_id) = table_ids_of(diff);
        let mut affected = Vec::new();

        if table_id_is_valid(old_table_id) {
            // A rename may move the table out of another database.
            let old_db = if diff.old_schema_id != 0 && diff.old_schema_id != diff.schema_id {
                view.schema_by_id(diff.old_schema_id)
                    .ok_or_else(|| CatalogError::database_not_exists_by_id(diff.old_schema_id))?
            } else {
                db_info.clone()
            };
            self.apply_drop_table(&view, diff.version, &old_db, old_table_id, &mut affected)
                .await;
        }

        if table_id_is_valid(new_table_id) {
            self.apply_create_table(diff.version, &db_info, new_table_id, ts, &mut affected)
                .await?;
        }
        Ok(affected)
    }

    /// Tomb a table: purge the foreign-key back-pointers it owned, write
    /// partition tombs (their ids come from the dropped descriptor), then
    /// tomb the co-mutated table entries. Missing tables are a no-op.
    async fn apply_drop_table(
        &self,
        view: &CatalogSnapshot,
        schema_version: i64,
        db_info: &DbInfo,
        table_id: i64,
        affected: &mut Vec<i64>,
    ) {
        let Some(handle) = view.table_by_id(table_id).await else {
            return;
        };
        let meta = handle.meta();
        self.data
            .delete_referred_foreign_keys(&db_info.name_lower(), meta);
        for def in meta.partition_definitions() {
            self.data.tomb_partition(def.id, schema_version, meta.id);
            affected.push(def.id);
        }
        self.data.remove(TableEntry {
            db_name: db_info.name_lower(),
            db_id: db_info.id,
            table_name: meta.name_lower(),
            table_id: meta.id,
            schema_version,
            tomb: false,
        });
        affected.push(table_id);
    }

    /// Index a table at `schema_version` with a freshly loaded descriptor,
    /// refreshed allocators and a new handle.
    async fn apply_create_table(
        &self,
        schema_version: i64,
        db_info: &DbInfo,
        table_id: i64,
        ts: u64,
        affected: &mut Vec<i64>,
    ) -> Result<(), CatalogError> {
        let handle = load_table(
            &self.data,
            &self.env,
            db_info.id,
            table_id,
            ts,
            schema_version,
        )
        .await?;

        let meta = handle.meta();
        self.data.add(
            TableEntry {
                db_name: db_info.name_lower(),
                db_id: db_info.id,
                table_name: meta.name_lower(),
                table_id,
                schema_version,
                tomb: false,
            },
            handle.clone(),
        );
        self.data
            .register_referred_foreign_keys(&db_info.name_lower(), handle.meta());

        affected.push(table_id);
        for def in handle.meta().partition_definitions() {
            affected.push(def.id);
        }
        Ok(())
    }

    async fn get_database(&self, db_id: i64, ts: u64) -> Result<Option<DbInfo>, CatalogError> {
        let config = *self.data.config();
        with_flashback_retry(&config, self.data.metrics(), "get_database", || async move {
            let snapshot = self.env.meta.snapshot(ts, config.kv_read_timeout).await?;
            snapshot.get_database(db_id).await
        })
        .await
    }
}

/// `(dropped, created)` table ids of a diff; `0` means no table on that side.
fn table_ids_of(diff: &SchemaDiff) -> (i64, i64) {
    match diff.kind {
        DiffKind::CreateTable => (0, diff.table_id),
        DiffKind::DropTable => (diff.table_id, 0),
        // Truncation allocates a fresh table id.
        DiffKind::TruncateTable => (diff.old_table_id, diff.table_id),
        // Rename and alter keep the id; the entries are rewritten at the new
        // version.
        DiffKind::RenameTable | DiffKind::AlterTable => (diff.table_id, diff.table_id),
        _ => (0, 0),
    }
}
