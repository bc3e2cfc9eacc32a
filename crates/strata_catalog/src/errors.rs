//! Error types for catalog lookups and metadata loading.
//!
//! Errors are `Clone` so a single load shared through the coalescing group can
//! hand the same failure to every waiter; opaque payloads sit behind an `Arc`.

use std::sync::Arc;

use thiserror::Error;

/// Substring the storage layer embeds in errors raised while a flashback is
/// rewinding the cluster. Such errors are transient and retried by callers.
const FLASHBACK_IN_PROGRESS: &str = "in flashback progress";

/// Errors surfaced by the metadata KV client.
#[derive(Clone, Debug, Error)]
pub enum MetaError {
    /// The requested database id is unknown to the metadata KV.
    #[error("database does not exist (schema id {db_id})")]
    DbNotExists { db_id: i64 },
    /// Any other metadata read failure (transport, timeout, storage).
    #[error("metadata read failed: {0}")]
    Other(Arc<anyhow::Error>),
}

impl MetaError {
    /// Wrap an opaque failure from the KV client.
    pub fn other(err: anyhow::Error) -> Self {
        MetaError::Other(Arc::new(err))
    }

    /// Whether this error is the transient flashback condition. The storage
    /// layer only exposes it through the message text.
    pub fn is_flashback_in_progress(&self) -> bool {
        match self {
            MetaError::DbNotExists { .. } => false,
            MetaError::Other(err) => format!("{err:#}").contains(FLASHBACK_IN_PROGRESS),
        }
    }
}

/// Errors returned by catalog operations.
#[derive(Clone, Debug, Error)]
pub enum CatalogError {
    /// No visible non-tomb entry at the snapshot version, or the metadata KV
    /// returned a null descriptor on reload.
    #[error("table does not exist: {schema}.{table}")]
    TableNotExists { schema: String, table: String },
    /// A diff referenced a database that is not visible.
    #[error("database does not exist: {db}")]
    DatabaseNotExists { db: String },
    /// Recover-schema asked to recreate a database that is still visible.
    #[error("database already exists: {db}")]
    DatabaseExists { db: String },
    /// A non-transient metadata KV failure, surfaced instead of panicking.
    #[error("metadata error: {0}")]
    Metadata(#[from] MetaError),
    /// The flashback retry budget was exhausted.
    #[error("flashback retries exhausted after {attempts} attempts: {last}")]
    FlashbackRetriesExhausted { attempts: u32, last: Arc<anyhow::Error> },
    /// The table-handle factory rejected a descriptor.
    #[error("build table handle for {schema}.{table}: {message}")]
    BuildTableHandle {
        schema: String,
        table: String,
        message: String,
    },
}

impl CatalogError {
    /// `TableNotExists` keyed by ids, for paths where names are not at hand.
    pub fn table_not_exists_by_id(db_id: i64, table_id: i64) -> Self {
        CatalogError::TableNotExists {
            schema: format!("(schema id {db_id})"),
            table: format!("(table id {table_id})"),
        }
    }

    /// `DatabaseNotExists` keyed by id.
    pub fn database_not_exists_by_id(db_id: i64) -> Self {
        CatalogError::DatabaseNotExists {
            db: format!("(schema id {db_id})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flashback_detection_matches_message_substring() {
        let err = MetaError::other(anyhow::anyhow!("region 5 is in flashback progress"));
        assert!(err.is_flashback_in_progress());

        let err = MetaError::other(anyhow::anyhow!("connection reset"));
        assert!(!err.is_flashback_in_progress());

        assert!(!MetaError::DbNotExists { db_id: 1 }.is_flashback_in_progress());
    }

    #[test]
    fn flashback_detection_sees_wrapped_causes() {
        let cause = anyhow::anyhow!("in flashback progress");
        let err = MetaError::other(cause.context("read meta region"));
        assert!(err.is_flashback_in_progress());
    }
}
