mod in_memory_storage;
mod sqlite_storage;

use std::time::Duration;

use serde::Serialize;

use crate::reading::{Reading, Sample};

pub use in_memory_storage::InMemoryStorage;
pub use sqlite_storage::{SqliteOptions, SqliteStorage};

/// Error type for storage operations.
///
/// Only the durable backend produces these; the in-memory backend never fails.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Store connection lock poisoned")]
    Poisoned,
}

/// Which backend holds the history. Reported back to ingest clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Sqlite,
}

/// Acknowledgement for a successful append.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendReceipt {
    /// Opaque identifier of the stored reading, if the backend assigns one.
    pub id: Option<String>,
    /// Number of readings retained after the append, if the backend tracks it cheaply.
    pub size: Option<usize>,
    pub reading: Reading,
}

/// Bounds applied to every recent-history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub default: usize,
    pub max: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default: 200,
            max: 2000,
        }
    }
}

impl QueryLimits {
    /// Resolves a caller-requested count into the number of readings to return.
    ///
    /// Missing or zero requests fall back to the default; everything is clamped to `max`.
    pub fn resolve(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|&n| n > 0)
            .unwrap_or(self.default)
            .min(self.max)
    }
}

/// Storage trait for the reading history.
///
/// Implementations keep readings in insertion order with non-decreasing
/// timestamps. Appends are serialized so that stamping and inserting a
/// reading happen atomically.
#[async_trait::async_trait]
pub trait Storage {
    fn backend(&self) -> Backend;

    /// Stamps `sample` with the current time and appends it to the history.
    async fn append(&self, sample: Sample) -> Result<AppendReceipt, StoreError>;

    /// Returns up to `limit` of the most recent readings, oldest first.
    async fn recent(&self, limit: Option<usize>) -> Result<Vec<Reading>, StoreError>;

    /// Returns the most recently appended reading that is still retained.
    async fn latest(&self) -> Result<Option<Reading>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_limits() {
        let limits = QueryLimits::default();
        assert_eq!(limits.resolve(None), 200);
        assert_eq!(limits.resolve(Some(0)), 200);
        assert_eq!(limits.resolve(Some(10)), 10);
        assert_eq!(limits.resolve(Some(1_000_000)), 2000);

        let narrow = QueryLimits { default: 50, max: 20 };
        assert_eq!(narrow.resolve(None), 20);
    }
}
