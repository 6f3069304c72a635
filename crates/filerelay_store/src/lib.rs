//! Durable state for filerelay.
//!
//! One SQLite database holds everything the replication pipeline needs to
//! survive a restart:
//!
//! - **Message streams**: append-only, sequence-numbered, bounded logs
//!   (`stream`). The delivery task log and its companion status log are both
//!   streams.
//! - **Delivery queue**: typed task/status view over a stream pair (`queue`).
//! - **Shadows**: small JSON documents used as cursor storage (`shadow`).
//!
//! # Usage
//!
//! ```rust,ignore
//! use filerelay_store::{RelayDb, SqliteDeliveryQueue, SqliteShadowStore};
//!
//! let db = RelayDb::open("~/.filerelay/filerelay.sqlite3").await?;
//! let queue = SqliteDeliveryQueue::open(db.clone(), "com.example.file_watcher.s3", 100_000).await?;
//! let shadows = SqliteShadowStore::new(db.clone());
//! ```

mod error;
mod schema;
pub mod queue;
pub mod shadow;
pub mod stream;
pub mod types;

pub use error::{Result, StoreError};
pub use queue::{AppendOutcome, DeliveryQueue, QueueStats, SqliteDeliveryQueue};
pub use shadow::{ShadowDocument, ShadowState, ShadowStore, SqliteShadowStore};
pub use stream::{StrategyOnFull, StreamDefinition, StreamMessage, StreamStats};
pub use types::{
    DeliveryOutcome, DeliveryStatusRecord, DeliveryTask, ExportTaskDefinition, QueueEntry,
    StatusBatch, StatusContext, StatusMessage, UserMetadata,
};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Busy timeout applied to every connection; the delivery engine may write
/// to the same file from another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the filerelay database.
///
/// Cheap to clone; clones share the pool and the in-process append notifier.
#[derive(Clone)]
pub struct RelayDb {
    pool: SqlitePool,
    appended: Arc<Notify>,
}

impl RelayDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self::from_pool(pool);
        db.ensure_schema().await?;

        info!(path = %path.display(), "Database opened");

        Ok(db)
    }

    /// Open a private in-memory database (for testing).
    ///
    /// A single connection is kept alive for the lifetime of the pool, since
    /// every new connection to `:memory:` would see an empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self::from_pool(pool);
        db.ensure_schema().await?;
        Ok(db)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            appended: Arc::new(Notify::new()),
        }
    }

    /// Get the underlying connection pool (escape hatch for complex queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Notifier fired after every successful append made through this handle.
    pub(crate) fn append_notifier(&self) -> &Notify {
        &self.appended
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("relay.db");

        let db = RelayDb::open(&db_path).await.unwrap();
        assert!(db_path.exists());

        db.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_database_keeps_schema() {
        let db = RelayDb::open_in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'relay_%'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(count, 3);
    }
}
