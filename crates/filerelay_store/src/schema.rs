//! Database schema creation for all filerelay tables.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::RelayDb;
use tracing::debug;

impl RelayDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        self.create_stream_tables().await?;
        self.create_shadow_tables().await?;

        debug!("Database schema verified");
        Ok(())
    }

    /// Message streams and their entries.
    async fn create_stream_tables(&self) -> Result<()> {
        // next_sequence is kept here rather than derived from MAX(entries) so
        // that sequence numbers are never reused after eviction.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS relay_streams (
                name TEXT PRIMARY KEY,
                max_entries INTEGER NOT NULL,
                strategy_on_full TEXT NOT NULL,
                next_sequence INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS relay_stream_entries (
                stream TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                payload TEXT NOT NULL,
                dedupe_key TEXT,
                appended_at INTEGER NOT NULL,
                PRIMARY KEY (stream, sequence_number)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_relay_stream_entries_dedupe
               ON relay_stream_entries(stream, dedupe_key)"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Shadow documents (cursor storage).
    async fn create_shadow_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS relay_shadows (
                name TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
