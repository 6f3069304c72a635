//! Append-only, sequence-numbered, bounded message streams.
//!
//! A stream is a named log of opaque text payloads. Sequence numbers start at
//! 0, are assigned under the stream's write lock, and are never reused: the
//! next number lives on the stream row, so eviction and restarts cannot rewind
//! it. Only [`RelayDb::delete_stream`] followed by a re-create resets it.

use crate::error::{Result, StoreError};
use crate::RelayDb;
use serde::Serialize;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound on how long a blocked reader sleeps before re-checking the log.
/// Appends made by another process do not fire the in-process notifier.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What happens when a stream holds `max_entries` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyOnFull {
    /// Silently evict the oldest messages.
    #[default]
    OverwriteOldestData,
}

impl StrategyOnFull {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyOnFull::OverwriteOldestData => "OverwriteOldestData",
        }
    }
}

impl fmt::Display for StrategyOnFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StrategyOnFull {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OverwriteOldestData" => Ok(StrategyOnFull::OverwriteOldestData),
            _ => Err(StoreError::invalid_state(format!(
                "Unknown stream strategy: {}",
                s
            ))),
        }
    }
}

/// Stream configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDefinition {
    pub name: String,
    pub max_entries: i64,
    pub strategy_on_full: StrategyOnFull,
}

impl StreamDefinition {
    pub fn new(name: impl Into<String>, max_entries: i64) -> Self {
        Self {
            name: name.into(),
            max_entries,
            strategy_on_full: StrategyOnFull::OverwriteOldestData,
        }
    }
}

/// One stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub sequence_number: i64,
    pub payload: String,
    pub dedupe_key: Option<String>,
    pub appended_at: i64,
}

/// Occupancy of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StreamStats {
    pub entries: i64,
    pub oldest_sequence_number: Option<i64>,
    pub newest_sequence_number: Option<i64>,
}

impl RelayDb {
    /// Create the stream, or update its configuration in place.
    ///
    /// Lowering `max_entries` evicts immediately. Existing messages and the
    /// sequence counter are left untouched.
    pub async fn create_or_update_stream(&self, definition: &StreamDefinition) -> Result<()> {
        if definition.max_entries <= 0 {
            return Err(StoreError::invalid_state(format!(
                "Stream '{}' must allow at least one entry",
                definition.name
            )));
        }

        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO relay_streams (name, max_entries, strategy_on_full, next_sequence, created_at, updated_at)
               VALUES (?, ?, ?, 0, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                   max_entries = excluded.max_entries,
                   strategy_on_full = excluded.strategy_on_full,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&definition.name)
        .bind(definition.max_entries)
        .bind(definition.strategy_on_full.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let next_sequence: i64 =
            sqlx::query_scalar("SELECT next_sequence FROM relay_streams WHERE name = ?")
                .bind(&definition.name)
                .fetch_one(&mut *tx)
                .await?;

        let evicted =
            Self::evict_below(&mut tx, &definition.name, next_sequence - definition.max_entries)
                .await?;

        tx.commit().await?;

        debug!(
            stream = %definition.name,
            max_entries = definition.max_entries,
            evicted,
            "Stream definition applied"
        );
        Ok(())
    }

    /// Fetch a stream's configuration, if it exists.
    pub async fn stream_definition(&self, name: &str) -> Result<Option<StreamDefinition>> {
        let row = sqlx::query("SELECT max_entries, strategy_on_full FROM relay_streams WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let strategy: String = row.get("strategy_on_full");
                Ok(Some(StreamDefinition {
                    name: name.to_string(),
                    max_entries: row.get("max_entries"),
                    strategy_on_full: strategy.parse()?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Drop a stream and all of its messages. Missing streams are ignored.
    pub async fn delete_stream(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM relay_stream_entries WHERE stream = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM relay_streams WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        debug!(stream = %name, existed = removed > 0, "Stream deleted");
        Ok(())
    }

    /// Append a payload and return its sequence number.
    ///
    /// With a `dedupe_key`, a message still retained under the same key is
    /// returned instead of appending again; the flag is `false` in that case.
    pub async fn append_message(
        &self,
        stream: &str,
        payload: &str,
        dedupe_key: Option<&str>,
    ) -> Result<(i64, bool)> {
        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before it reads
        // the counter.
        let touched = sqlx::query("UPDATE relay_streams SET updated_at = ? WHERE name = ?")
            .bind(now)
            .bind(stream)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if touched == 0 {
            return Err(StoreError::StreamNotFound(stream.to_string()));
        }

        if let Some(key) = dedupe_key {
            let existing: Option<i64> = sqlx::query_scalar(
                r#"SELECT sequence_number FROM relay_stream_entries
                   WHERE stream = ? AND dedupe_key = ?
                   ORDER BY sequence_number
                   LIMIT 1"#,
            )
            .bind(stream)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(sequence_number) = existing {
                tx.commit().await?;
                return Ok((sequence_number, false));
            }
        }

        let row = sqlx::query("SELECT next_sequence, max_entries FROM relay_streams WHERE name = ?")
            .bind(stream)
            .fetch_one(&mut *tx)
            .await?;
        let sequence_number: i64 = row.get("next_sequence");
        let max_entries: i64 = row.get("max_entries");

        sqlx::query(
            r#"INSERT INTO relay_stream_entries (stream, sequence_number, payload, dedupe_key, appended_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(stream)
        .bind(sequence_number)
        .bind(payload)
        .bind(dedupe_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE relay_streams SET next_sequence = ? WHERE name = ?")
            .bind(sequence_number + 1)
            .bind(stream)
            .execute(&mut *tx)
            .await?;

        let evicted =
            Self::evict_below(&mut tx, stream, sequence_number + 1 - max_entries).await?;

        tx.commit().await?;
        self.append_notifier().notify_waiters();

        if evicted > 0 {
            debug!(stream = %stream, evicted, "Evicted oldest messages");
        }

        Ok((sequence_number, true))
    }

    /// Read up to `max` messages with `sequence_number >= from`, in order.
    pub async fn read_messages(&self, stream: &str, from: i64, max: usize) -> Result<Vec<StreamMessage>> {
        let rows = sqlx::query(
            r#"SELECT sequence_number, payload, dedupe_key, appended_at
               FROM relay_stream_entries
               WHERE stream = ? AND sequence_number >= ?
               ORDER BY sequence_number
               LIMIT ?"#,
        )
        .bind(stream)
        .bind(from)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() && !self.stream_exists(stream).await? {
            return Err(StoreError::StreamNotFound(stream.to_string()));
        }

        Ok(rows
            .into_iter()
            .map(|row| StreamMessage {
                sequence_number: row.get("sequence_number"),
                payload: row.get("payload"),
                dedupe_key: row.get("dedupe_key"),
                appended_at: row.get("appended_at"),
            })
            .collect())
    }

    /// Like [`read_messages`](Self::read_messages), but waits up to `timeout`
    /// for at least one message. Returns an empty batch on timeout.
    pub async fn wait_for_messages(
        &self,
        stream: &str,
        from: i64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = Instant::now() + timeout;

        loop {
            let messages = self.read_messages(stream, from, max).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(messages);
            }

            let wait = (deadline - now).min(READ_POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, self.append_notifier().notified()).await;
        }
    }

    /// Highest sequence number ever assigned in the stream, if any.
    pub async fn latest_sequence(&self, stream: &str) -> Result<Option<i64>> {
        let next: Option<i64> =
            sqlx::query_scalar("SELECT next_sequence FROM relay_streams WHERE name = ?")
                .bind(stream)
                .fetch_optional(&self.pool)
                .await?;

        match next {
            Some(next) if next > 0 => Ok(Some(next - 1)),
            Some(_) => Ok(None),
            None => Err(StoreError::StreamNotFound(stream.to_string())),
        }
    }

    /// Entry count and retained sequence range of a stream.
    pub async fn stream_stats(&self, stream: &str) -> Result<StreamStats> {
        if !self.stream_exists(stream).await? {
            return Err(StoreError::StreamNotFound(stream.to_string()));
        }

        let row = sqlx::query(
            r#"SELECT COUNT(*) AS entries,
                      MIN(sequence_number) AS oldest,
                      MAX(sequence_number) AS newest
               FROM relay_stream_entries
               WHERE stream = ?"#,
        )
        .bind(stream)
        .fetch_one(&self.pool)
        .await?;

        Ok(StreamStats {
            entries: row.get("entries"),
            oldest_sequence_number: row.get("oldest"),
            newest_sequence_number: row.get("newest"),
        })
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM relay_streams WHERE name = ?")
            .bind(stream)
            .fetch_optional(&self.pool)
            .await?;
        Ok(exists.is_some())
    }

    async fn evict_below(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        stream: &str,
        first_retained: i64,
    ) -> Result<u64> {
        if first_retained <= 0 {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM relay_stream_entries WHERE stream = ? AND sequence_number < ?",
        )
        .bind(stream)
        .bind(first_retained)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }
}
