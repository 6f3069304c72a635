//! Durable delivery queue: a task stream plus its companion status stream.
//!
//! The replication side appends [`DeliveryTask`]s and reads back
//! [`DeliveryStatusRecord`]s. The delivery engine side reads tasks and reports
//! a status for each attempt. Both sides only meet through the database.

use crate::error::{Result, StoreError};
use crate::stream::{StreamDefinition, StreamMessage, StreamStats};
use crate::types::{
    DeliveryOutcome, DeliveryStatusRecord, DeliveryTask, ExportTaskDefinition, QueueEntry,
    StatusBatch, StatusContext, StatusMessage,
};
use crate::RelayDb;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of an idempotent append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub sequence_number: i64,
    /// `false` when an entry with the same dedupe key was already retained.
    pub appended: bool,
}

/// Occupancy of both streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStats {
    pub tasks: StreamStats,
    pub statuses: StreamStats,
}

/// What the replication pipeline needs from the durable queue.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Append a task and return its sequence number.
    async fn append(&self, task: &DeliveryTask) -> Result<i64>;

    /// Append a task unless one with the same dedupe key is still retained.
    async fn append_once(&self, task: &DeliveryTask, dedupe_key: &str) -> Result<AppendOutcome>;

    /// Read status records with `sequence_number >= from`, in order.
    ///
    /// Waits up to `timeout` for at least one record and returns an empty
    /// batch when none arrives. Unreadable records are left out of
    /// `records` but still counted in `next_sequence_number`.
    async fn read_status(&self, from: i64, max: usize, timeout: Duration) -> Result<StatusBatch>;

    /// Highest task sequence number assigned so far.
    async fn latest_sequence_number(&self) -> Result<Option<i64>>;
}

/// [`DeliveryQueue`] backed by two streams in the relay database.
#[derive(Clone)]
pub struct SqliteDeliveryQueue {
    db: RelayDb,
    task_stream: String,
    status_stream: String,
    capacity: i64,
}

impl SqliteDeliveryQueue {
    /// Create or update both streams and return a handle.
    pub async fn open(db: RelayDb, stream_name: &str, capacity: i64) -> Result<Self> {
        let queue = Self {
            db,
            task_stream: stream_name.to_string(),
            status_stream: status_stream_name(stream_name),
            capacity,
        };
        queue.ensure_streams().await?;
        Ok(queue)
    }

    /// Name of the status stream.
    pub fn status_stream(&self) -> &str {
        &self.status_stream
    }

    /// Idempotently create or update both stream definitions.
    pub async fn ensure_streams(&self) -> Result<()> {
        for name in [&self.task_stream, &self.status_stream] {
            match self.db.stream_definition(name).await? {
                Some(existing) if existing.max_entries != self.capacity => info!(
                    stream = %name,
                    from = existing.max_entries,
                    to = self.capacity,
                    "Stream capacity changed"
                ),
                Some(_) => {}
                None => info!(stream = %name, capacity = self.capacity, "Stream created"),
            }
            self.db
                .create_or_update_stream(&StreamDefinition::new(name.as_str(), self.capacity))
                .await?;
        }
        Ok(())
    }

    /// Drop and recreate both streams, destroying all unread tasks and
    /// status history. Sequence numbers restart at 0.
    pub async fn clear(&self) -> Result<()> {
        for name in [&self.task_stream, &self.status_stream] {
            self.db.delete_stream(name).await?;
        }
        self.ensure_streams().await?;
        info!(stream = %self.task_stream, "Delivery streams cleared");
        Ok(())
    }

    /// Engine side: read pending tasks with `sequence_number >= from`.
    pub async fn read_tasks(&self, from: i64, max: usize) -> Result<Vec<QueueEntry>> {
        let messages = self.db.read_messages(&self.task_stream, from, max).await?;
        messages
            .into_iter()
            .map(|message| {
                let definition: ExportTaskDefinition = serde_json::from_str(&message.payload)
                    .map_err(|err| self.malformed(&self.task_stream, &message, err.to_string()))?;
                let task = DeliveryTask::from_definition(&definition).ok_or_else(|| {
                    self.malformed(&self.task_stream, &message, "input URL is not a local file".to_string())
                })?;
                Ok(QueueEntry {
                    sequence_number: message.sequence_number,
                    task,
                })
            })
            .collect()
    }

    /// Engine side: publish the outcome of one delivery attempt.
    pub async fn report_status(
        &self,
        task_sequence_number: i64,
        task: &DeliveryTask,
        outcome: DeliveryOutcome,
        message: &str,
    ) -> Result<i64> {
        let status = StatusMessage {
            status: outcome,
            message: message.to_string(),
            status_context: StatusContext {
                sequence_number: task_sequence_number,
                s3_export_task_definition: task.to_definition(),
            },
        };
        let payload = serde_json::to_string(&status)?;
        let (sequence_number, _) = self
            .db
            .append_message(&self.status_stream, &payload, None)
            .await?;

        debug!(
            task_sequence_number,
            status_sequence_number = sequence_number,
            outcome = %outcome,
            "Status reported"
        );
        Ok(sequence_number)
    }

    /// Entry counts and retained ranges of both streams.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            tasks: self.db.stream_stats(&self.task_stream).await?,
            statuses: self.db.stream_stats(&self.status_stream).await?,
        })
    }

    fn encode_task(task: &DeliveryTask) -> Result<String> {
        Ok(serde_json::to_string(&task.to_definition())?)
    }

    fn decode_status(&self, message: &StreamMessage) -> Result<DeliveryStatusRecord> {
        let status: StatusMessage = serde_json::from_str(&message.payload)
            .map_err(|err| self.malformed(&self.status_stream, message, err.to_string()))?;
        let task = DeliveryTask::from_definition(&status.status_context.s3_export_task_definition)
            .ok_or_else(|| {
                self.malformed(
                    &self.status_stream,
                    message,
                    "input URL is not a local file".to_string(),
                )
            })?;

        Ok(DeliveryStatusRecord {
            sequence_number: message.sequence_number,
            task_sequence_number: status.status_context.sequence_number,
            outcome: status.status,
            message: status.message,
            retry_count_at_failure: task.retry_count,
            task,
        })
    }

    fn malformed(&self, stream: &str, message: &StreamMessage, reason: String) -> StoreError {
        StoreError::MalformedRecord {
            stream: stream.to_string(),
            sequence_number: message.sequence_number,
            reason,
        }
    }
}

#[async_trait]
impl DeliveryQueue for SqliteDeliveryQueue {
    async fn append(&self, task: &DeliveryTask) -> Result<i64> {
        let payload = Self::encode_task(task)?;
        let (sequence_number, _) = self
            .db
            .append_message(&self.task_stream, &payload, None)
            .await?;
        Ok(sequence_number)
    }

    async fn append_once(&self, task: &DeliveryTask, dedupe_key: &str) -> Result<AppendOutcome> {
        let payload = Self::encode_task(task)?;
        let (sequence_number, appended) = self
            .db
            .append_message(&self.task_stream, &payload, Some(dedupe_key))
            .await?;
        Ok(AppendOutcome {
            sequence_number,
            appended,
        })
    }

    async fn read_status(&self, from: i64, max: usize, timeout: Duration) -> Result<StatusBatch> {
        let messages = self
            .db
            .wait_for_messages(&self.status_stream, from, max, timeout)
            .await?;

        if let Some(first) = messages.first() {
            if first.sequence_number > from {
                warn!(
                    stream = %self.status_stream,
                    expected = from,
                    found = first.sequence_number,
                    lost = first.sequence_number - from,
                    "Status records were evicted before they were processed"
                );
            }
        }

        let mut batch = StatusBatch::empty(from);
        for message in &messages {
            match self.decode_status(message) {
                Ok(record) => batch.records.push(record),
                Err(err) => error!(error = %err, "Skipping unreadable status record"),
            }
            batch.next_sequence_number = message.sequence_number + 1;
        }
        Ok(batch)
    }

    async fn latest_sequence_number(&self) -> Result<Option<i64>> {
        self.db.latest_sequence(&self.task_stream).await
    }
}

/// Name of the status stream paired with a task stream.
pub fn status_stream_name(task_stream: &str) -> String {
    format!("{}_status", task_stream)
}
