//! AckReconciler: drains the status log and applies each delivery outcome.
//!
//! | Outcome    | Action                                                    |
//! |------------|-----------------------------------------------------------|
//! | Success    | delete the local file if configured; "already gone" is ok |
//! | InProgress | none                                                      |
//! | Failure    | resubmit with `retry_count + 1` up to the retry bound     |
//! | Canceled   | log only                                                  |
//!
//! Records are handled strictly in sequence order starting at the persisted
//! ack cursor, and the cursor (`sequence_number + 1`) is persisted after each
//! one. A crash therefore replays at most one record, and replaying is safe:
//! deletion tolerates a missing file and resubmission is deduplicated on the
//! status record's sequence number.

use crate::config::RelayConfig;
use crate::cursor::{load_ack_cursor, persist_ack_cursor};
use crate::error::Result;
use crate::shutdown::ShutdownSignal;
use filerelay_store::{DeliveryOutcome, DeliveryQueue, DeliveryStatusRecord, ShadowStore};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub delete_after_upload: bool,
    /// A failure is resubmitted while its retry count is at most this
    pub max_retries: u32,
    pub read_timeout: Duration,
    pub batch_size: usize,
    pub error_backoff: Duration,
}

impl ReconcilerSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            delete_after_upload: config.delete_after_upload,
            max_retries: config.max_retries,
            read_timeout: config.status_read_timeout(),
            batch_size: config.status_batch_size,
            error_backoff: config.error_backoff(),
        }
    }
}

/// What processing one status record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    /// Uploaded and deleted locally
    Deleted,
    /// Uploaded; the local file was already gone
    AlreadyGone,
    /// Uploaded; the local file is kept (by configuration or after a delete error)
    Kept,
    /// Attempt still running
    Observed,
    Resubmitted { sequence_number: i64 },
    /// Replay of a record whose resubmission is already queued
    AlreadyResubmitted { sequence_number: i64 },
    /// Failure for a file that no longer exists locally
    SourceMissing,
    /// Retry bound exceeded
    Abandoned,
    Canceled,
}

pub struct AckReconciler {
    queue: Arc<dyn DeliveryQueue>,
    shadows: Arc<dyn ShadowStore>,
    settings: ReconcilerSettings,
    next_sequence_number: i64,
}

impl AckReconciler {
    /// Load the ack cursor and build the reconciler.
    ///
    /// A cursor store error other than "absent" is returned.
    pub async fn new(
        queue: Arc<dyn DeliveryQueue>,
        shadows: Arc<dyn ShadowStore>,
        settings: ReconcilerSettings,
    ) -> Result<Self> {
        let next_sequence_number = load_ack_cursor(shadows.as_ref()).await?;
        Ok(Self {
            queue,
            shadows,
            settings,
            next_sequence_number,
        })
    }

    /// Sequence number of the next status record to process.
    pub fn next_sequence_number(&self) -> i64 {
        self.next_sequence_number
    }

    /// Apply the action for one record. Does not touch the cursor.
    pub async fn process_record(&self, record: &DeliveryStatusRecord) -> Result<RecordAction> {
        let path = record.task.path();

        match record.outcome {
            DeliveryOutcome::Success => {
                if !self.settings.delete_after_upload {
                    info!(path = %path.display(), key = %record.task.key, "Upload succeeded");
                    return Ok(RecordAction::Kept);
                }
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {
                        info!(path = %path.display(), key = %record.task.key, "Upload succeeded, local file deleted");
                        Ok(RecordAction::Deleted)
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        warn!(path = %path.display(), "Upload succeeded but the local file is already gone");
                        Ok(RecordAction::AlreadyGone)
                    }
                    Err(err) => {
                        error!(path = %path.display(), error = %err, "Upload succeeded but the local file could not be deleted");
                        Ok(RecordAction::Kept)
                    }
                }
            }
            DeliveryOutcome::InProgress => {
                debug!(
                    path = %path.display(),
                    task_sequence_number = record.task_sequence_number,
                    "Upload in progress"
                );
                Ok(RecordAction::Observed)
            }
            DeliveryOutcome::Failure => self.handle_failure(record).await,
            DeliveryOutcome::Canceled => {
                warn!(
                    path = %path.display(),
                    message = %record.message,
                    "Upload canceled"
                );
                Ok(RecordAction::Canceled)
            }
        }
    }

    async fn handle_failure(&self, record: &DeliveryStatusRecord) -> Result<RecordAction> {
        let path = record.task.path();
        let retry_count = record.retry_count_at_failure;

        if retry_count > self.settings.max_retries {
            error!(
                path = %path.display(),
                retry_count,
                message = %record.message,
                "Upload failed permanently, giving up"
            );
            return Ok(RecordAction::Abandoned);
        }

        let present = match tokio::fs::try_exists(path).await {
            Ok(present) => present,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Could not check the local file");
                false
            }
        };
        if !present {
            warn!(
                path = %path.display(),
                message = %record.message,
                "Upload failed and the local file no longer exists; not retrying"
            );
            return Ok(RecordAction::SourceMissing);
        }

        let task = record.task.resubmission(retry_count + 1);
        let dedupe_key = format!("retry:{}", record.sequence_number);
        let outcome = self.queue.append_once(&task, &dedupe_key).await?;

        if outcome.appended {
            warn!(
                path = %path.display(),
                retry = task.retry_count,
                sequence_number = outcome.sequence_number,
                message = %record.message,
                "Upload failed, resubmitted"
            );
            Ok(RecordAction::Resubmitted {
                sequence_number: outcome.sequence_number,
            })
        } else {
            debug!(
                path = %path.display(),
                sequence_number = outcome.sequence_number,
                "Resubmission already queued"
            );
            Ok(RecordAction::AlreadyResubmitted {
                sequence_number: outcome.sequence_number,
            })
        }
    }

    /// Process one record, then advance and persist the cursor.
    ///
    /// Returns `false` if shutdown arrived while the cursor could not be
    /// persisted.
    pub async fn handle_record(
        &mut self,
        record: &DeliveryStatusRecord,
        shutdown: &mut ShutdownSignal,
    ) -> Result<bool> {
        let action = self.process_record(record).await?;
        debug!(
            sequence_number = record.sequence_number,
            ?action,
            "Status record processed"
        );
        Ok(self.commit(record.sequence_number + 1, shutdown).await)
    }

    /// Set and persist the cursor, retrying after the error backoff.
    async fn commit(&mut self, next_sequence_number: i64, shutdown: &mut ShutdownSignal) -> bool {
        self.next_sequence_number = next_sequence_number;
        loop {
            match persist_ack_cursor(self.shadows.as_ref(), next_sequence_number).await {
                Ok(()) => return true,
                Err(err) => {
                    error!(
                        error = %err,
                        next_sequence_number,
                        "Failed to persist ack cursor, retrying in {:?}",
                        self.settings.error_backoff
                    );
                    if !shutdown.sleep(self.settings.error_backoff).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Read and process status records until shutdown.
    pub async fn run(&mut self, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(
            next_sequence_number = self.next_sequence_number,
            max_retries = self.settings.max_retries,
            delete_after_upload = self.settings.delete_after_upload,
            "Reconciler started"
        );

        'read: while !shutdown.is_shutdown() {
            let batch = self
                .queue
                .read_status(
                    self.next_sequence_number,
                    self.settings.batch_size,
                    self.settings.read_timeout,
                )
                .await;

            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    if err.is_transient() {
                        warn!(error = %err, "Failed to read status records");
                    } else {
                        error!(error = %err, "Failed to read status records");
                    }
                    shutdown.sleep(self.settings.error_backoff).await;
                    continue;
                }
            };

            for record in &batch.records {
                if shutdown.is_shutdown() {
                    break 'read;
                }
                if record.sequence_number < self.next_sequence_number {
                    continue;
                }
                match self.handle_record(record, &mut shutdown).await {
                    Ok(true) => {}
                    Ok(false) => break 'read,
                    Err(err) => {
                        warn!(
                            sequence_number = record.sequence_number,
                            error = %err,
                            "Failed to process status record, retrying in {:?}",
                            self.settings.error_backoff
                        );
                        shutdown.sleep(self.settings.error_backoff).await;
                        continue 'read;
                    }
                }
            }

            // Unreadable records after the last good one
            if batch.next_sequence_number > self.next_sequence_number
                && !self.commit(batch.next_sequence_number, &mut shutdown).await
            {
                break;
            }
        }

        persist_ack_cursor(self.shadows.as_ref(), self.next_sequence_number).await?;
        info!(
            next_sequence_number = self.next_sequence_number,
            "Reconciler stopped, ack cursor flushed"
        );
        Ok(())
    }
}
