//! Delivery task and status types, plus their wire representation.
//!
//! The delivery engine exchanges camelCase JSON:
//!
//! ```json
//! {"inputUrl":"file:/data/a.log","bucket":"b","key":"a.log","userMetadata":{"retry":1}}
//! {"status":"Failure","message":"timeout",
//!  "statusContext":{"sequenceNumber":4,"s3ExportTaskDefinition":{...}}}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const FILE_URL_PREFIX: &str = "file:///";
#[cfg(not(windows))]
const FILE_URL_PREFIX: &str = "file:";

/// A request to deliver one local file to one destination key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTask {
    pub local_path: PathBuf,
    pub bucket: String,
    pub key: String,
    /// Number of times this task has been resubmitted after a failure.
    pub retry_count: u32,
}

impl DeliveryTask {
    pub fn new(local_path: impl Into<PathBuf>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            bucket: bucket.into(),
            key: key.into(),
            retry_count: 0,
        }
    }

    /// Same destination, one more retry.
    pub fn resubmission(&self, retry_count: u32) -> Self {
        Self {
            retry_count,
            ..self.clone()
        }
    }

    /// Convert into the engine's export task definition.
    pub fn to_definition(&self) -> ExportTaskDefinition {
        ExportTaskDefinition {
            input_url: format!("{}{}", FILE_URL_PREFIX, self.local_path.display()),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            user_metadata: (self.retry_count > 0).then(|| UserMetadata {
                retry: self.retry_count,
            }),
        }
    }

    /// Parse the engine's export task definition.
    ///
    /// Returns `None` when the input URL is not a local file URL.
    pub fn from_definition(def: &ExportTaskDefinition) -> Option<Self> {
        let path = def.input_url.strip_prefix(FILE_URL_PREFIX)?;
        if path.is_empty() {
            return None;
        }
        Some(Self {
            local_path: PathBuf::from(path),
            bucket: def.bucket.clone(),
            key: def.key.clone(),
            retry_count: def.user_metadata.as_ref().map(|m| m.retry).unwrap_or(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.local_path
    }
}

/// Engine-side task definition (wire form of [`DeliveryTask`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTaskDefinition {
    pub input_url: String,
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<UserMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default)]
    pub retry: u32,
}

/// Task-log entry: queue-assigned sequence number plus the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub sequence_number: i64,
    pub task: DeliveryTask,
}

/// Terminal or intermediate state of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    InProgress,
    Success,
    Failure,
    Canceled,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::InProgress => "InProgress",
            DeliveryOutcome::Success => "Success",
            DeliveryOutcome::Failure => "Failure",
            DeliveryOutcome::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire form of a status-log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub status: DeliveryOutcome,
    #[serde(default)]
    pub message: String,
    pub status_context: StatusContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusContext {
    /// Sequence number of the originating task-log entry.
    pub sequence_number: i64,
    pub s3_export_task_definition: ExportTaskDefinition,
}

/// A status report as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryStatusRecord {
    /// Position of this record in the status log.
    pub sequence_number: i64,
    /// Sequence number of the task-log entry this status refers to.
    pub task_sequence_number: i64,
    pub outcome: DeliveryOutcome,
    pub message: String,
    /// Retry count carried by the task at the time it was reported.
    pub retry_count_at_failure: u32,
    pub task: DeliveryTask,
}

/// One read from the status log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBatch {
    /// Readable records in sequence order
    pub records: Vec<DeliveryStatusRecord>,
    /// One past the last status read, unreadable records included; the
    /// requested start when nothing was read
    pub next_sequence_number: i64,
}

impl StatusBatch {
    pub fn empty(from: i64) -> Self {
        Self {
            records: Vec::new(),
            next_sequence_number: from,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
