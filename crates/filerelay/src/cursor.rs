//! Persisted replication position.
//!
//! Two independent cursors, each in its own shadow document with a single
//! writer:
//!
//! - `latest_check_time.latest_time`: start time (ms) of the last complete
//!   poll-mode walk.
//! - `file_upload_sequence_number.next_sequence_number`: next status record
//!   not yet fully processed by the reconciler.
//!
//! An absent document (or field) reads as 0. Anything else the store returns
//! that cannot be read as an integer is an error.

use crate::error::{RelayError, Result};
use filerelay_store::ShadowStore;
use serde::Serialize;
use serde_json::{Map, Value};

pub const SCAN_CURSOR_SHADOW: &str = "latest_check_time";
pub const SCAN_CURSOR_FIELD: &str = "latest_time";

pub const ACK_CURSOR_SHADOW: &str = "file_upload_sequence_number";
pub const ACK_CURSOR_FIELD: &str = "next_sequence_number";

/// Snapshot of both cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Cursor {
    pub next_ack_sequence_number: i64,
    pub last_scan_timestamp: i64,
}

impl Cursor {
    pub async fn load(store: &dyn ShadowStore) -> Result<Self> {
        Ok(Self {
            next_ack_sequence_number: load_ack_cursor(store).await?,
            last_scan_timestamp: load_scan_cursor(store).await?,
        })
    }
}

pub async fn load_ack_cursor(store: &dyn ShadowStore) -> Result<i64> {
    read_field(store, ACK_CURSOR_SHADOW, ACK_CURSOR_FIELD).await
}

pub async fn persist_ack_cursor(store: &dyn ShadowStore, next_sequence_number: i64) -> Result<()> {
    write_field(store, ACK_CURSOR_SHADOW, ACK_CURSOR_FIELD, next_sequence_number).await
}

pub async fn load_scan_cursor(store: &dyn ShadowStore) -> Result<i64> {
    read_field(store, SCAN_CURSOR_SHADOW, SCAN_CURSOR_FIELD).await
}

pub async fn persist_scan_cursor(store: &dyn ShadowStore, latest_time: i64) -> Result<()> {
    write_field(store, SCAN_CURSOR_SHADOW, SCAN_CURSOR_FIELD, latest_time).await
}

async fn read_field(store: &dyn ShadowStore, shadow: &str, field: &str) -> Result<i64> {
    let Some(document) = store.get(shadow).await? else {
        return Ok(0);
    };
    match document.reported(field) {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value.as_i64().ok_or_else(|| RelayError::CorruptCursor {
            name: format!("{}.{}", shadow, field),
            reason: format!("expected an integer, found {}", value),
        }),
    }
}

async fn write_field(store: &dyn ShadowStore, shadow: &str, field: &str, value: i64) -> Result<()> {
    let mut reported = Map::new();
    reported.insert(field.to_string(), Value::from(value));
    store.set(shadow, reported).await?;
    Ok(())
}
