//! Shadow documents: small named JSON documents used for cursor storage.
//!
//! Each document has the device-shadow shape
//! `{"state":{"reported":{...}},"version":N}`. Writes merge the given
//! reported fields into the stored document and bump its version; the last
//! write wins.

use crate::error::Result;
use crate::RelayDb;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::Row;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowDocument {
    pub state: ShadowState,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowState {
    #[serde(default)]
    pub reported: Map<String, Value>,
}

impl ShadowDocument {
    /// A reported field, if present.
    pub fn reported(&self, field: &str) -> Option<&Value> {
        self.state.reported.get(field)
    }
}

/// Durable key/value document store. Absence is explicit.
#[async_trait]
pub trait ShadowStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ShadowDocument>>;

    /// Merge `reported` into the named document and return the result.
    async fn set(&self, name: &str, reported: Map<String, Value>) -> Result<ShadowDocument>;
}

/// [`ShadowStore`] backed by the relay database.
#[derive(Clone)]
pub struct SqliteShadowStore {
    db: RelayDb,
}

impl SqliteShadowStore {
    pub fn new(db: RelayDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ShadowStore for SqliteShadowStore {
    async fn get(&self, name: &str) -> Result<Option<ShadowDocument>> {
        let row = sqlx::query("SELECT document, version FROM relay_shadows WHERE name = ?")
            .bind(name)
            .fetch_optional(self.db.pool())
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.get("document");
                let mut document: ShadowDocument = serde_json::from_str(&raw)?;
                document.version = row.get("version");
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, name: &str, reported: Map<String, Value>) -> Result<ShadowDocument> {
        let now = RelayDb::now_millis();
        let mut tx = self.db.pool().begin().await?;

        // Take the write lock before reading the current document.
        sqlx::query("UPDATE relay_shadows SET updated_at = ? WHERE name = ?")
            .bind(now)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query("SELECT document, version FROM relay_shadows WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

        let mut document = match existing {
            Some(row) => {
                let raw: String = row.get("document");
                let mut document: ShadowDocument = serde_json::from_str(&raw)?;
                document.version = row.get("version");
                document
            }
            None => ShadowDocument::default(),
        };

        document.state.reported.extend(reported);
        document.version += 1;

        sqlx::query(
            r#"INSERT INTO relay_shadows (name, document, version, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                   document = excluded.document,
                   version = excluded.version,
                   updated_at = excluded.updated_at"#,
        )
        .bind(name)
        .bind(serde_json::to_string(&document)?)
        .bind(document.version)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(shadow = %name, version = document.version, "Shadow updated");
        Ok(document)
    }
}
