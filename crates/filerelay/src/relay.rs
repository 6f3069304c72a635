//! Service wiring: database, queue, cursors, and the two pipeline tasks.

use crate::config::RelayConfig;
use crate::cursor::{persist_ack_cursor, Cursor};
use crate::discovery::discoverer_for;
use crate::error::{RelayError, Result};
use crate::reconciler::{AckReconciler, ReconcilerSettings};
use crate::shutdown::ShutdownTrigger;
use crate::submitter::UploadSubmitter;
use filerelay_store::{
    DeliveryQueue, QueueStats, RelayDb, ShadowStore, SqliteDeliveryQueue, SqliteShadowStore,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{error, info, warn};

/// How long both tasks get to finish their in-flight work after shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Snapshot for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub cursor: Cursor,
    pub latest_task_sequence_number: Option<i64>,
    pub stats: QueueStats,
}

pub struct RelayService {
    config: RelayConfig,
    db: RelayDb,
    queue: Arc<SqliteDeliveryQueue>,
    shadows: Arc<SqliteShadowStore>,
}

impl RelayService {
    /// Open the database and create or update both streams.
    ///
    /// Never destroys data; `clear_stream` only takes effect in [`run`].
    ///
    /// [`run`]: RelayService::run
    pub async fn open(config: RelayConfig) -> Result<Self> {
        let db = RelayDb::open(&config.database_path).await?;
        let queue = Arc::new(
            SqliteDeliveryQueue::open(db.clone(), &config.stream_name, config.queue_capacity).await?,
        );
        let shadows = Arc::new(SqliteShadowStore::new(db.clone()));

        Ok(Self {
            config,
            db,
            queue,
            shadows,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The delivery queue, including its engine-side API.
    pub fn queue(&self) -> Arc<SqliteDeliveryQueue> {
        self.queue.clone()
    }

    pub fn shadows(&self) -> Arc<SqliteShadowStore> {
        self.shadows.clone()
    }

    /// Drop and recreate both streams and reset the ack cursor to 0.
    pub async fn clear(&self) -> Result<()> {
        self.queue.clear().await?;
        persist_ack_cursor(self.shadows.as_ref(), 0).await?;
        warn!(stream = %self.config.stream_name, "Delivery streams cleared, ack cursor reset");
        Ok(())
    }

    pub async fn status(&self) -> Result<RelayStatus> {
        Ok(RelayStatus {
            cursor: Cursor::load(self.shadows.as_ref()).await?,
            latest_task_sequence_number: self.queue.latest_sequence_number().await?,
            stats: self.queue.stats().await?,
        })
    }

    /// Run discovery and reconciliation until `trigger` fires or either task
    /// stops on its own. Both tasks then get [`SHUTDOWN_GRACE`] to flush
    /// their cursors.
    ///
    /// With `clear_stream` set, both streams are dropped and recreated and
    /// the ack cursor is reset before anything starts.
    pub async fn run(self, trigger: ShutdownTrigger) -> Result<()> {
        if self.config.clear_stream {
            self.clear().await?;
        }

        let queue: Arc<dyn DeliveryQueue> = self.queue.clone();
        let shadows: Arc<dyn ShadowStore> = self.shadows.clone();

        // Both read their cursors here; store errors are fatal before anything starts
        let mut discoverer = discoverer_for(&self.config, shadows.clone()).await?;
        let mut reconciler = AckReconciler::new(
            queue.clone(),
            shadows,
            ReconcilerSettings::from_config(&self.config),
        )
        .await?;
        let submitter = UploadSubmitter::new(
            queue,
            self.config.bucket.clone(),
            self.config.key_template()?,
        );

        info!(
            mode = discoverer.mode(),
            root = %self.config.target_dir.display(),
            next_ack_sequence_number = reconciler.next_sequence_number(),
            "Relay started"
        );

        let discovery_signal = trigger.subscribe();
        let mut discovery = tokio::spawn(async move {
            discoverer.run(&submitter, discovery_signal).await
        });
        let reconciler_signal = trigger.subscribe();
        let mut reconciliation = tokio::spawn(async move { reconciler.run(reconciler_signal).await });

        let mut shutdown = trigger.subscribe();
        let mut discovery_result = None;
        let mut reconciliation_result = None;
        tokio::select! {
            _ = shutdown.wait() => {}
            joined = &mut discovery => discovery_result = Some(joined),
            joined = &mut reconciliation => reconciliation_result = Some(joined),
        }
        if !trigger.is_triggered() {
            warn!("A pipeline task stopped on its own, shutting down");
            trigger.trigger();
        }

        let drain = async {
            let discovery_joined = match discovery_result {
                Some(joined) => joined,
                None => (&mut discovery).await,
            };
            let reconciliation_joined = match reconciliation_result {
                Some(joined) => joined,
                None => (&mut reconciliation).await,
            };
            (discovery_joined, reconciliation_joined)
        };
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, drain).await;

        let (discovery_joined, reconciliation_joined) = match drained {
            Ok(results) => results,
            Err(_) => {
                error!("Pipeline tasks did not stop within {:?}", SHUTDOWN_GRACE);
                discovery.abort();
                reconciliation.abort();
                return Err(RelayError::Task("shutdown grace period exceeded".to_string()));
            }
        };

        let discovery_outcome = task_outcome("discovery", discovery_joined);
        let reconciliation_outcome = task_outcome("reconciler", reconciliation_joined);

        self.db.close().await;
        info!("Relay stopped");

        discovery_outcome.and(reconciliation_outcome)
    }
}

fn task_outcome(name: &str, joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => {
            info!(task = name, "Task stopped");
            Ok(())
        }
        Ok(Err(err)) => {
            error!(task = name, error = %err, "Task failed");
            Err(err)
        }
        Err(err) => {
            error!(task = name, error = %err, "Task panicked");
            Err(RelayError::Task(format!("{} task: {}", name, err)))
        }
    }
}
