//! Periodic rescan filtered by the persisted scan cursor.

use super::{walk_and_submit, Discoverer, TreeWalker, WalkSummary};
use crate::cursor::{load_scan_cursor, persist_scan_cursor};
use crate::error::Result;
use crate::shutdown::ShutdownSignal;
use crate::submitter::UploadSubmitter;
use async_trait::async_trait;
use chrono::Utc;
use filerelay_store::ShadowStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct PollDiscoverer {
    walker: TreeWalker,
    interval: Duration,
    backoff: Duration,
    shadows: Arc<dyn ShadowStore>,
    /// Start time (ms) of the last complete walk; 0 takes every file
    last_scan: i64,
}

impl PollDiscoverer {
    /// Load the scan cursor and build the discoverer.
    pub async fn new(
        walker: TreeWalker,
        interval: Duration,
        backoff: Duration,
        shadows: Arc<dyn ShadowStore>,
    ) -> Result<Self> {
        let last_scan = load_scan_cursor(shadows.as_ref()).await?;
        Ok(Self {
            walker,
            interval,
            backoff,
            shadows,
            last_scan,
        })
    }

    pub fn last_scan(&self) -> i64 {
        self.last_scan
    }

    /// Walk the tree once and submit every file modified after the last
    /// complete walk. Advances and persists the scan cursor only if the walk
    /// completed.
    pub async fn scan_once(
        &mut self,
        submitter: &UploadSubmitter,
        shutdown: &mut ShutdownSignal,
    ) -> Result<WalkSummary> {
        let scan_start = Utc::now().timestamp_millis();
        let since = self.last_scan;
        let mut submitted = 0usize;

        let summary = walk_and_submit(
            &self.walker,
            move |file| since == 0 || file.modified_ms > since,
            |_| submitted += 1,
            submitter,
            self.backoff,
            shutdown,
        )
        .await?;

        if summary.completed {
            self.last_scan = scan_start;
            if let Err(err) = persist_scan_cursor(self.shadows.as_ref(), scan_start).await {
                // Kept in memory; flushed again after the next walk or on shutdown
                error!(error = %err, "Failed to persist scan cursor");
            }
            info!(
                root = %self.walker.root().display(),
                matched = summary.files_matched,
                submitted,
                errors = summary.errors,
                "Scan complete"
            );
        } else {
            debug!(submitted, "Scan interrupted; cursor not advanced");
        }

        Ok(summary)
    }
}

#[async_trait]
impl Discoverer for PollDiscoverer {
    fn mode(&self) -> &'static str {
        "poll"
    }

    async fn run(&mut self, submitter: &UploadSubmitter, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(
            root = %self.walker.root().display(),
            interval_secs = self.interval.as_secs(),
            last_scan = self.last_scan,
            "Polling for files"
        );

        while !shutdown.is_shutdown() {
            self.scan_once(submitter, &mut shutdown).await?;
            if !shutdown.sleep(self.interval).await {
                break;
            }
        }

        persist_scan_cursor(self.shadows.as_ref(), self.last_scan).await?;
        info!(last_scan = self.last_scan, "Scan cursor flushed");
        Ok(())
    }
}
