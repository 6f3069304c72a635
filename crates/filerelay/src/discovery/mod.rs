//! FileDiscovery: finds files under the watched directory and hands them to
//! the [`UploadSubmitter`] one at a time, in walk order.
//!
//! Two modes, selected by configuration:
//!
//! - **Event** ([`EventDiscoverer`]): one full scan at startup, then create and
//!   modify notifications from a polling observer. Polling works on network
//!   filesystems where inotify-style notifications are unreliable.
//! - **Poll** ([`PollDiscoverer`]): a full rescan every interval, taking only
//!   files modified since the previous complete scan.
//!
//! The walk itself runs on a blocking thread and feeds the async submitter
//! through a channel of capacity one, so a slow queue slows the walk down
//! instead of buffering the tree in memory.

mod patterns;
mod poll;
mod walk;
mod watch;

pub use patterns::{normalize_glob_pattern, to_forward_slashes, FilePattern};
pub use poll::PollDiscoverer;
pub use walk::{TreeWalker, WalkSummary, WatchedFile};
pub use watch::{EventDiscoverer, FileEvent};

use crate::config::{DiscoveryMode, RelayConfig};
use crate::error::{RelayError, Result};
use crate::shutdown::ShutdownSignal;
use crate::submitter::UploadSubmitter;
use async_trait::async_trait;
use filerelay_store::ShadowStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A file discovery strategy.
#[async_trait]
pub trait Discoverer: Send {
    /// Short name for logs.
    fn mode(&self) -> &'static str;

    /// Discover and submit files until shutdown is requested.
    async fn run(&mut self, submitter: &UploadSubmitter, shutdown: ShutdownSignal) -> Result<()>;
}

/// Build the discoverer selected by `config`.
///
/// Poll mode reads its scan cursor here; a store error other than "absent"
/// is returned.
pub async fn discoverer_for(
    config: &RelayConfig,
    shadows: Arc<dyn ShadowStore>,
) -> Result<Box<dyn Discoverer>> {
    let walker = TreeWalker::new(config.target_dir.clone(), config.file_pattern()?);

    match config.discovery_mode() {
        DiscoveryMode::Event { tick } => Ok(Box::new(EventDiscoverer::new(
            walker,
            tick,
            config.error_backoff(),
            config.delete_after_upload,
        ))),
        DiscoveryMode::Poll { interval } => Ok(Box::new(
            PollDiscoverer::new(walker, interval, config.error_backoff(), shadows).await?,
        )),
    }
}

/// Walk on a blocking thread and submit every file `filter` accepts.
///
/// `on_submitted` sees each file after it is queued. The walk stops at the
/// next matching file once shutdown is requested. The returned summary is
/// `completed` only if the whole tree was walked and every accepted file was
/// queued.
pub(crate) async fn walk_and_submit<F, G>(
    walker: &TreeWalker,
    filter: F,
    mut on_submitted: G,
    submitter: &UploadSubmitter,
    backoff: Duration,
    shutdown: &mut ShutdownSignal,
) -> Result<WalkSummary>
where
    F: Fn(&WatchedFile) -> bool + Send + 'static,
    G: FnMut(WatchedFile),
{
    let (tx, mut rx) = mpsc::channel::<WatchedFile>(1);
    let walker = walker.clone();
    let walk_shutdown = shutdown.clone();
    let handle = tokio::task::spawn_blocking(move || {
        walker.walk(|file| {
            if walk_shutdown.is_shutdown() {
                return false;
            }
            if !filter(&file) {
                return true;
            }
            tx.blocking_send(file).is_ok()
        })
    });

    let mut interrupted = false;
    let mut failure = None;
    while let Some(file) = rx.recv().await {
        if shutdown.is_shutdown() {
            interrupted = true;
            break;
        }
        match submitter.submit_with_retry(&file, backoff, shutdown).await {
            Ok(true) => on_submitted(file),
            Ok(false) => {
                interrupted = true;
                break;
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    // Unblocks the walker if it is waiting on the channel
    drop(rx);

    let summary = handle
        .await
        .map_err(|e| RelayError::Task(format!("walker thread failed: {}", e)))?;
    if let Some(err) = failure {
        return Err(err);
    }

    Ok(WalkSummary {
        completed: summary.completed && !interrupted,
        ..summary
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use filerelay_store::{RelayDb, SqliteDeliveryQueue};
    use std::fs;
    use tempfile::TempDir;

    async fn submitter() -> (Arc<SqliteDeliveryQueue>, UploadSubmitter) {
        let db = RelayDb::open_in_memory().await.unwrap();
        let queue = Arc::new(SqliteDeliveryQueue::open(db, "tasks", 100).await.unwrap());
        let submitter = UploadSubmitter::new(queue.clone(), "bucket", None);
        (queue, submitter)
    }

    fn walker_with(names: &[&str]) -> (TempDir, TreeWalker) {
        let tmp = TempDir::new().unwrap();
        for name in names {
            fs::write(tmp.path().join(name), name).unwrap();
        }
        let walker = TreeWalker::new(tmp.path(), FilePattern::new("*.log").unwrap());
        (tmp, walker)
    }

    #[tokio::test]
    async fn test_walk_submits_accepted_files_in_order() {
        let (_tmp, walker) = walker_with(&["b.log", "a.log", "skip.log"]);
        let (queue, submitter) = submitter().await;
        let (_trigger, mut shutdown) = crate::shutdown::channel();
        let mut seen = Vec::new();

        let summary = walk_and_submit(
            &walker,
            |file| file.relative_path != "skip.log",
            |file| seen.push(file.relative_path),
            &submitter,
            Duration::from_millis(1),
            &mut shutdown,
        )
        .await
        .unwrap();

        assert!(summary.completed);
        assert_eq!(summary.files_matched, 3);
        assert_eq!(seen, vec!["a.log", "b.log"]);
        assert_eq!(queue.read_tasks(0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_walk_stops_on_shutdown_even_when_nothing_is_accepted() {
        let (_tmp, walker) = walker_with(&["a.log", "b.log", "c.log", "d.log"]);
        let (queue, submitter) = submitter().await;
        let (trigger, mut shutdown) = crate::shutdown::channel();
        trigger.trigger();

        let summary = walk_and_submit(
            &walker,
            |_| false,
            |_| {},
            &submitter,
            Duration::from_millis(1),
            &mut shutdown,
        )
        .await
        .unwrap();

        assert!(!summary.completed);
        assert_eq!(summary.files_matched, 1);
        assert!(queue.read_tasks(0, 10).await.unwrap().is_empty());
    }
}
