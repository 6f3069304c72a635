//! Event-driven discovery backed by a polling observer.

use super::{walk_and_submit, Discoverer, TreeWalker, WatchedFile};
use crate::error::{RelayError, Result};
use crate::shutdown::ShutdownSignal;
use crate::submitter::UploadSubmitter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Created,
    Modified,
}

/// (mtime ms, size) as last observed
type FileStamp = (i64, u64);

pub struct EventDiscoverer {
    walker: TreeWalker,
    tick: Duration,
    backoff: Duration,
    delete_after_upload: bool,
    snapshot: HashMap<PathBuf, FileStamp>,
}

impl EventDiscoverer {
    pub fn new(walker: TreeWalker, tick: Duration, backoff: Duration, delete_after_upload: bool) -> Self {
        Self {
            walker,
            tick,
            backoff,
            delete_after_upload,
            snapshot: HashMap::new(),
        }
    }

    /// Submit every matching file and record it as the observer baseline.
    ///
    /// Returns `false` if shutdown interrupted the scan.
    pub async fn initial_scan(
        &mut self,
        submitter: &UploadSubmitter,
        shutdown: &mut ShutdownSignal,
    ) -> Result<bool> {
        let snapshot = &mut self.snapshot;
        let summary = walk_and_submit(
            &self.walker,
            |_| true,
            |file| {
                snapshot.insert(file.path, (file.modified_ms, file.len));
            },
            submitter,
            self.backoff,
            shutdown,
        )
        .await?;

        info!(
            root = %self.walker.root().display(),
            submitted = summary.files_matched,
            errors = summary.errors,
            "Startup scan complete"
        );
        Ok(summary.completed)
    }

    /// Compare a fresh walk with the previous one.
    ///
    /// Vanished files are forgotten, so a file recreated under the same path
    /// is reported as created again.
    pub fn diff(&mut self, files: Vec<WatchedFile>) -> Vec<(FileEvent, WatchedFile)> {
        let mut events = Vec::new();
        let mut current = HashMap::with_capacity(files.len());

        for file in files {
            let stamp = (file.modified_ms, file.len);
            match self.snapshot.get(&file.path) {
                None => events.push((FileEvent::Created, file.clone())),
                Some(previous) if *previous != stamp => {
                    events.push((FileEvent::Modified, file.clone()))
                }
                Some(_) => {}
            }
            current.insert(file.path, stamp);
        }

        self.snapshot = current;
        events
    }

    /// Whether an event should produce an upload.
    pub fn should_submit(&self, event: FileEvent, file: &WatchedFile) -> bool {
        if file.is_hidden() {
            return false;
        }
        match event {
            FileEvent::Created => true,
            // Writes to a file that is about to be deleted must not queue it again
            FileEvent::Modified => !self.delete_after_upload,
        }
    }

    async fn observe(&mut self) -> Result<Vec<(FileEvent, WatchedFile)>> {
        let walker = self.walker.clone();
        let files = tokio::task::spawn_blocking(move || walker.snapshot())
            .await
            .map_err(|e| RelayError::Task(format!("observer walk failed: {}", e)))?;
        Ok(self.diff(files))
    }
}

#[async_trait]
impl Discoverer for EventDiscoverer {
    fn mode(&self) -> &'static str {
        "event"
    }

    async fn run(&mut self, submitter: &UploadSubmitter, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(
            root = %self.walker.root().display(),
            tick_ms = self.tick.as_millis() as u64,
            "Watching for files"
        );

        if !self.initial_scan(submitter, &mut shutdown).await? {
            return Ok(());
        }

        while shutdown.sleep(self.tick).await {
            for (event, file) in self.observe().await? {
                if !self.should_submit(event, &file) {
                    debug!(path = %file.path.display(), ?event, "Ignoring event");
                    continue;
                }
                info!(path = %file.path.display(), ?event, "File changed");
                if !submitter
                    .submit_with_retry(&file, self.backoff, &mut shutdown)
                    .await?
                {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::FilePattern;
    use filerelay_store::{RelayDb, SqliteDeliveryQueue};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn file(path: &str, modified_ms: i64, len: u64) -> WatchedFile {
        WatchedFile {
            path: PathBuf::from(path),
            relative_path: path.trim_start_matches('/').to_string(),
            modified_ms,
            len,
        }
    }

    fn discoverer(delete_after_upload: bool) -> EventDiscoverer {
        EventDiscoverer::new(
            TreeWalker::new("/data", FilePattern::new("*").unwrap()),
            Duration::from_millis(20),
            Duration::from_millis(10),
            delete_after_upload,
        )
    }

    #[test]
    fn test_diff_reports_created_and_modified() {
        let mut d = discoverer(false);
        let first = d.diff(vec![file("/data/a", 1, 10)]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, FileEvent::Created);

        let unchanged = d.diff(vec![file("/data/a", 1, 10)]);
        assert!(unchanged.is_empty());

        let events = d.diff(vec![file("/data/a", 1, 20), file("/data/b", 5, 1)]);
        let kinds: Vec<(FileEvent, &str)> = events
            .iter()
            .map(|(e, f)| (*e, f.relative_path.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![(FileEvent::Modified, "data/a"), (FileEvent::Created, "data/b")]
        );
    }

    #[test]
    fn test_recreated_file_is_created_again() {
        let mut d = discoverer(true);
        d.diff(vec![file("/data/a", 1, 1)]);
        assert!(d.diff(vec![]).is_empty());
        let events = d.diff(vec![file("/data/a", 1, 1)]);
        assert_eq!(events[0].0, FileEvent::Created);
    }

    #[test]
    fn test_modify_ignored_when_deleting_after_upload() {
        let keep = discoverer(false);
        let delete = discoverer(true);
        let f = file("/data/a.log", 1, 1);

        assert!(keep.should_submit(FileEvent::Modified, &f));
        assert!(!delete.should_submit(FileEvent::Modified, &f));
        assert!(delete.should_submit(FileEvent::Created, &f));

        let hidden = file("/data/.a.log.swp", 1, 1);
        assert!(!keep.should_submit(FileEvent::Created, &hidden));
    }

    #[tokio::test]
    async fn test_preexisting_files_discovered_once() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.log"), "a").unwrap();
        fs::write(tmp.path().join("b.log"), "b").unwrap();

        let db = RelayDb::open_in_memory().await.unwrap();
        let queue = Arc::new(SqliteDeliveryQueue::open(db, "tasks", 100).await.unwrap());
        let submitter = UploadSubmitter::new(queue.clone(), "bucket", None);

        let mut d = EventDiscoverer::new(
            TreeWalker::new(tmp.path(), FilePattern::new("*.log").unwrap()),
            Duration::from_millis(20),
            Duration::from_millis(10),
            true,
        );
        let (trigger, shutdown) = crate::shutdown::channel();

        let run = async {
            d.run(&submitter, shutdown).await.unwrap();
        };
        let stop = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            fs::write(tmp.path().join("c.log"), "c").unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.trigger();
        };
        tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(run, stop) })
            .await
            .unwrap();

        let keys: Vec<String> = queue
            .read_tasks(0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.task.key)
            .collect();
        assert_eq!(keys, vec!["a.log", "b.log", "c.log"]);
    }
}
