//! Turns discovered files into delivery tasks.

use crate::discovery::WatchedFile;
use crate::error::Result;
use crate::key_template::{destination_key, KeyTemplate};
use crate::shutdown::ShutdownSignal;
use filerelay_store::{DeliveryQueue, DeliveryTask};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct UploadSubmitter {
    queue: Arc<dyn DeliveryQueue>,
    bucket: String,
    key_template: Option<KeyTemplate>,
}

impl UploadSubmitter {
    pub fn new(queue: Arc<dyn DeliveryQueue>, bucket: impl Into<String>, key_template: Option<KeyTemplate>) -> Self {
        Self {
            queue,
            bucket: bucket.into(),
            key_template,
        }
    }

    /// Build the delivery task for a file.
    pub fn task_for(&self, file: &WatchedFile) -> DeliveryTask {
        let key = destination_key(self.key_template.as_ref(), &file.relative_path, file.file_name());
        DeliveryTask::new(file.path.clone(), self.bucket.clone(), key)
    }

    /// Append a delivery task for `file` and return its sequence number.
    pub async fn submit(&self, file: &WatchedFile) -> Result<i64> {
        let task = self.task_for(file);
        let sequence_number = self.queue.append(&task).await?;
        info!(
            path = %file.path.display(),
            key = %task.key,
            sequence_number,
            "File queued for upload"
        );
        Ok(sequence_number)
    }

    /// Submit, retrying transient queue errors after `backoff` until the
    /// file is queued or shutdown is requested.
    ///
    /// Returns `false` if shutdown interrupted the retries.
    pub async fn submit_with_retry(
        &self,
        file: &WatchedFile,
        backoff: Duration,
        shutdown: &mut ShutdownSignal,
    ) -> Result<bool> {
        loop {
            match self.submit(file).await {
                Ok(_) => return Ok(true),
                Err(err) if err.is_transient() => {
                    warn!(
                        path = %file.path.display(),
                        error = %err,
                        "Failed to queue file, retrying in {:?}",
                        backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.wait() => return Ok(false),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyQueue;
    use filerelay_store::{RelayDb, SqliteDeliveryQueue};
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn watched(relative: &str) -> WatchedFile {
        WatchedFile {
            path: PathBuf::from("/data").join(relative),
            relative_path: relative.to_string(),
            modified_ms: 0,
            len: 0,
        }
    }

    async fn queue() -> Arc<SqliteDeliveryQueue> {
        let db = RelayDb::open_in_memory().await.unwrap();
        Arc::new(SqliteDeliveryQueue::open(db, "tasks", 100).await.unwrap())
    }

    #[tokio::test]
    async fn test_submit_appends_task_with_relative_key() {
        let queue = queue().await;
        let submitter = UploadSubmitter::new(queue.clone(), "edge-archive", None);

        let seq = submitter.submit(&watched("line1/a.csv")).await.unwrap();
        assert_eq!(seq, 0);

        let entries = queue.read_tasks(0, 10).await.unwrap();
        assert_eq!(entries[0].task.key, "line1/a.csv");
        assert_eq!(entries[0].task.bucket, "edge-archive");
        assert_eq!(entries[0].task.retry_count, 0);
        assert_eq!(entries[0].task.local_path, PathBuf::from("/data/line1/a.csv"));
    }

    #[tokio::test]
    async fn test_submit_renders_prefix_from_file_name() {
        let queue = queue().await;
        let template = KeyTemplate::parse("!{Y}/!{M}").unwrap();
        let submitter = UploadSubmitter::new(queue.clone(), "b", Some(template));

        let task = submitter.task_for(&watched("report.2024-03.csv"));
        assert_eq!(task.key, "2024/03/report.2024-03.csv");
    }

    #[tokio::test]
    async fn test_submit_keeps_walk_order() {
        let queue = queue().await;
        let submitter = UploadSubmitter::new(queue.clone(), "b", None);
        let (_trigger, mut shutdown) = crate::shutdown::channel();

        for name in ["a", "b", "c"] {
            assert!(submitter
                .submit_with_retry(&watched(name), Duration::from_millis(1), &mut shutdown)
                .await
                .unwrap());
        }

        let keys: Vec<String> = queue
            .read_tasks(0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.task.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_submit_retries_transient_queue_errors() {
        let queue = queue().await;
        let flaky = Arc::new(FlakyQueue::new((*queue).clone()).fail_appends(3));
        let submitter = UploadSubmitter::new(flaky.clone(), "b", None);
        let (_trigger, mut shutdown) = crate::shutdown::channel();

        let queued = submitter
            .submit_with_retry(&watched("a.csv"), Duration::from_millis(1), &mut shutdown)
            .await
            .unwrap();

        assert!(queued);
        assert_eq!(flaky.append_calls.load(Ordering::SeqCst), 4);
        let entries = queue.read_tasks(0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task.key, "a.csv");
    }

    #[tokio::test]
    async fn test_submit_retry_gives_up_on_shutdown() {
        let queue = queue().await;
        let flaky = Arc::new(FlakyQueue::new((*queue).clone()).fail_appends(usize::MAX));
        let submitter = UploadSubmitter::new(flaky, "b", None);
        let (trigger, mut shutdown) = crate::shutdown::channel();
        let stopper = trigger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.trigger();
        });

        let queued = tokio::time::timeout(
            Duration::from_secs(10),
            submitter.submit_with_retry(&watched("a.csv"), Duration::from_millis(5), &mut shutdown),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(!queued);
        assert!(queue.read_tasks(0, 10).await.unwrap().is_empty());
    }
}
