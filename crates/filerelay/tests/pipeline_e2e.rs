//! End-to-end runs of the relay against a simulated upload engine.
//!
//! The engine side reads tasks and reports statuses straight through
//! `SqliteDeliveryQueue`, the same way a real engine consumes the streams.

use filerelay::cursor::load_ack_cursor;
use filerelay::{RelayConfig, RelayService, ShutdownTrigger};
use filerelay_store::{DeliveryOutcome, QueueEntry, SqliteDeliveryQueue, SqliteShadowStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);

struct TestEnv {
    tmp: TempDir,
}

impl TestEnv {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("watched")).unwrap();
        Self { tmp }
    }

    fn watched(&self) -> PathBuf {
        self.tmp.path().join("watched")
    }

    fn write(&self, relative: &str) -> PathBuf {
        let path = self.watched().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, relative).unwrap();
        path
    }

    fn config(&self) -> RelayConfig {
        let mut config = RelayConfig {
            target_dir: self.watched(),
            file_pattern: "*.log".to_string(),
            bucket: "archive".to_string(),
            bucket_prefix: Some("edge/!{Y}/!{M}".to_string()),
            watch_interval_ms: 50,
            max_retries: 2,
            database_path: self.tmp.path().join("relay.sqlite3"),
            status_read_timeout_ms: 100,
            error_backoff_secs: 0,
            ..RelayConfig::default()
        };
        config.validate().unwrap();
        config
    }

    async fn start(&self, config: RelayConfig) -> Running {
        let service = RelayService::open(config).await.unwrap();
        let queue = service.queue();
        let shadows = service.shadows();
        let (trigger, _) = filerelay::shutdown::channel();
        let handle = tokio::spawn(service.run(trigger.clone()));
        Running {
            queue,
            shadows,
            trigger,
            handle,
        }
    }
}

struct Running {
    queue: Arc<SqliteDeliveryQueue>,
    shadows: Arc<SqliteShadowStore>,
    trigger: ShutdownTrigger,
    handle: JoinHandle<filerelay::Result<()>>,
}

impl Running {
    /// Wait until the task log holds at least `count` entries from `from`.
    async fn tasks(&self, from: i64, count: usize) -> Vec<QueueEntry> {
        tokio::time::timeout(WAIT, async {
            loop {
                let entries = self.queue.read_tasks(from, 100).await.unwrap();
                if entries.len() >= count {
                    return entries;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("tasks were not queued in time")
    }

    async fn report(&self, entry: &QueueEntry, outcome: DeliveryOutcome, message: &str) {
        self.queue
            .report_status(entry.sequence_number, &entry.task, outcome, message)
            .await
            .unwrap();
    }

    /// Wait until the reconciler has acknowledged every status before `next`.
    async fn acked(&self, next: i64) {
        tokio::time::timeout(WAIT, async {
            while load_ack_cursor(self.shadows.as_ref()).await.unwrap() < next {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("statuses were not acknowledged in time");
    }

    async fn stop(self) {
        self.trigger.trigger();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("relay did not stop in time")
            .unwrap()
            .unwrap();
    }
}

async fn wait_for_removal(path: &Path) {
    tokio::time::timeout(WAIT, async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("file was not deleted in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uploaded_files_are_deleted_and_cursor_persisted() {
    let env = TestEnv::new();
    let a = env.write("a.log");
    let b = env.write("nested/b.log");
    let ignored = env.write("notes.txt");

    let running = env.start(env.config()).await;
    let tasks = running.tasks(0, 2).await;

    let keys: Vec<&str> = tasks.iter().map(|e| e.task.key.as_str()).collect();
    assert_eq!(keys, vec!["edge/!{Y}/!{M}/a.log", "edge/!{Y}/!{M}/nested/b.log"]);
    assert!(tasks.iter().all(|e| e.task.bucket == "archive" && e.task.retry_count == 0));

    for entry in &tasks {
        running.report(entry, DeliveryOutcome::InProgress, "").await;
        running.report(entry, DeliveryOutcome::Success, "").await;
    }
    wait_for_removal(&a).await;
    wait_for_removal(&b).await;
    running.acked(4).await;
    running.stop().await;

    assert!(ignored.exists());

    let service = RelayService::open(env.config()).await.unwrap();
    let status = service.status().await.unwrap();
    assert_eq!(status.cursor.next_ack_sequence_number, 4);
    assert_eq!(status.latest_task_sequence_number, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_upload_is_resubmitted_until_success() {
    let env = TestEnv::new();
    let path = env.write("2024-03-15_08-30.log");

    let running = env.start(env.config()).await;
    let first = running.tasks(0, 1).await.remove(0);
    assert_eq!(first.task.key, "edge/2024/03/2024-03-15_08-30.log");

    running.report(&first, DeliveryOutcome::Failure, "connection reset").await;
    let retry = running.tasks(1, 1).await.remove(0);
    assert_eq!(retry.sequence_number, 1);
    assert_eq!(retry.task.retry_count, 1);
    assert_eq!(retry.task.key, first.task.key);
    assert!(path.exists());

    running.report(&retry, DeliveryOutcome::Success, "").await;
    wait_for_removal(&path).await;
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_keep_the_file() {
    let env = TestEnv::new();
    let path = env.write("stuck.log");

    let running = env.start(env.config()).await;
    let mut entry = running.tasks(0, 1).await.remove(0);
    // Failures reported at retry counts 0 through max_retries are resubmitted
    for expected_retry in 1..=3 {
        running.report(&entry, DeliveryOutcome::Failure, "denied").await;
        entry = running.tasks(entry.sequence_number + 1, 1).await.remove(0);
        assert_eq!(entry.task.retry_count, expected_retry);
    }
    running.report(&entry, DeliveryOutcome::Failure, "denied").await;

    // The failure past the bound is acknowledged without another resubmission
    running.acked(4).await;
    assert_eq!(running.queue.read_tasks(0, 100).await.unwrap().len(), 4);
    running.stop().await;

    assert!(path.exists());
    let service = RelayService::open(env.config()).await.unwrap();
    let status = service.status().await.unwrap();
    assert_eq!(status.cursor.next_ack_sequence_number, 4);
    assert_eq!(status.latest_task_sequence_number, Some(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_resumes_from_persisted_cursor() {
    let env = TestEnv::new();
    let a = env.write("a.log");

    let running = env.start(env.config()).await;
    let task = running.tasks(0, 1).await.remove(0);
    running.report(&task, DeliveryOutcome::Success, "").await;
    wait_for_removal(&a).await;
    running.acked(1).await;
    running.stop().await;

    // Only the file the first run never saw is queued
    let b = env.write("b.log");
    let running = env.start(env.config()).await;
    let tasks = running.tasks(1, 1).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task.key, "edge/!{Y}/!{M}/b.log");

    running.report(&tasks[0], DeliveryOutcome::Success, "").await;
    wait_for_removal(&b).await;
    running.acked(2).await;
    running.stop().await;

    let service = RelayService::open(env.config()).await.unwrap();
    assert_eq!(service.status().await.unwrap().cursor.next_ack_sequence_number, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_stream_only_applies_when_running() {
    let env = TestEnv::new();
    env.write("a.log");

    let mut config = env.config();
    config.delete_after_upload = false;
    let running = env.start(config.clone()).await;
    let task = running.tasks(0, 1).await.remove(0);
    running.report(&task, DeliveryOutcome::Success, "").await;
    running.acked(1).await;
    running.stop().await;

    // Opening for status leaves everything in place
    config.clear_stream = true;
    let service = RelayService::open(config.clone()).await.unwrap();
    let status = service.status().await.unwrap();
    assert_eq!(status.cursor.next_ack_sequence_number, 1);
    assert_eq!(status.stats.tasks.entries, 1);
    assert_eq!(status.stats.statuses.entries, 1);
    drop(service);

    // Running clears, then the startup scan queues the kept file again
    let running = env.start(config).await;
    tokio::time::timeout(WAIT, async {
        loop {
            let stats = running.queue.stats().await.unwrap();
            if stats.statuses.entries == 0 && stats.tasks.entries == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("streams were not cleared in time");
    assert_eq!(load_ack_cursor(running.shadows.as_ref()).await.unwrap(), 0);
    assert_eq!(running.queue.read_tasks(0, 10).await.unwrap()[0].sequence_number, 0);
    running.stop().await;
}
