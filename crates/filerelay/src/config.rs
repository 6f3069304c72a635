//! Configuration for the relay daemon

use crate::discovery::FilePattern;
use crate::error::ConfigError;
use crate::key_template::KeyTemplate;
use filerelay_logging::{level_directive, ALLOWED_LEVELS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default task stream name
pub const DEFAULT_STREAM_NAME: &str = "com.example.file_watcher.s3";

/// How FileDiscovery finds new files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Startup scan, then change notifications from an observer ticking at
    /// this interval.
    Event { tick: Duration },
    /// Full rescan at this interval, filtered by the last scan time.
    Poll { interval: Duration },
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Directory to watch (required)
    #[serde(default)]
    pub target_dir: PathBuf,

    /// Glob pattern for files to replicate
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,

    /// Destination bucket (required)
    #[serde(default)]
    pub bucket: String,

    /// Optional destination key prefix, may contain timestamp placeholders
    #[serde(default)]
    pub bucket_prefix: Option<String>,

    /// Delete local files once their upload is confirmed
    #[serde(default = "default_true")]
    pub delete_after_upload: bool,

    /// Rescan interval in seconds; 0 selects event mode
    #[serde(default)]
    pub check_interval_secs: u64,

    /// Event-mode observer tick in milliseconds
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,

    /// Highest retry count whose failure is still resubmitted
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Overrides `$FILERELAY_HOME/logs`
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Path to the SQLite database holding streams and cursors
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    /// Entries retained per stream before the oldest are overwritten
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: i64,

    /// Drop and recreate both streams at startup
    #[serde(default)]
    pub clear_stream: bool,

    #[serde(default = "default_status_read_timeout_ms")]
    pub status_read_timeout_ms: u64,

    #[serde(default = "default_status_batch_size")]
    pub status_batch_size: usize,

    /// Sleep after a queue or cursor error before retrying
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

fn default_file_pattern() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

fn default_watch_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> PathBuf {
    filerelay_logging::filerelay_home().join("filerelay.sqlite3")
}

fn default_stream_name() -> String {
    DEFAULT_STREAM_NAME.to_string()
}

fn default_queue_capacity() -> i64 {
    100_000
}

fn default_status_read_timeout_ms() -> u64 {
    1000
}

fn default_status_batch_size() -> usize {
    100
}

fn default_error_backoff_secs() -> u64 {
    3
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            target_dir: PathBuf::new(),
            file_pattern: default_file_pattern(),
            bucket: String::new(),
            bucket_prefix: None,
            delete_after_upload: true,
            check_interval_secs: 0,
            watch_interval_ms: default_watch_interval_ms(),
            max_retries: default_max_retries(),
            log_level: default_log_level(),
            log_dir: None,
            database_path: default_database_path(),
            stream_name: default_stream_name(),
            queue_capacity: default_queue_capacity(),
            clear_stream: false,
            status_read_timeout_ms: default_status_read_timeout_ms(),
            status_batch_size: default_status_batch_size(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Check every value and make `target_dir` absolute.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.target_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("target_dir", "is required"));
        }
        if self.target_dir.is_relative() {
            let cwd = std::env::current_dir()
                .map_err(|e| ConfigError::invalid("target_dir", e.to_string()))?;
            self.target_dir = cwd.join(&self.target_dir);
        }
        if !self.target_dir.is_dir() {
            return Err(ConfigError::invalid(
                "target_dir",
                format!("{} is not a directory", self.target_dir.display()),
            ));
        }

        if self.bucket.trim().is_empty() {
            return Err(ConfigError::invalid("bucket", "is required"));
        }
        self.file_pattern()?;
        self.key_template()?;

        if level_directive(&self.log_level).is_none() {
            return Err(ConfigError::invalid(
                "log_level",
                format!("'{}' is not one of {}", self.log_level, ALLOWED_LEVELS.join(", ")),
            ));
        }
        if self.watch_interval_ms == 0 {
            return Err(ConfigError::invalid("watch_interval_ms", "must be greater than 0"));
        }
        if self.queue_capacity <= 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be greater than 0"));
        }
        if self.status_batch_size == 0 {
            return Err(ConfigError::invalid("status_batch_size", "must be greater than 0"));
        }
        if self.stream_name.trim().is_empty() {
            return Err(ConfigError::invalid("stream_name", "must not be empty"));
        }

        Ok(())
    }

    pub fn file_pattern(&self) -> Result<FilePattern, ConfigError> {
        FilePattern::new(&self.file_pattern)
            .map_err(|e| ConfigError::invalid("file_pattern", e.to_string()))
    }

    /// Parsed key prefix; `None` when no non-empty prefix is configured.
    pub fn key_template(&self) -> Result<Option<KeyTemplate>, ConfigError> {
        match self.bucket_prefix.as_deref().map(str::trim) {
            Some(prefix) if !prefix.is_empty() => KeyTemplate::parse(prefix)
                .map(Some)
                .map_err(|e| ConfigError::invalid("bucket_prefix", e.to_string())),
            _ => Ok(None),
        }
    }

    pub fn discovery_mode(&self) -> DiscoveryMode {
        if self.check_interval_secs == 0 {
            DiscoveryMode::Event {
                tick: Duration::from_millis(self.watch_interval_ms),
            }
        } else {
            DiscoveryMode::Poll {
                interval: Duration::from_secs(self.check_interval_secs),
            }
        }
    }

    pub fn status_read_timeout(&self) -> Duration {
        Duration::from_millis(self.status_read_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}
