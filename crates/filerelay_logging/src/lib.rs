//! Shared logging setup for filerelay binaries.
//!
//! Logs go to a daily-rolled file under `$FILERELAY_HOME/logs` and to stderr.
//! `RUST_LOG` overrides the level taken from configuration.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Levels accepted in configuration files.
pub const ALLOWED_LEVELS: &[&str] = &["debug", "info", "warn", "error", "critical"];

/// Logging configuration shared by filerelay binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// One of [`ALLOWED_LEVELS`].
    pub level: &'a str,
    /// Overrides the default `$FILERELAY_HOME/logs` directory.
    pub log_dir: Option<PathBuf>,
}

/// Map a configured level name onto a tracing directive.
///
/// `critical` has no tracing equivalent and is treated as `error`.
pub fn level_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" => Some("error"),
        _ => None,
    }
}

/// Build the default filter for a configured level.
pub fn default_filter(level: &str) -> String {
    let directive = level_directive(level).unwrap_or("info");
    format!(
        "filerelay={d},filerelay_store={d},filerelay_logging={d}",
        d = directive
    )
}

/// Initialize tracing with a daily rolling file and stderr output.
///
/// The file writer runs on a background thread; keep the returned guard
/// alive until exit so buffered lines are flushed.
pub fn init_logging(config: LogConfig<'_>) -> Result<WorkerGuard> {
    let log_dir = resolve_log_dir(config.log_dir)?;
    let file_appender =
        tracing_appender::rolling::daily(log_dir, format!("{}.log", config.app_name));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.level)));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(filter.clone()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Create and return the configured log directory, or the default one.
pub fn resolve_log_dir(log_dir: Option<PathBuf>) -> Result<PathBuf> {
    match log_dir {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            Ok(dir)
        }
        None => ensure_logs_dir(),
    }
}

/// Get the filerelay home directory: ~/.filerelay
pub fn filerelay_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("FILERELAY_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|home| home.join(".filerelay"))
        .unwrap_or_else(|| PathBuf::from(".filerelay"))
}

/// Get the logs directory: ~/.filerelay/logs
pub fn logs_dir() -> PathBuf {
    filerelay_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}
