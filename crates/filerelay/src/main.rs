//! filerelay daemon
//!
//! Watches a directory and replicates matching files to object storage
//! through the durable delivery queue.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filerelay::shutdown::{self, install_signal_handlers};
use filerelay::{RelayConfig, RelayService};
use filerelay_logging::LogConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "filerelay", about = "Replicate files from a directory to object storage")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "FILERELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Values that take precedence over the configuration file.
#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// Directory to watch
    #[arg(long, global = true, env = "FILERELAY_TARGET_DIR")]
    target_dir: Option<PathBuf>,

    /// Destination bucket
    #[arg(long, global = true, env = "FILERELAY_BUCKET")]
    bucket: Option<String>,

    /// Glob pattern for files to replicate
    #[arg(long, global = true, env = "FILERELAY_FILE_PATTERN")]
    file_pattern: Option<String>,

    /// Destination key prefix, may contain !{Y} !{M} !{D} !{H} !{m}
    #[arg(long, global = true, env = "FILERELAY_BUCKET_PREFIX")]
    bucket_prefix: Option<String>,

    /// Rescan interval in seconds; 0 watches for changes instead
    #[arg(long, global = true, env = "FILERELAY_CHECK_INTERVAL")]
    check_interval_secs: Option<u64>,

    /// Keep local files after a confirmed upload
    #[arg(long, global = true)]
    keep_files: bool,

    #[arg(long, global = true, env = "FILERELAY_DATABASE")]
    database_path: Option<PathBuf>,

    /// debug, info, warn, error or critical
    #[arg(long, global = true, env = "FILERELAY_LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long, global = true, env = "FILERELAY_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run discovery and reconciliation until interrupted (default)
    Run {
        /// Drop and recreate the delivery streams before starting
        #[arg(long)]
        clear_stream: bool,
    },

    /// Show cursors and queue occupancy
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drop and recreate the delivery streams and reset the ack cursor
    Clear,
}

impl Overrides {
    fn apply(self, config: &mut RelayConfig) {
        if let Some(dir) = self.target_dir {
            config.target_dir = dir;
        }
        if let Some(bucket) = self.bucket {
            config.bucket = bucket;
        }
        if let Some(pattern) = self.file_pattern {
            config.file_pattern = pattern;
        }
        if let Some(prefix) = self.bucket_prefix {
            config.bucket_prefix = Some(prefix);
        }
        if let Some(interval) = self.check_interval_secs {
            config.check_interval_secs = interval;
        }
        if self.keep_files {
            config.delete_after_upload = false;
        }
        if let Some(path) = self.database_path {
            config.database_path = path;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = Some(dir);
        }
    }
}

fn load_config(path: Option<&PathBuf>, overrides: Overrides) -> Result<RelayConfig> {
    let mut config = match path {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run_command(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_ref(), cli.overrides)?;
    let command = cli.command.unwrap_or(Commands::Run {
        clear_stream: false,
    });
    if let Commands::Run { clear_stream: true } = command {
        config.clear_stream = true;
    }

    let _log_guard = filerelay_logging::init_logging(LogConfig {
        app_name: "filerelay",
        level: &config.log_level,
        log_dir: config.log_dir.clone(),
    })?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    rt.block_on(async move {
        match command {
            Commands::Run { .. } => run_relay(config).await,
            Commands::Status { json } => show_status(config, json).await,
            Commands::Clear => {
                let service = RelayService::open(config).await?;
                service.clear().await?;
                println!("Delivery streams cleared");
                Ok(())
            }
        }
    })
}

async fn run_relay(config: RelayConfig) -> Result<()> {
    info!("Starting filerelay");
    info!("  Target: {}", config.target_dir.display());
    info!("  Pattern: {}", config.file_pattern);
    info!("  Bucket: {}", config.bucket);
    if let Some(prefix) = &config.bucket_prefix {
        info!("  Prefix: {}", prefix);
    }
    info!("  Delete after upload: {}", config.delete_after_upload);
    info!("  Database: {}", config.database_path.display());

    let (trigger, _signal) = shutdown::channel();
    install_signal_handlers(trigger.clone()).context("Failed to install signal handlers")?;

    let service = RelayService::open(config)
        .await
        .context("Failed to open delivery queue")?;
    service.run(trigger).await?;
    Ok(())
}

async fn show_status(config: RelayConfig, json: bool) -> Result<()> {
    let service = RelayService::open(config).await?;
    let status = service.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let fmt_seq = |seq: Option<i64>| seq.map_or_else(|| "-".to_string(), |s| s.to_string());
    println!("Stream:            {}", service.config().stream_name);
    println!(
        "Tasks:             {} retained ({}..{})",
        status.stats.tasks.entries,
        fmt_seq(status.stats.tasks.oldest_sequence_number),
        fmt_seq(status.stats.tasks.newest_sequence_number)
    );
    println!(
        "Statuses:          {} retained ({}..{})",
        status.stats.statuses.entries,
        fmt_seq(status.stats.statuses.oldest_sequence_number),
        fmt_seq(status.stats.statuses.newest_sequence_number)
    );
    println!("Next status to ack: {}", status.cursor.next_ack_sequence_number);
    println!("Last scan (ms):    {}", status.cursor.last_scan_timestamp);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}
