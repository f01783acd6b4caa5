//! Logging setup: dual console/file tracing output via `tracing-subscriber`
//! and `tracing-appender` (spec §6 `LOG_LEVEL`/`LOG_FORMAT`).
//!
//! - Console: INFO level, concise format.
//! - File: configurable level (default DEBUG), daily-rotated.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_directory: PathBuf,
    pub log_level: Level,
    pub max_files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_directory: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("logs"),
            log_level: Level::DEBUG,
            max_files: 10,
        }
    }
}

impl LoggingConfig {
    pub fn from_level_str(log_directory: &Path, log_level: &str, max_files: u32) -> Self {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        Self { log_directory: log_directory.to_path_buf(), log_level: level, max_files }
    }
}

/// Guard that keeps the logging system alive; flushes on drop.
pub struct LogGuard {
    _file_guard: WorkerGuard,
}

/// Initializes console + file logging. Returns a guard that must be kept
/// alive for the process lifetime.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let log_dir = crate::config::expand_tilde(&config.log_directory);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory: {log_dir:?}"))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "backup-orchestrator.log");
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_span_events(FmtSpan::NONE)
        .with_filter(level_filter(config.log_level));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .with_level(true)
        .with_span_events(FmtSpan::NONE)
        .with_filter(level_filter(Level::INFO));

    tracing_subscriber::registry().with(file_layer).with(console_layer).init();

    cleanup_old_logs(&log_dir, config.max_files)?;

    Ok(LogGuard { _file_guard: file_guard })
}

/// Console-only logging for early startup before config is resolved.
pub fn init_console_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_level(true).init();
}

fn level_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("backup_orchestrator={level}")))
}

fn cleanup_old_logs(log_dir: &Path, max_files: u32) -> Result<()> {
    let mut log_files: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.starts_with("backup-orchestrator") && name.ends_with(".log")
        })
        .collect();

    log_files.sort_by(|a, b| {
        let a_time = a.metadata().and_then(|m| m.modified()).ok();
        let b_time = b.metadata().and_then(|m| m.modified()).ok();
        b_time.cmp(&a_time)
    });

    for file in log_files.into_iter().skip(max_files as usize) {
        if let Err(e) = fs::remove_file(file.path()) {
            tracing::warn!("failed to remove old log file {:?}: {e}", file.path());
        }
    }

    Ok(())
}
