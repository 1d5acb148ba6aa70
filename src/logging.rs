//! Logging setup: console plus a per-run log file.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// Console output goes to stderr so stdout stays clean for command output.
/// Returns the log file path, or `None` when the file could not be created;
/// console logging works either way.
pub fn init(config: &LoggingConfig, binary: &str) -> Option<PathBuf> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|e| {
        eprintln!("Warning: Invalid log level '{}': {}", config.level, e);
        EnvFilter::new("info")
    });

    let (file_layer, log_path) = match open_log_file(&config.log_dir, binary, Local::now()) {
        Ok((file, path)) => {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        Err(e) => {
            eprintln!("Warning: Could not create log file: {:#}", e);
            (None, None)
        }
    };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("Warning: Logging already initialized: {}", e);
        return None;
    }

    if let Some(path) = &log_path {
        info!("File logging initialized: {}", path.display());
    }
    log_path
}

/// `<log_dir>/<binary>_<YYYYmmdd_HHMMSS>.log`
pub fn log_file_path(log_dir: &Path, binary: &str, started: DateTime<Local>) -> PathBuf {
    log_dir.join(format!("{}_{}.log", binary, started.format("%Y%m%d_%H%M%S")))
}

fn open_log_file(log_dir: &Path, binary: &str, started: DateTime<Local>) -> Result<(File, PathBuf)> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let path = log_file_path(log_dir, binary, started);
    let file = File::options()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    Ok((file, path))
}
