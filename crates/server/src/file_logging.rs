//! Logging setup: console output plus optional JSON file logging.
//!
//! # Configuration
//!
//! - `STORAGE_FILE_LOGGING`: "true" or "1" writes JSON lines to daily files as well
//! - `STORAGE_LOG_DIR`: directory for those files (default: `logs`)
//! - `STORAGE_LOG_MAX_FILES`: daily files kept on startup (default: 7)
//!
//! A file line looks like:
//! ```json
//! {"timestamp":"2026-10-19T10:30:00Z","level":"INFO","target":"storage::guard","fields":{"message":"Storage mode changed","tenant_id":"org-42"}}
//! ```

use std::{
    io,
    path::{Path, PathBuf},
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "storage-server.log";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_MAX_FILES: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLoggingConfig {
    pub log_dir: PathBuf,
    pub max_files: usize,
}

impl FileLoggingConfig {
    /// `None` unless file logging is switched on.
    pub fn from_env() -> Option<Self> {
        let enabled = std::env::var("STORAGE_FILE_LOGGING")
            .is_ok_and(|v| matches!(v.trim(), "true" | "1"));
        if !enabled {
            return None;
        }

        Some(Self {
            log_dir: std::env::var("STORAGE_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR)),
            max_files: std::env::var("STORAGE_LOG_MAX_FILES")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_MAX_FILES),
        })
    }
}

/// Our crates at `log_level`, everything else at warn.
fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(format!(
        "warn,server={log_level},storage={log_level},tower_http={log_level}"
    ))
    .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Hold the returned guard until exit so
/// buffered file output is flushed.
pub fn init_logging(log_level: &str) -> Option<WorkerGuard> {
    let file_config = FileLoggingConfig::from_env().filter(|config| {
        std::fs::create_dir_all(&config.log_dir)
            .inspect_err(|e| eprintln!("Cannot create log directory {:?}: {e}", config.log_dir))
            .is_ok()
    });

    let (file_layer, guard) = match &file_config {
        Some(config) => {
            let appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter(log_level));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter(log_level)))
        .with(file_layer)
        .init();

    if let Some(config) = file_config {
        tracing::info!(log_dir = ?config.log_dir, max_files = config.max_files, "File logging enabled");
        std::thread::spawn(move || match prune_logs(&config.log_dir, config.max_files) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Pruned old log files"),
            Err(e) => tracing::warn!(error = %e, "Failed to prune old log files"),
        });
    }

    guard
}

/// Delete all but the `keep` most recently modified log files in `log_dir`.
/// Returns how many were deleted.
pub fn prune_logs(log_dir: &Path, keep: usize) -> io::Result<usize> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        files.push((entry.metadata()?.modified()?, entry.path()));
    }

    files.sort_by(|a, b| b.0.cmp(&a.0));
    let mut removed = 0;
    for (_, path) in files.into_iter().skip(keep) {
        std::fs::remove_file(&path)?;
        removed += 1;
    }
    Ok(removed)
}
