//! Tracing setup.
//!
//! Errors always go to stderr. When file logging is enabled every event that
//! passes `RUST_LOG` (default `debug`) is also written to the log file, which is
//! truncated on start. Stdout carries protocol frames only and is never logged to.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use lsw_config::LogConfig;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

const DEFAULT_FILE_FILTER: &str = "debug";

/// Keeps the log file alive and lets exit paths sync it.
#[derive(Clone, Default)]
pub struct LogGuard {
    file: Option<Arc<File>>,
}

impl LogGuard {
    /// Flush the log file to disk. Safe to call more than once.
    pub fn close(&self) {
        if let Some(file) = &self.file
            && let Err(e) = file.sync_all()
        {
            eprintln!("arkts-lsw: failed to sync log file: {e}");
        }
    }
}

pub fn init(config: &LogConfig) -> LogGuard {
    let stderr_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(io::stderr)
        .with_filter(LevelFilter::ERROR);

    let (file, open_error) = if config.enabled {
        match open_log_file(&config.path) {
            Ok(file) => (Some(Arc::new(file)), None),
            Err(e) => (None, Some(e)),
        }
    } else {
        (None, None)
    };

    let file_layer = file.clone().map(|file| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_FILE_FILTER))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        fmt::layer()
            .with_ansi(false)
            .with_writer(file)
            .with_filter(env_filter)
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    if let Some(e) = open_error {
        tracing::error!(path = %config.path.display(), "Failed to open log file: {e}");
    } else if file.is_some() {
        tracing::info!(path = %config.path.display(), "Logging initialized");
    }

    LogGuard { file }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}
