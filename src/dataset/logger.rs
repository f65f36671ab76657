//! Structured logging for the dataset pipeline
//!
//! Terminal output plus an optional daily-rolling log file, both driven by
//! `tracing`. The returned guard must be kept alive for the file writer to flush.

use std::fs;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::dataset::LoggingConfig;

/// Name of the rolling log file.
pub const LOG_FILE_NAME: &str = "booru_dataset.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `log_level` when set.
pub fn init_logger(config: &LoggingConfig) -> LoggerResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    let terminal_layer = fmt::layer().with_target(false).boxed();

    let (file_layer, guard) = if config.log_to_file {
        if !config.log_directory.exists() {
            fs::create_dir_all(&config.log_directory)?;
        }

        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_directory, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer = match config.log_format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(non_blocking)
                .boxed(),
            _ => fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .boxed(),
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(terminal_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %config.log_format,
        log_level = %config.log_level,
        log_to_file = config.log_to_file,
        "Logger initialized"
    );

    Ok(guard)
}
