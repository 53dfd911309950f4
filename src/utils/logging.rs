//! # Logging
//!
//! Installs the global `tracing` subscriber from a [`LoggingConfig`].
//!
//! `RUST_LOG` takes precedence over the configured level when set. Console and
//! file output can be enabled independently, each as plain text or JSON.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Build the env filter, falling back to the configured level
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()))
}

/// Install the global subscriber
///
/// # Errors
/// Fails if the log file cannot be opened or a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let console = config.log_to_console;
    let json = config.json_format;

    let console_plain = (console && !json).then(|| fmt::layer().with_target(true));
    let console_json = (console && json).then(|| fmt::layer().json());

    let file = match (&config.log_file_path, config.log_to_file) {
        (Some(path), true) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}"))
                })?,
        ),
        (None, true) => {
            return Err(ProtocolError::ConfigError(
                "log_file_path must be specified when log_to_file is true".to_string(),
            ))
        }
        _ => None,
    };

    let (file_plain, file_json) = match file {
        Some(file) if json => (
            None,
            Some(fmt::layer().json().with_writer(Mutex::new(file))),
        ),
        Some(file) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        None => (None, None),
    };

    Registry::default()
        .with(build_filter(config))
        .with(console_plain)
        .with(console_json)
        .with(file_plain)
        .with(file_json)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install subscriber: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
