//! Logging via the tracing crate.

use std::io;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Logging configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Output format for log.
    format: LoggingFormat,
}

/// Logging output format.
///
/// Defaults to "text".
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum LoggingFormat {
    /// Text format.
    Text,
    /// JSON format.
    Json,
}

impl Default for LoggingFormat {
    fn default() -> Self {
        LoggingFormat::Text
    }
}

/// Initializes the logging system with the default parameters.
///
/// See `init_with_config` for details.
pub fn init() -> anyhow::Result<()> {
    init_with_config(&Default::default())
}

/// Initializes the logging system.
///
/// This function should only be called once during the lifetime of the application. Do not call
/// this outside of the application or testing code, the installed logger is global.
///
/// The filter is read from the `RUST_LOG` environment variable.
pub fn init_with_config(config: &LoggingConfig) -> anyhow::Result<()> {
    match config.format {
        // Setup a new tracing-subscriber writing to `stdout` for logging.
        LoggingFormat::Text => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_writer(io::stdout)
                .with_env_filter(EnvFilter::from_default_env())
                .finish(),
        )?,
        // JSON logging writes to `stdout` as well but uses the JSON format.
        LoggingFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_writer(io::stdout)
                .with_env_filter(EnvFilter::from_default_env())
                .json()
                .finish(),
        )?,
    }

    Ok(())
}
