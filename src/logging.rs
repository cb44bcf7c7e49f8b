use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,
    /// Log format (compact, pretty)
    pub format: String,
    /// Include timestamps
    pub include_timestamps: bool,
    /// Include thread names
    pub include_thread_names: bool,
    /// Include source file and line numbers
    pub include_line_numbers: bool,
}

pub const LOG_FORMATS: &[&str] = &["compact", "pretty"];

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            include_timestamps: true,
            include_thread_names: false,
            include_line_numbers: false,
        }
    }
}

impl LoggingConfig {
    /// Verbose configuration for protocol debugging; logs every packet.
    pub fn development() -> Self {
        Self {
            level: "adbd_client=trace".to_string(),
            format: "pretty".to_string(),
            include_timestamps: true,
            include_thread_names: true,
            include_line_numbers: true,
        }
    }
}

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context(format!("Invalid log filter: {}", config.level))?;

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(config.include_line_numbers)
        .with_thread_names(config.include_thread_names)
        .with_line_number(config.include_line_numbers)
        .with_file(config.include_line_numbers);

    let result = match (config.format.as_str(), config.include_timestamps) {
        ("pretty", true) => tracing::subscriber::set_global_default(builder.pretty().finish()),
        ("pretty", false) => {
            tracing::subscriber::set_global_default(builder.pretty().without_time().finish())
        }
        (_, true) => tracing::subscriber::set_global_default(builder.compact().finish()),
        (_, false) => {
            tracing::subscriber::set_global_default(builder.compact().without_time().finish())
        }
    };
    result.context("Failed to set global tracing subscriber")?;

    tracing::info!("Structured logging initialized with level: {}", config.level);
    Ok(())
}
