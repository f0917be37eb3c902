//! Logging and tracing initialization for docker-backup.
//!
//! Structured logging via the `tracing` ecosystem, either as human readable
//! console output or as JSON for log aggregation.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

/// Configuration for the logging system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Build the filter used when `RUST_LOG` is not set.
fn default_filter(config: LogConfig) -> EnvFilter {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    EnvFilter::new(format!(
        "docker_backup={}",
        level.as_str().to_lowercase()
    ))
}

/// Initialize the tracing subscriber with the given configuration.
///
/// Call once, early in main(), after config is loaded. `RUST_LOG` overrides
/// the level derived from `verbose`. Returns an error if a global subscriber
/// is already installed.
pub fn init(config: LogConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    }
}
