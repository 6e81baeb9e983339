//! Structured logging setup.
//!
//! All components log through `tracing` with structured fields. Filtering by
//! component uses the targets in [`targets`]:
//!
//! | Target | Description |
//! |--------|-------------|
//! | `betfair_gate::dispatch` | Foreground call lifecycle |
//! | `betfair_gate::rate_limit` | Permit grants, limiter creation and sweep |
//! | `betfair_gate::retry` | Classification and backoff decisions |
//! | `betfair_gate::session` | Login, keep-alive, expiry and logout |
//!
//! ```bash
//! RUST_LOG=warn,betfair_gate::session=debug betfair_gate check
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable format with colors
    #[default]
    Pretty,
    /// JSON (for log aggregation)
    Json,
    /// Compact single-line format
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,

    /// Format for stdout logging
    #[serde(default)]
    pub stdout_format: LogFormat,

    /// Write a daily-rotated JSON log under `log_dir`
    #[serde(default)]
    pub enable_file: bool,

    /// Directory for rotated log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            stdout_format: LogFormat::default(),
            enable_file: false,
            log_dir: default_log_dir(),
        }
    }
}

impl LogConfig {
    /// Pretty stdout, no files.
    pub fn development() -> Self {
        Self::default()
    }

    /// JSON stdout plus rotated JSON files.
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            stdout_format: LogFormat::Json,
            enable_file: true,
            log_dir,
            ..Default::default()
        }
    }
}

fn base_filter(config: &LogConfig, env_filter_override: Option<&str>) -> EnvFilter {
    if let Some(filter) = env_filter_override {
        return EnvFilter::new(filter);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,reqwest=warn", config.level))
    })
}

/// Initialize logging based on configuration.
///
/// Returns the `WorkerGuard`s of any non-blocking writers; keep them alive
/// for the duration of the program so buffered lines are flushed.
pub fn init_logging(
    config: &LogConfig,
    env_filter_override: Option<&str>,
) -> Result<Vec<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let mut guards = Vec::new();
    let filter = base_filter(config, env_filter_override);

    if config.enable_file {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "gate.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .json()
            .with_filter(base_filter(config, env_filter_override));

        match config.stdout_format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(file_layer)
                .with(fmt::layer().json().with_filter(filter))
                .try_init()?,
            LogFormat::Compact => tracing_subscriber::registry()
                .with(file_layer)
                .with(fmt::layer().compact().with_filter(filter))
                .try_init()?,
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(file_layer)
                .with(fmt::layer().with_target(true).with_filter(filter))
                .try_init()?,
        }
    } else {
        match config.stdout_format {
            LogFormat::Json => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .try_init()?,
            LogFormat::Compact => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .compact()
                .try_init()?,
            LogFormat::Pretty => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .try_init()?,
        }
    }

    Ok(guards)
}

/// Log target constants for component-specific logging.
pub mod targets {
    /// Foreground call lifecycle
    pub const DISPATCH: &str = "betfair_gate::dispatch";
    /// Rate limiter registry
    pub const RATE_LIMIT: &str = "betfair_gate::rate_limit";
    /// Error classification and retry
    pub const RETRY: &str = "betfair_gate::retry";
    /// Session lifecycle
    pub const SESSION: &str = "betfair_gate::session";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert!(!config.enable_file);
        assert_eq!(config.level, "info");
        assert_eq!(config.stdout_format, LogFormat::Pretty);
    }

    #[test]
    fn test_log_config_production() {
        let config = LogConfig::production(PathBuf::from("/var/log/gate"));
        assert!(config.enable_file);
        assert_eq!(config.stdout_format, LogFormat::Json);
        assert_eq!(config.log_dir, PathBuf::from("/var/log/gate"));
    }

    #[test]
    fn test_log_format_serde() {
        let json = serde_json::to_string(&LogFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");

        let parsed: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(parsed, LogFormat::Compact);
    }

    #[test]
    fn test_second_init_reports_error() {
        let config = LogConfig::default();
        // The first call may lose to another test's subscriber; the second
        // always finds one installed.
        let _ = init_logging(&config, Some("warn"));
        let err = init_logging(&config, Some("warn")).unwrap_err();

        let handle = std::thread::spawn(move || err.to_string());
        assert!(!handle.join().unwrap().is_empty());
    }
}
