//! Logging bootstrap for shardwright binaries.

use crate::{Error, Result};

use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }

    /// Read `SHARDWRIGHT_LOG_FORMAT` (default: json).
    pub fn from_env() -> Result<Self> {
        match std::env::var("SHARDWRIGHT_LOG_FORMAT") {
            Ok(raw) => parse_log_format(&raw),
            Err(_) => Ok(LogFormat::Json),
        }
    }
}

/// Installed subscriber settings.
#[derive(Debug, Clone)]
pub struct Telemetry {
    service_name: String,
    format: LogFormat,
}

impl Telemetry {
    /// Install the global tracing subscriber for a binary.
    ///
    /// `RUST_LOG` takes precedence over `log_level` when set.
    pub fn init(service_name: &str, log_level: &str) -> Result<Self> {
        let level = parse_log_level(log_level)?;
        let format = LogFormat::from_env()?;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

        let builder = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true);
        let installed = match format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        installed.map_err(|e| {
            Error::Config(format!("failed to initialize tracing subscriber: {e}"))
        })?;

        info!(
            service_name,
            log_format = format.as_str(),
            log_level = %level,
            "Telemetry initialized"
        );

        Ok(Self {
            service_name: service_name.to_string(),
            format,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "text" | "pretty" => Ok(LogFormat::Text),
        other => Err(Error::Config(format!(
            "SHARDWRIGHT_LOG_FORMAT must be one of [json, text], got '{other}'"
        ))),
    }
}
