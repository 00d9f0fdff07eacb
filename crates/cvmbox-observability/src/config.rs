//! Configuration types for observability

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where orchestrators read a container's failure reason from
pub const DEFAULT_TERMINATION_LOG: &str = "/dev/termination-log";

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact format (single line)
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default)]
    pub level: LogLevel,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Filter directives overriding `level` (same syntax as RUST_LOG)
    #[serde(default)]
    pub filter_directives: Option<String>,

    /// Log to file (optional)
    #[serde(default)]
    pub file: Option<FileLoggingConfig>,

    /// File that receives the message of `fatal` events
    #[serde(default = "default_termination_log")]
    pub termination_log: Option<PathBuf>,

    /// Include source code location in logs
    #[serde(default)]
    pub include_location: bool,

    /// Include target (module path) in logs
    #[serde(default = "default_true")]
    pub include_target: bool,
}

fn default_true() -> bool {
    true
}

fn default_termination_log() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_TERMINATION_LOG))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            filter_directives: None,
            file: None,
            termination_log: default_termination_log(),
            include_location: false,
            include_target: true,
        }
    }
}

/// File logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLoggingConfig {
    /// Directory for log files
    pub directory: PathBuf,

    /// File name prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Rotation strategy
    #[serde(default)]
    pub rotation: RotationStrategy,
}

fn default_prefix() -> String {
    "cvmbox".to_string()
}

/// Log file rotation strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    /// Rotate daily
    #[default]
    Daily,
    /// Rotate hourly
    Hourly,
    /// Never rotate (single file)
    Never,
}

/// Batching limits for the build-log sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogConfig {
    /// Flush once this many lines are queued
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Flush once the queued output reaches this many bytes
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Longer lines are split into several chunks
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Flush whatever is queued this often
    #[serde(default = "default_flush_interval", with = "duration_millis")]
    pub flush_interval: Duration,

    /// Lines waiting for the batching task; further lines are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_lines() -> usize {
    100
}

fn default_max_bytes() -> usize {
    1024 * 1024
}

fn default_max_line_bytes() -> usize {
    16 * 1024
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_queue_capacity() -> usize {
    4096
}

impl Default for BuildLogConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            max_bytes: default_max_bytes(),
            max_line_bytes: default_max_line_bytes(),
            flush_interval: default_flush_interval(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_defaults() {
        let config: LoggingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(
            config.termination_log,
            Some(PathBuf::from(DEFAULT_TERMINATION_LOG))
        );
    }

    #[test]
    fn test_build_log_config_from_json() {
        let config: BuildLogConfig =
            serde_json::from_str(r#"{"max_lines": 10, "flush_interval": 250}"#).unwrap();
        assert_eq!(config.max_lines, 10);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.max_line_bytes, 16 * 1024);
        assert_eq!(config.queue_capacity, 4096);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
