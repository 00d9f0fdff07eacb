//! Structured logging with JSON/pretty output and file rotation

use std::io;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt, layer::Layered, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig, RotationStrategy};
use crate::error::{ObservabilityError, Result};
use crate::termination::TerminationLogLayer;

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync>;

/// Guard that must be held to keep the async file writer running
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(guard: Option<WorkerGuard>) -> Self {
        Self { _guard: guard }
    }
}

/// Initialize logging with the given configuration
///
/// RUST_LOG takes precedence over the configured level. Returns a guard that
/// must be held for the lifetime of the application to ensure logs are
/// flushed properly.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        match &config.filter_directives {
            Some(directives) => EnvFilter::new(directives),
            None => EnvFilter::new(config.level.as_str()),
        }
    });

    let mut layers: Vec<BoxedLayer> = vec![console_layer(config)];

    let guard = match &config.file {
        Some(file_config) => {
            let (writer, guard) = create_file_writer(file_config)?;
            layers.push(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(config.include_target)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_ansi(false)
                    .json()
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    if let Some(path) = &config.termination_log {
        layers.push(TerminationLogLayer::new(path).boxed());
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| ObservabilityError::LoggingInit(e.to_string()))?;

    Ok(LogGuard::new(guard))
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn create_file_writer(config: &FileLoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(&config.directory)?;

    let rotation = match config.rotation {
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
        RotationStrategy::Never => Rotation::NEVER,
    };
    let file_appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.prefix)
        .build(&config.directory)
        .map_err(|e| ObservabilityError::LoggingInit(e.to_string()))?;

    Ok(tracing_appender::non_blocking(file_appender))
}
