//! cvmbox Observability - Logging and Build Output
//!
//! - Structured logging with pretty/JSON/compact formats and optional file output
//! - Termination log capture of the final fatal error
//! - Batched shipping of user-visible build output
//!
//! # Quick Start
//!
//! ```no_run
//! use cvmbox_observability::{init_logging, log_fatal, LoggingConfig};
//!
//! let _guard = init_logging(&LoggingConfig::default()).expect("Failed to init logging");
//! tracing::info!("Application started");
//! log_fatal("workspace failed to start");
//! ```

pub mod buildlog;
pub mod config;
pub mod error;
pub mod logging;
pub mod termination;

pub use buildlog::{
    chunk_line, BuildLogLine, BuildLogSink, BuildLogWriter, HttpLogPublisher, LogPublisher,
};
pub use config::*;
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
pub use termination::{log_fatal, TerminationLogLayer};
