//! Agent-specific errors and failure classification

use crate::pipeline::Stage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Substring the container runtime and its daemon emit when a write hits a full disk
pub const DISK_EXHAUSTED_MARKER: &str = "no space left on device";

/// Agent runtime errors
#[derive(Debug, Error)]
pub enum AgentError {
    /// The supervised process was terminated through `kill_and_wait` or `restart`
    #[error("killed by user")]
    KilledByUser,

    /// A supervised process exited on its own with a failure status
    #[error("Process '{command}' {status}: {output}")]
    ProcessFailed {
        command: String,
        status: String,
        output: String,
    },

    /// A process identity from an earlier generation was used after a restart
    #[error("Process '{name}' identity is stale (generation {stale}, current {current})")]
    StaleProcess {
        name: String,
        stale: u64,
        current: u64,
    },

    /// `start` was called while the process is still running
    #[error("Process '{name}' is already running")]
    AlreadyRunning { name: String },

    /// The process was never started
    #[error("Process '{name}' has not been started")]
    NotStarted { name: String },

    /// A mandatory daemon exited while the workspace was being built
    #[error("Daemon '{name}' exited unexpectedly: {reason}")]
    DaemonExited { name: String, reason: String },

    /// Failed to pull image
    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    /// The runtime ran out of disk space
    #[error("Disk space exhausted: {0}")]
    DiskExhausted(String),

    /// Failed to create container
    #[error("Failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Failed to start container
    #[error("Failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Container not found
    #[error("Container '{container}' not found: {reason}")]
    NotFound { container: String, reason: String },

    /// A command run inside a container exited non-zero
    #[error("Command {cmd:?} in '{container}' exited with code {code}: {output}")]
    ExecFailed {
        container: String,
        cmd: Vec<String>,
        code: i64,
        output: String,
    },

    /// Any other failure reported by the container runtime client
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The probed image is missing the user or returned malformed data
    #[error("Invalid image metadata: {0}")]
    Metadata(String),

    /// The bootstrap command could not be started in the inner container
    #[error("Bootstrap failed after {attempts} attempts: {reason}")]
    BootstrapFailed { attempts: u32, reason: String },

    /// Reading or writing a cgroup controller file failed
    #[error("Cgroup error: {0}")]
    Cgroup(String),

    /// IO errors with context
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A pipeline stage failed
    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<AgentError>,
    },

    /// Timeout
    #[error("Timeout after {timeout:?}: {what}")]
    Timeout { what: String, timeout: Duration },

    /// The build attempt was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error (missing or invalid configuration)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal runtime error
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

impl AgentError {
    /// Wrap an IO error with the path it happened at
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach the failing pipeline stage. Already-staged and cancellation errors pass through.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            Self::Stage { .. } | Self::Cancelled => self,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was raised in, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Classify this error for the recovery decision table
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::KilledByUser => ErrorKind::UserKilled,
            Self::DiskExhausted(_) => ErrorKind::DiskExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Stage { source, .. } => source.kind(),
            other => classify_message(&other.to_string()),
        }
    }
}

/// Coarse error classes the recovery policy is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Termination requested by the supervisor itself; not a failure
    UserKilled,
    /// Out of disk space on the runtime's storage
    DiskExhausted,
    /// The attempt was cancelled
    Cancelled,
    /// Anything else
    Other,
}

/// Classify raw error or log text coming from the container runtime
pub fn classify_message(message: &str) -> ErrorKind {
    if message.to_ascii_lowercase().contains(DISK_EXHAUSTED_MARKER) {
        ErrorKind::DiskExhausted
    } else {
        ErrorKind::Other
    }
}

/// Where a failure was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    /// An image pull returned an error
    ImagePull,
    /// The runtime daemon logged the failure on its own output
    Daemon,
    /// Any other pipeline stage
    Stage,
}

/// What to do about a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Prune unused images once, then retry the pull
    PruneAndRetry,
    /// Retry the operation within its retry budget
    Retry,
    /// Restart the daemon on alternate storage and rerun the pipeline once
    RestartDaemon,
    /// Give up and surface the error
    Abort,
}

/// Single decision table for failure recovery
pub struct RecoveryPolicy;

impl RecoveryPolicy {
    pub fn decide(source: FailureSource, kind: ErrorKind) -> Recovery {
        match (source, kind) {
            (_, ErrorKind::UserKilled) | (_, ErrorKind::Cancelled) => Recovery::Abort,
            (FailureSource::ImagePull, ErrorKind::DiskExhausted) => Recovery::PruneAndRetry,
            (FailureSource::ImagePull, ErrorKind::Other) => Recovery::Retry,
            (FailureSource::Daemon, ErrorKind::DiskExhausted) => Recovery::RestartDaemon,
            (FailureSource::Daemon, ErrorKind::Other) => Recovery::Abort,
            (FailureSource::Stage, _) => Recovery::Abort,
        }
    }
}
