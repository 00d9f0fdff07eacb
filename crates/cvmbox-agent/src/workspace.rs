//! Pipeline runs with daemon-level disk exhaustion recovery

use crate::daemons::{wait_ready, DaemonSet, DiskSignal, StorageMode};
use crate::error::{AgentError, Result};
use crate::pipeline::{BuildPipeline, CvmHandle};
use crate::runtime::ContainerClient;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The daemon operations the workspace runner needs
#[async_trait]
pub trait DaemonControl: Send + Sync {
    /// Signal raised when the runtime daemon reports a full disk
    fn disk_signal(&self) -> DiskSignal;

    /// Restart the runtime daemon on its alternate storage
    async fn restart_on_alternate_storage(&self) -> Result<()>;
}

#[async_trait]
impl DaemonControl for DaemonSet {
    fn disk_signal(&self) -> DiskSignal {
        DaemonSet::disk_signal(self)
    }

    async fn restart_on_alternate_storage(&self) -> Result<()> {
        self.restart_dockerd(StorageMode::Alternate).await.map(|_| ())
    }
}

/// Readiness polling after a daemon restart
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Build the workspace, restarting the daemon once if it runs out of disk
///
/// The first disk-exhaustion signal cancels the running attempt, restarts the
/// daemon on alternate storage, waits for readiness and runs the pipeline
/// again from the start. A second signal is fatal.
pub async fn run_workspace(
    pipeline: &BuildPipeline,
    daemons: &dyn DaemonControl,
    client: &dyn ContainerClient,
    readiness: &ReadinessConfig,
    cancel: &CancellationToken,
) -> Result<CvmHandle> {
    let signal = daemons.disk_signal();
    let mut restarted = false;

    loop {
        let attempt = cancel.child_token();
        let result = tokio::select! {
            biased;
            _ = signal.fired() => None,
            result = pipeline.run(&attempt) => Some(result),
        };
        attempt.cancel();

        match result {
            Some(Ok(handle)) => return Ok(handle),
            Some(Err(e)) if !signal.is_fired() => return Err(e),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "build attempt failed after daemon disk exhaustion");
            }
            None => tracing::warn!("daemon disk exhaustion interrupted the build"),
        }

        if restarted {
            return Err(AgentError::DiskExhausted(
                "daemon ran out of disk space on alternate storage".to_string(),
            ));
        }
        restarted = true;

        // Cleared first so exhaustion reported by the restarted daemon is kept
        signal.reset();
        daemons.restart_on_alternate_storage().await?;
        wait_ready(client, readiness.interval, readiness.timeout).await?;
        tracing::info!("daemon restarted on alternate storage, rebuilding workspace");
    }
}
