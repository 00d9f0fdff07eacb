//! The container runtime's background daemons
//!
//! `sysbox-mgr` and `sysbox-fs` are mandatory for the whole lifetime of the
//! workspace; `dockerd` may be restarted once onto alternate storage when it
//! reports a full disk.

use crate::error::{classify_message, AgentError, FailureSource, Recovery, RecoveryPolicy, Result};
use crate::process::{LineObserver, ManagedProcess, ProcessConfig, ProcessIdentity};
use crate::runtime::ContainerClient;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub const SYSBOX_MGR: &str = "sysbox-mgr";
pub const SYSBOX_FS: &str = "sysbox-fs";
pub const DOCKERD: &str = "dockerd";

/// Storage layout dockerd runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// overlay2 on the primary data root
    #[default]
    Default,
    /// vfs on a separate data root, used after the primary one filled up
    Alternate,
}

/// Program and arguments of one daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl DaemonCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// How to launch the daemon set
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub sysbox_mgr: DaemonCommand,
    pub sysbox_fs: DaemonCommand,
    pub dockerd_program: String,
    pub socket: PathBuf,
    pub data_root: PathBuf,
    pub alternate_data_root: PathBuf,
    /// Poll interval used while following dockerd across restarts
    pub poll_interval: Duration,
    pub process: ProcessConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sysbox_mgr: DaemonCommand::new(SYSBOX_MGR, Vec::new()),
            sysbox_fs: DaemonCommand::new(SYSBOX_FS, Vec::new()),
            dockerd_program: DOCKERD.to_string(),
            socket: PathBuf::from("/var/run/docker.sock"),
            data_root: PathBuf::from("/var/lib/docker"),
            alternate_data_root: PathBuf::from("/var/lib/docker-vfs"),
            poll_interval: Duration::from_millis(250),
            process: ProcessConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// dockerd command line for a storage mode
    pub fn dockerd_args(&self, storage: StorageMode) -> Vec<String> {
        let (data_root, driver) = match storage {
            StorageMode::Default => (&self.data_root, "overlay2"),
            StorageMode::Alternate => (&self.alternate_data_root, "vfs"),
        };
        vec![
            format!("--host=unix://{}", self.socket.display()),
            format!("--data-root={}", data_root.display()),
            format!("--storage-driver={driver}"),
            "--log-level=info".to_string(),
        ]
    }
}

/// Fires once when dockerd reports that its storage is full
#[derive(Debug, Clone)]
pub struct DiskSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for DiskSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal; returns `false` if it was already raised
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is raised
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so this cannot observe a closed channel
        let _ = rx.wait_for(|fired| *fired).await;
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }
}

/// Line observer that raises `signal` on a daemon disk-exhaustion line
pub fn disk_observer(signal: DiskSignal) -> LineObserver {
    Arc::new(move |line: &str| {
        let kind = classify_message(line);
        if RecoveryPolicy::decide(FailureSource::Daemon, kind) == Recovery::RestartDaemon
            && signal.fire()
        {
            tracing::warn!(line = %line, "dockerd reported disk exhaustion");
        }
    })
}

/// Poll the runtime until it answers a ping
pub async fn wait_ready(
    client: &dyn ContainerClient,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let err = match client.ping().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if Instant::now() >= deadline {
            return Err(AgentError::Timeout {
                what: format!("container runtime readiness ({err})"),
                timeout,
            });
        }
        tracing::debug!(error = %err, "container runtime not ready yet");
        tokio::time::sleep(interval).await;
    }
}

async fn wait_exit(process: &ManagedProcess) -> (String, Result<()>) {
    let result = match process.identity().await {
        Some(identity) => process.wait(identity).await,
        None => Err(AgentError::NotStarted {
            name: process.name().to_string(),
        }),
    };
    (process.name().to_string(), result)
}

fn daemon_exited(name: String, result: Result<()>) -> AgentError {
    let reason = match result {
        Ok(()) => "exited with status 0".to_string(),
        Err(e) => e.to_string(),
    };
    AgentError::DaemonExited { name, reason }
}

/// Handles for the three daemons
pub struct DaemonSet {
    config: DaemonConfig,
    sysbox_mgr: ManagedProcess,
    sysbox_fs: ManagedProcess,
    dockerd: ManagedProcess,
    disk_signal: DiskSignal,
}

impl std::fmt::Debug for DaemonSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonSet")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DaemonSet {
    pub fn new(config: DaemonConfig) -> Self {
        let process = |name: &str, command: &DaemonCommand| {
            ManagedProcess::with_config(
                name,
                command.program.clone(),
                command.args.clone(),
                config.process.clone(),
            )
        };
        let sysbox_mgr = process(SYSBOX_MGR, &config.sysbox_mgr);
        let sysbox_fs = process(SYSBOX_FS, &config.sysbox_fs);
        let dockerd = ManagedProcess::with_config(
            DOCKERD,
            config.dockerd_program.clone(),
            config.dockerd_args(StorageMode::Default),
            config.process.clone(),
        );

        let disk_signal = DiskSignal::new();
        dockerd.add_line_observer(disk_observer(disk_signal.clone()));

        Self {
            config,
            sysbox_mgr,
            sysbox_fs,
            dockerd,
            disk_signal,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn disk_signal(&self) -> DiskSignal {
        self.disk_signal.clone()
    }

    pub fn dockerd(&self) -> &ManagedProcess {
        &self.dockerd
    }

    /// Start sysbox first; dockerd needs its runtime registered
    pub async fn start(&self) -> Result<()> {
        for process in [&self.sysbox_mgr, &self.sysbox_fs, &self.dockerd] {
            let identity = process.start().await?;
            tracing::info!(daemon = %process.name(), pid = identity.pid, "started daemon");
        }
        Ok(())
    }

    /// Relaunch dockerd with the given storage
    pub async fn restart_dockerd(&self, storage: StorageMode) -> Result<ProcessIdentity> {
        tracing::warn!(?storage, "restarting dockerd");
        self.dockerd
            .restart(
                self.config.dockerd_program.clone(),
                self.config.dockerd_args(storage),
            )
            .await
    }

    /// Resolve with an error as soon as either sysbox daemon exits
    pub async fn watch_mandatory(&self) -> AgentError {
        let (name, result) = tokio::select! {
            exit = wait_exit(&self.sysbox_mgr) => exit,
            exit = wait_exit(&self.sysbox_fs) => exit,
        };
        tracing::error!(daemon = %name, "mandatory daemon exited");
        daemon_exited(name, result)
    }

    /// Resolve with an error when dockerd exits other than through a restart
    pub async fn watch_dockerd(&self) -> AgentError {
        loop {
            let Some(identity) = self.dockerd.identity().await else {
                return AgentError::NotStarted {
                    name: DOCKERD.to_string(),
                };
            };
            match self.dockerd.wait(identity).await {
                Err(AgentError::KilledByUser) => {
                    // Killed by a restart; follow the next generation
                    while self
                        .dockerd
                        .identity()
                        .await
                        .is_some_and(|current| current.generation == identity.generation)
                    {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
                result => {
                    tracing::error!(daemon = DOCKERD, "dockerd exited");
                    return daemon_exited(DOCKERD.to_string(), result);
                }
            }
        }
    }

    /// Kill every running daemon, dockerd first
    pub async fn shutdown(&self) {
        for process in [&self.dockerd, &self.sysbox_fs, &self.sysbox_mgr] {
            if let Some(identity) = process.identity().await {
                if let Err(e) = process.kill_and_wait(identity).await {
                    tracing::warn!(daemon = %process.name(), error = %e, "failed to stop daemon");
                }
            }
        }
    }
}
