//! Workspace recovery integration tests
//!
//! A fake daemon set stands in for dockerd so the disk exhaustion signal can
//! be raised from inside a build attempt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cvmbox_agent::{
    run_workspace, AgentError, BuildConfig, BuildPipeline, ClientCall, DaemonControl, DiskSignal,
    ExecSpec, MemFilesystem, MockClient, MockMounter, PipelineDeps, PipelineSettings,
    ReadinessConfig, RetryPolicy, Stage,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeDaemons {
    signal: DiskSignal,
    restarts: AtomicUsize,
    /// The restarted daemon immediately reports a full disk again
    full_after_restart: bool,
}

#[async_trait]
impl DaemonControl for FakeDaemons {
    fn disk_signal(&self) -> DiskSignal {
        self.signal.clone()
    }

    async fn restart_on_alternate_storage(&self) -> cvmbox_agent::Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.full_after_restart {
            self.signal.fire();
        }
        Ok(())
    }
}

fn readiness() -> ReadinessConfig {
    ReadinessConfig {
        interval: Duration::from_millis(1),
        timeout: Duration::from_secs(1),
    }
}

fn pipeline(client: Arc<MockClient>) -> BuildPipeline {
    let fs = Arc::new(MemFilesystem::new());
    let deps = PipelineDeps::new(client, fs, Arc::new(MockMounter::new()));
    let settings = PipelineSettings {
        pull_retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
        bootstrap_retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
        ..Default::default()
    };
    BuildPipeline::with_settings(
        BuildConfig::new("ubuntu:22.04", "coder", "token"),
        deps,
        settings,
    )
}

/// Make `mkdir` fail with a disk error and raise the daemon signal, `failures` times
fn fail_mkdir_on_full_disk(client: &MockClient, signal: DiskSignal, failures: usize) {
    let remaining = Arc::new(AtomicUsize::new(failures));
    client.set_exec_handler(Arc::new(move |_: &str, spec: &ExecSpec| {
        if spec.cmd.first().map(String::as_str) != Some("mkdir") {
            return None;
        }
        let left = remaining.load(Ordering::SeqCst);
        if left == 0 {
            return None;
        }
        remaining.store(left - 1, Ordering::SeqCst);
        signal.fire();
        Some(Err(AgentError::Runtime(
            "mkdir: cannot create directory: No space left on device".to_string(),
        )))
    }));
}

fn workspace_creations(client: &MockClient) -> usize {
    client
        .calls()
        .iter()
        .filter(|c| matches!(c, ClientCall::Create { name, .. } if name == "workspace_cvm"))
        .count()
}

#[tokio::test]
async fn test_daemon_disk_exhaustion_restarts_once_and_reruns() {
    let client = Arc::new(MockClient::new());
    let daemons = FakeDaemons::default();
    fail_mkdir_on_full_disk(&client, daemons.signal.clone(), 1);

    let handle = run_workspace(
        &pipeline(client.clone()),
        &daemons,
        client.as_ref(),
        &readiness(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(daemons.restarts.load(Ordering::SeqCst), 1);
    assert!(!daemons.signal.is_fired());
    // The rerun starts from the pull
    assert_eq!(client.pull_attempts(), 2);
    assert_eq!(workspace_creations(&client), 2);
    assert!(client.container_spec(&handle.container_id).is_some());
    assert_eq!(client.container_count(), 1);
}

#[tokio::test]
async fn test_second_daemon_disk_exhaustion_is_fatal() {
    let client = Arc::new(MockClient::new());
    let daemons = FakeDaemons::default();
    fail_mkdir_on_full_disk(&client, daemons.signal.clone(), usize::MAX);

    let err = run_workspace(
        &pipeline(client.clone()),
        &daemons,
        client.as_ref(),
        &readiness(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, AgentError::DiskExhausted(_)));
    assert_eq!(daemons.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(workspace_creations(&client), 2);
}

#[tokio::test]
async fn test_signal_raised_before_build_interrupts_attempt() {
    let client = Arc::new(MockClient::new());
    let daemons = FakeDaemons::default();
    daemons.signal.fire();

    run_workspace(
        &pipeline(client.clone()),
        &daemons,
        client.as_ref(),
        &readiness(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(daemons.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(workspace_creations(&client), 1);
    assert!(client.calls().contains(&ClientCall::Ping));
}

#[tokio::test]
async fn test_ordinary_failure_is_not_retried() {
    let client = Arc::new(MockClient::new());
    client.fail_pulls(["manifest unknown", "manifest unknown"]);
    let daemons = FakeDaemons::default();

    let err = run_workspace(
        &pipeline(client.clone()),
        &daemons,
        client.as_ref(),
        &readiness(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::PullImage));
    assert_eq!(daemons.restarts.load(Ordering::SeqCst), 0);
    assert_eq!(client.pull_attempts(), 2);
}

#[tokio::test]
async fn test_exhaustion_reported_during_restart_is_fatal() {
    let client = Arc::new(MockClient::new());
    let daemons = FakeDaemons {
        full_after_restart: true,
        ..Default::default()
    };
    fail_mkdir_on_full_disk(&client, daemons.signal.clone(), 1);

    let err = run_workspace(
        &pipeline(client.clone()),
        &daemons,
        client.as_ref(),
        &readiness(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, AgentError::DiskExhausted(_)));
    assert_eq!(daemons.restarts.load(Ordering::SeqCst), 1);
    assert!(daemons.signal.is_fired());
    assert_eq!(workspace_creations(&client), 1);
}
