//! Build pipeline integration tests
//!
//! Drive the whole pipeline against the in-memory client, filesystem and mounter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cvmbox_agent::host::{FileKind, MountCall};
use cvmbox_agent::pipeline::AGENT_TOKEN_ENV;
use cvmbox_agent::{
    AgentError, BuildConfig, BuildPipeline, ClientCall, CvmHandle, ExecOutput, ExecSpec,
    Filesystem, MemFilesystem, MockClient, MockMounter, Mount, MountPoint, PipelineDeps,
    PipelineSettings, ProgressReporter, RetryPolicy, Stage,
};
use tokio_util::sync::CancellationToken;

const IMAGE: &str = "registry.example.com/workspaces/ubuntu:22.04";
const OFFSET: u32 = 100_000;

// =============================================================================
// Fixtures
// =============================================================================

struct Harness {
    client: Arc<MockClient>,
    fs: Arc<MemFilesystem>,
    mounter: Arc<MockMounter>,
}

impl Harness {
    fn new() -> Self {
        Self::with_mounts(Vec::new())
    }

    fn with_mounts(mounts: Vec<MountPoint>) -> Self {
        let fs = Arc::new(MemFilesystem::new());
        fs.add_dir("/home/coder");
        fs.add_dir("/data");
        fs.add_file("/sys/fs/cgroup/cpu.max", "200000 100000\n");
        Self {
            client: Arc::new(MockClient::new()),
            fs,
            mounter: Arc::new(MockMounter::with_mounts(mounts)),
        }
    }

    fn deps(&self) -> PipelineDeps {
        PipelineDeps::new(self.client.clone(), self.fs.clone(), self.mounter.clone())
    }

    fn pipeline(&self, config: BuildConfig) -> BuildPipeline {
        BuildPipeline::with_settings(config, self.deps(), fast_settings())
    }
}

fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        pull_retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
        bootstrap_retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
        ..Default::default()
    }
}

fn build_config() -> BuildConfig {
    let mut config = BuildConfig::new(IMAGE, "coder", "secret-token");
    config.mounts = vec![
        Mount::new("/home/coder", "/home/coder"),
        Mount::new("/data", "/mnt/data").read_only(),
    ];
    config.env_allowlist = vec!["EDITOR".to_string(), "CODER_*".to_string()];
    config.host_env = [
        ("EDITOR", "vim"),
        ("CODER_URL", "https://coder.example.com"),
        ("HOME", "/root"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    config.bootstrap_script = Some("curl -fsSL https://coder.example.com/bootstrap | sh".to_string());
    config
}

fn position(calls: &[ClientCall], pred: impl Fn(&ClientCall) -> bool) -> usize {
    calls.iter().position(|c| pred(c)).unwrap()
}

async fn run(harness: &Harness, config: BuildConfig) -> Result<CvmHandle, AgentError> {
    harness.pipeline(config).run(&CancellationToken::new()).await
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_full_pipeline_builds_workspace() {
    let harness = Harness::new();
    let handle = run(&harness, build_config()).await.unwrap();

    assert_eq!(handle.metadata.uid, 1000);
    assert_eq!(handle.metadata.home_dir, PathBuf::from("/home/coder"));
    assert!(handle.metadata.has_init);
    assert!(handle.rootfs.is_some());
    assert!(handle.gpu.is_none());

    let quota = handle.quota.unwrap();
    assert_eq!((quota.quota, quota.period), (200_000, 100_000));
    assert_eq!(
        harness
            .fs
            .contents(format!(
                "/sys/fs/cgroup/docker/{}/init.scope/cpu.max",
                handle.container_id
            ))
            .as_deref(),
        Some("200000 100000")
    );

    // Only the workspace container is left; the probe was removed
    assert_eq!(harness.client.container_count(), 1);
    let spec = harness.client.container_spec(&handle.container_id).unwrap();
    assert_eq!(spec.entrypoint, vec!["/sbin/init".to_string()]);
    assert_eq!(spec.runtime.as_deref(), Some("sysbox-runc"));
    assert_eq!(spec.hostname.as_deref(), Some("cvmbox"));
    assert!(spec.env.contains(&"EDITOR=vim".to_string()));
    assert!(spec.env.contains(&"CODER_URL=https://coder.example.com".to_string()));
    assert!(!spec.env.iter().any(|e| e.starts_with("HOME=")));
    assert!(spec.env.contains(&format!("{AGENT_TOKEN_ENV}=secret-token")));
    assert_eq!(spec.devices.len(), 2);
    assert!(spec
        .mounts
        .iter()
        .any(|m| m.mountpoint == PathBuf::from("/var/lib/docker")));
}

#[tokio::test]
async fn test_pipeline_stage_order() {
    let harness = Harness::new();
    let handle = run(&harness, build_config()).await.unwrap();

    let calls = harness.client.calls();
    let pull = position(&calls, |c| matches!(c, ClientCall::Pull { .. }));
    let probe = position(&calls, |c| {
        matches!(c, ClientCall::Create { name, .. } if name.ends_with("-probe"))
    });
    let create = position(&calls, |c| {
        matches!(c, ClientCall::Create { name, .. } if name == "workspace_cvm")
    });
    let prune = position(&calls, |c| matches!(c, ClientCall::Prune { dangling_only: true }));
    let bootstrap = position(&calls, |c| matches!(c, ClientCall::Exec { detach: true, .. }));
    assert!(pull < probe && probe < create && create < prune && prune < bootstrap);

    let commands = harness.client.exec_commands(&handle.container_id);
    assert_eq!(
        commands[0],
        vec!["mkdir", "-p", "/home/coder/.cvmbox"]
    );
    assert_eq!(commands[1][0], "/bin/sh");
}

#[tokio::test]
async fn test_pipeline_shifts_ownership_and_creates_devices() {
    let harness = Harness::new();
    run(&harness, build_config()).await.unwrap();

    assert_eq!(harness.fs.owner("/home/coder"), Some((1000 + OFFSET, 1000 + OFFSET)));
    assert_eq!(harness.fs.owner("/data"), Some((OFFSET, OFFSET)));
    // Inner runtime state stays owned by the outer runtime
    assert_eq!(harness.fs.owner("/var/lib/cvmbox/docker"), Some((0, 0)));

    for device in ["/var/lib/cvmbox/dev/tun", "/var/lib/cvmbox/dev/fuse"] {
        let stat = harness.fs.stat(Path::new(device)).unwrap();
        assert_eq!(stat.kind, FileKind::CharDevice);
        assert_eq!((stat.uid, stat.gid), (OFFSET, OFFSET));
    }

    let calls = harness.mounter.calls();
    assert!(calls.contains(&MountCall::Mount {
        source: String::new(),
        target: PathBuf::from("/sys"),
        fstype: String::new(),
        options: vec!["remount".to_string(), "rw".to_string()],
    }));
    assert!(calls.contains(&MountCall::Mount {
        source: String::new(),
        target: PathBuf::from("/data"),
        fstype: String::new(),
        options: vec!["remount".to_string(), "rw".to_string()],
    }));
}

#[tokio::test]
async fn test_image_without_init_sleeps_forever() {
    let harness = Harness::new();
    harness.client.set_exec_handler(Arc::new(|_: &str, spec: &ExecSpec| {
        (spec.cmd.first().map(String::as_str) == Some("stat")).then(|| {
            Ok(ExecOutput {
                exit_code: 1,
                output: "stat: cannot statx '/sbin/init': No such file or directory".to_string(),
            })
        })
    }));

    let handle = run(&harness, build_config()).await.unwrap();
    let spec = harness.client.container_spec(&handle.container_id).unwrap();
    assert_eq!(spec.entrypoint, vec!["sleep".to_string()]);
    assert_eq!(spec.cmd, vec!["infinity".to_string()]);
}

#[tokio::test]
async fn test_rerun_replaces_existing_container() {
    let harness = Harness::new();
    let first = run(&harness, build_config()).await.unwrap();
    let second = run(&harness, build_config()).await.unwrap();

    assert_ne!(first.container_id, second.container_id);
    assert_eq!(harness.client.container_count(), 1);
}

#[tokio::test]
async fn test_bootstrap_skipped_without_script() {
    let harness = Harness::new();
    let mut config = build_config();
    config.bootstrap_script = None;

    run(&harness, config).await.unwrap();
    assert!(!harness
        .client
        .calls()
        .iter()
        .any(|c| matches!(c, ClientCall::Exec { detach: true, .. })));
}

#[derive(Default)]
struct RecordingReporter(std::sync::Mutex<Vec<String>>);

impl ProgressReporter for RecordingReporter {
    fn report(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

#[tokio::test]
async fn test_progress_messages() {
    let harness = Harness::new();
    let reporter = Arc::new(RecordingReporter::default());
    let deps = harness.deps().with_progress(reporter.clone());

    BuildPipeline::with_settings(build_config(), deps, fast_settings())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let messages = reporter.0.lock().unwrap().clone();
    assert!(messages[0].starts_with("Pulling image"));
    assert_eq!(messages.last().map(String::as_str), Some("Workspace is ready"));
}

// =============================================================================
// Image pull recovery
// =============================================================================

#[tokio::test]
async fn test_disk_exhausted_pull_prunes_once() {
    let harness = Harness::new();
    harness.client.fail_pulls([
        "write /var/lib/docker/tmp/GetImageBlob: no space left on device",
        "write /var/lib/docker/tmp/GetImageBlob: no space left on device",
    ]);

    run(&harness, build_config()).await.unwrap();

    assert_eq!(harness.client.pull_attempts(), 3);
    let calls = harness.client.calls();
    let pulls_and_prunes: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c, ClientCall::Pull { .. } | ClientCall::Prune { dangling_only: false }))
        .collect();
    assert!(matches!(pulls_and_prunes[0], ClientCall::Pull { .. }));
    assert!(matches!(pulls_and_prunes[1], ClientCall::Prune { dangling_only: false }));
    assert!(matches!(pulls_and_prunes[2], ClientCall::Pull { .. }));
    assert!(matches!(pulls_and_prunes[3], ClientCall::Pull { .. }));
    assert_eq!(pulls_and_prunes.len(), 4);
}

#[tokio::test]
async fn test_disk_exhaustion_outlasting_retries_is_fatal() {
    let harness = Harness::new();
    harness.client.fail_pulls(["no space left on device"; 3]);

    let err = run(&harness, build_config()).await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::PullImage));
    match err {
        AgentError::Stage { source, .. } => {
            assert!(matches!(*source, AgentError::DiskExhausted(_)))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.client.pull_attempts(), 3);
}

#[tokio::test]
async fn test_transient_pull_failure_is_retried() {
    let harness = Harness::new();
    harness.client.fail_pulls(["connection reset by peer"]);

    run(&harness, build_config()).await.unwrap();
    assert_eq!(harness.client.pull_attempts(), 2);
    assert!(!harness
        .client
        .calls()
        .iter()
        .any(|c| matches!(c, ClientCall::Prune { dangling_only: false })));
}

#[tokio::test]
async fn test_pull_uses_docker_config_credentials() {
    let harness = Harness::new();
    harness.fs.add_file(
        "/root/.docker/config.json",
        r#"{"auths":{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}}"#,
    );

    run(&harness, build_config()).await.unwrap();
    assert!(harness
        .client
        .calls()
        .contains(&ClientCall::Pull {
            image: IMAGE.to_string(),
            authenticated: true,
        }));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_missing_user_fails_probe_stage() {
    let harness = Harness::new();
    harness.client.set_exec_handler(Arc::new(|_: &str, spec: &ExecSpec| {
        (spec.cmd.first().map(String::as_str) == Some("getent")).then(|| {
            Ok(ExecOutput {
                exit_code: 2,
                output: String::new(),
            })
        })
    }));

    let err = run(&harness, build_config()).await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::ProbeImage));
    assert_eq!(harness.client.container_count(), 0);
}

#[tokio::test]
async fn test_bootstrap_failure_after_retries() {
    let harness = Harness::new();
    harness.client.set_exec_handler(Arc::new(|_: &str, spec: &ExecSpec| {
        spec.detach.then(|| Err(AgentError::Runtime("exec create failed".to_string())))
    }));

    let err = run(&harness, build_config()).await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Bootstrap));
    let bootstraps = harness
        .client
        .calls()
        .iter()
        .filter(|c| matches!(c, ClientCall::Exec { detach: true, .. }))
        .count();
    assert_eq!(bootstraps, 3);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_any_stage() {
    let harness = Harness::new();
    let config = BuildConfig::new(IMAGE, "coder", "");

    let err = run(&harness, config).await.unwrap_err();
    assert!(matches!(err, AgentError::Configuration(_)));
    assert!(harness.client.calls().is_empty());
}

#[tokio::test]
async fn test_cancelled_token_stops_pipeline() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .pipeline(build_config())
        .run(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    assert!(harness.client.calls().is_empty());
}

// =============================================================================
// GPU passthrough
// =============================================================================

#[tokio::test]
async fn test_gpu_passthrough() {
    let mut smi = MountPoint::new("/usr/bin/nvidia-smi", "ext4");
    smi.options = vec!["ro".to_string()];
    let harness = Harness::with_mounts(vec![
        MountPoint::new("/proc/driver/nvidia", "tmpfs"),
        MountPoint::new("/dev/nvidia0", "devtmpfs"),
        smi,
        MountPoint::new("/etc/hosts", "ext4"),
    ]);
    harness.fs.add_char_device("/dev/nvidia0", 195, 0);
    let lib = "/usr/lib/x86_64-linux-gnu";
    harness.fs.add_symlink(format!("{lib}/libcuda.so"), "libcuda.so.1");
    harness.fs.add_symlink(format!("{lib}/libcuda.so.1"), "libcuda.so.550.54");
    harness.fs.add_file(format!("{lib}/libcuda.so.550.54"), "elf");
    harness.fs.add_file(format!("{lib}/libssl.so.3"), "elf");

    let mut config = build_config();
    config.gpu.enabled = true;
    config.gpu.inner_lib_dir = Some(PathBuf::from("/usr/lib/nvidia"));
    config
        .host_env
        .insert("NVIDIA_VISIBLE_DEVICES".to_string(), "all".to_string());

    let handle = run(&harness, config).await.unwrap();

    assert!(harness
        .mounter
        .calls()
        .contains(&MountCall::Unmount(PathBuf::from("/proc/driver/nvidia"))));
    assert_eq!(harness.fs.owner("/dev/nvidia0"), Some((OFFSET, OFFSET)));

    let spec = harness.client.container_spec(&handle.container_id).unwrap();
    assert!(spec
        .devices
        .iter()
        .any(|d| d.host_path == PathBuf::from("/dev/nvidia0") && d.major == 195));
    assert!(spec.env.contains(&"NVIDIA_VISIBLE_DEVICES=all".to_string()));

    let libraries: Vec<_> = spec
        .mounts
        .iter()
        .filter(|m| m.source.starts_with(lib))
        .collect();
    assert_eq!(libraries.len(), 3);
    assert!(libraries.iter().all(|m| m.read_only));
    assert!(libraries
        .iter()
        .all(|m| m.mountpoint.starts_with("/usr/lib/nvidia")));
    assert!(spec
        .mounts
        .iter()
        .any(|m| m.source == PathBuf::from("/usr/bin/nvidia-smi") && m.read_only));
    assert!(!spec.mounts.iter().any(|m| m.source == PathBuf::from("/etc/hosts")));
}
