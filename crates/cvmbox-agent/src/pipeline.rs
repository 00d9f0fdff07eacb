//! Build pipeline: from an image reference to a running inner container
//!
//! Stages run strictly in order. Every stage error is wrapped with the stage
//! it happened in; a cancelled token aborts the current stage and nothing
//! already done is rolled back.

use crate::cgroups::{CpuQuota, QuotaPropagator, CGROUP_ROOT};
use crate::config::{BuildConfig, Device, Mount};
use crate::credentials::resolve_registry_auth;
use crate::error::{AgentError, FailureSource, Recovery, RecoveryPolicy, Result};
use crate::gpu::{is_gpu_mount, GpuLocator, GpuResources};
use crate::host::{Filesystem, Mounter};
use crate::idshift::NamespaceShifter;
use crate::image::{probe_image, ImageMetadata};
use crate::retry::RetryPolicy;
use crate::runtime::{ContainerClient, ContainerSpec, ExecSpec, RegistryAuth};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Environment variable carrying the agent token into the inner container
pub const AGENT_TOKEN_ENV: &str = "CVMBOX_AGENT_TOKEN";

/// Directory under the user's home holding bootstrap state
pub const BOOTSTRAP_DIR_NAME: &str = ".cvmbox";

/// OCI runtime the inner container runs under
pub const SYSBOX_RUNTIME: &str = "sysbox-runc";

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ResolveCredentials,
    PullImage,
    RemountSys,
    TeardownGpuMounts,
    ProbeImage,
    ShiftMounts,
    LocateGpus,
    CreateContainer,
    PruneImages,
    CreateBootstrapDir,
    PropagateQuota,
    Bootstrap,
}

impl Stage {
    pub const ALL: [Stage; 12] = [
        Stage::ResolveCredentials,
        Stage::PullImage,
        Stage::RemountSys,
        Stage::TeardownGpuMounts,
        Stage::ProbeImage,
        Stage::ShiftMounts,
        Stage::LocateGpus,
        Stage::CreateContainer,
        Stage::PruneImages,
        Stage::CreateBootstrapDir,
        Stage::PropagateQuota,
        Stage::Bootstrap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResolveCredentials => "resolve credentials",
            Stage::PullImage => "pull image",
            Stage::RemountSys => "remount /sys",
            Stage::TeardownGpuMounts => "tear down gpu mounts",
            Stage::ProbeImage => "probe image",
            Stage::ShiftMounts => "shift mounts",
            Stage::LocateGpus => "locate gpus",
            Stage::CreateContainer => "create container",
            Stage::PruneImages => "prune images",
            Stage::CreateBootstrapDir => "create bootstrap dir",
            Stage::PropagateQuota => "propagate cpu quota",
            Stage::Bootstrap => "bootstrap",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives the user-facing progress messages of a build
pub trait ProgressReporter: Send + Sync {
    fn report(&self, message: &str);
}

/// Reports progress to the tracing log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&self, message: &str) {
        tracing::info!(progress = true, "{message}");
    }
}

/// Host and runtime handles the pipeline works through
#[derive(Clone)]
pub struct PipelineDeps {
    pub client: Arc<dyn ContainerClient>,
    pub fs: Arc<dyn Filesystem>,
    pub mounter: Arc<dyn Mounter>,
    pub progress: Arc<dyn ProgressReporter>,
}

impl PipelineDeps {
    pub fn new(
        client: Arc<dyn ContainerClient>,
        fs: Arc<dyn Filesystem>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            client,
            fs,
            mounter,
            progress: Arc::new(LogReporter),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }
}

/// Knobs that stay fixed across builds
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub pull_retry: RetryPolicy,
    pub bootstrap_retry: RetryPolicy,
    pub cgroup_root: PathBuf,
    pub sys_path: PathBuf,
    pub proc_path: PathBuf,
    /// Host directories owned by the container runtimes; never shifted
    pub private_dirs: Vec<PathBuf>,
    /// State directories of the inner container's own runtime
    pub inner_state_mounts: Vec<Mount>,
    /// OCI runtime for the inner container
    pub runtime: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pull_retry: RetryPolicy::image_pull(),
            bootstrap_retry: RetryPolicy::bootstrap(),
            cgroup_root: PathBuf::from(CGROUP_ROOT),
            sys_path: PathBuf::from("/sys"),
            proc_path: PathBuf::from("/proc"),
            private_dirs: [
                "/var/lib/docker",
                "/var/lib/docker-vfs",
                "/var/lib/sysbox",
                "/var/lib/cvmbox",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
            inner_state_mounts: vec![
                Mount::new("/var/lib/cvmbox/docker", "/var/lib/docker"),
                Mount::new("/var/lib/cvmbox/containers", "/var/lib/containers"),
            ],
            runtime: Some(SYSBOX_RUNTIME.to_string()),
        }
    }
}

/// A running inner container
#[derive(Debug, Clone)]
pub struct CvmHandle {
    pub container_id: String,
    pub metadata: ImageMetadata,
    /// CPU quota copied from the host, if the host has one configured
    pub quota: Option<CpuQuota>,
    pub rootfs: Option<PathBuf>,
    pub gpu: Option<GpuResources>,
}

/// One attempt at building the inner container
pub struct BuildPipeline {
    config: BuildConfig,
    deps: PipelineDeps,
    settings: PipelineSettings,
}

impl BuildPipeline {
    pub fn new(config: BuildConfig, deps: PipelineDeps) -> Self {
        Self::with_settings(config, deps, PipelineSettings::default())
    }

    pub fn with_settings(config: BuildConfig, deps: PipelineDeps, settings: PipelineSettings) -> Self {
        Self {
            config,
            deps,
            settings,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Run every stage in order
    pub async fn run(&self, cancel: &CancellationToken) -> Result<CvmHandle> {
        self.config.validate()?;
        let config = &self.config;
        let gpu_enabled = config.gpu.enabled;

        let auth = self
            .stage(cancel, Stage::ResolveCredentials, async {
                resolve_registry_auth(
                    self.deps.fs.as_ref(),
                    config.pull_secret.as_deref(),
                    &config.docker_config,
                    &config.image,
                )
            })
            .await?;

        self.progress(&format!("Pulling image {}", config.image));
        self.stage(cancel, Stage::PullImage, self.pull_image(auth.as_ref()))
            .await?;

        self.stage(cancel, Stage::RemountSys, async { self.remount_sys() })
            .await?;

        if gpu_enabled {
            self.stage(cancel, Stage::TeardownGpuMounts, async {
                self.teardown_gpu_mounts()
            })
            .await?;
        }

        self.progress("Inspecting image");
        let metadata = self
            .stage(cancel, Stage::ProbeImage, async {
                probe_image(
                    self.deps.client.as_ref(),
                    &config.image,
                    &config.username,
                    &format!("{}-probe", config.container_name),
                )
                .await
            })
            .await?;

        let shifter = NamespaceShifter::new(
            Arc::clone(&self.deps.fs),
            Arc::clone(&self.deps.mounter),
            config.namespace_offset,
            self.settings.private_dirs.clone(),
        );

        let mut devices = self
            .stage(cancel, Stage::ShiftMounts, async {
                self.shift_mounts(&shifter, &metadata)
            })
            .await?;

        let gpu = if gpu_enabled {
            self.progress("Locating GPUs");
            let resources = self
                .stage(cancel, Stage::LocateGpus, async {
                    self.locate_gpus(&shifter)
                })
                .await?;
            devices.extend(resources.devices.iter().cloned());
            Some(resources)
        } else {
            None
        };

        self.progress("Creating workspace");
        let (container_id, rootfs) = self
            .stage(cancel, Stage::CreateContainer, async {
                self.create_container(&metadata, devices, gpu.as_ref()).await
            })
            .await?;

        self.stage(cancel, Stage::PruneImages, async {
            self.deps.client.prune_images(true).await.map(|_| ())
        })
        .await?;

        self.stage(cancel, Stage::CreateBootstrapDir, async {
            self.create_bootstrap_dir(&container_id, &metadata).await
        })
        .await?;

        let quota = self
            .stage(cancel, Stage::PropagateQuota, async {
                QuotaPropagator::new(Arc::clone(&self.deps.fs), &self.settings.cgroup_root)
                    .propagate(&container_id)
            })
            .await?;

        if let Some(script) = config.bootstrap_script.as_deref() {
            self.progress("Running bootstrap");
            self.stage(cancel, Stage::Bootstrap, self.bootstrap(&container_id, script))
                .await?;
        }

        self.progress("Workspace is ready");
        Ok(CvmHandle {
            container_id,
            metadata,
            quota,
            rootfs,
            gpu,
        })
    }

    fn progress(&self, message: &str) {
        self.deps.progress.report(message);
    }

    async fn stage<T, F>(&self, cancel: &CancellationToken, stage: Stage, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        tracing::info!(stage = %stage, "starting stage");
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = fut => result,
        };

        match &result {
            Ok(_) => tracing::debug!(
                stage = %stage,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stage finished"
            ),
            Err(AgentError::Cancelled) => tracing::info!(stage = %stage, "stage cancelled"),
            Err(e) => tracing::error!(stage = %stage, error = %e, "stage failed"),
        }
        result.map_err(|e| e.in_stage(stage))
    }

    async fn pull_image(&self, auth: Option<&RegistryAuth>) -> Result<()> {
        let image = &self.config.image;
        let policy = &self.settings.pull_retry;
        let mut pruned = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.deps.client.pull_image(image, auth).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            match RecoveryPolicy::decide(FailureSource::ImagePull, err.kind()) {
                Recovery::PruneAndRetry if !pruned => {
                    tracing::warn!(image = %image, error = %err, "disk full while pulling, pruning images");
                    pruned = true;
                    let deleted = self.deps.client.prune_images(false).await?;
                    tracing::info!(deleted, "pruned unused images");
                }
                Recovery::Abort => return Err(err),
                _ => {}
            }

            if attempt >= policy.attempts {
                return Err(err);
            }
            let delay = policy.delay(attempt - 1);
            tracing::warn!(
                image = %image,
                attempt,
                max_attempts = policy.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying image pull"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn remount_sys(&self) -> Result<()> {
        let sys = &self.settings.sys_path;
        self.deps
            .mounter
            .mount("", sys, "", &["remount", "rw"])
            .map_err(|e| AgentError::io(sys, e))
    }

    /// Unmount the GPU runtime's procfs overlays, which the nested runtime cannot handle
    fn teardown_gpu_mounts(&self) -> Result<()> {
        let mounts = self
            .deps
            .mounter
            .list()
            .map_err(|e| AgentError::io("/proc/self/mountinfo", e))?;

        for mount in mounts
            .iter()
            .filter(|m| m.path.starts_with(&self.settings.proc_path) && is_gpu_mount(&m.path))
        {
            self.deps
                .mounter
                .unmount(&mount.path)
                .map_err(|e| AgentError::io(&mount.path, e))?;
            tracing::info!(path = %mount.path.display(), "unmounted gpu mount");
        }
        Ok(())
    }

    fn all_mounts(&self) -> Vec<Mount> {
        self.config
            .mounts
            .iter()
            .chain(self.settings.inner_state_mounts.iter())
            .cloned()
            .collect()
    }

    fn shift_mounts(
        &self,
        shifter: &NamespaceShifter,
        metadata: &ImageMetadata,
    ) -> Result<Vec<Device>> {
        for state in &self.settings.inner_state_mounts {
            self.deps
                .fs
                .create_dir_all(&state.source)
                .map_err(|e| AgentError::io(&state.source, e))?;
        }

        shifter.shift_mounts(&self.all_mounts(), metadata.uid, metadata.gid)?;

        let devices = vec![Device::tun(), Device::fuse()];
        for device in &devices {
            shifter.provision_device(device)?;
        }
        Ok(devices)
    }

    fn locate_gpus(&self, shifter: &NamespaceShifter) -> Result<GpuResources> {
        let locator = GpuLocator::new(
            Arc::clone(&self.deps.fs),
            Arc::clone(&self.deps.mounter),
            &self.config.gpu.host_lib_dir,
            self.config.gpu.inner_lib_dir.clone(),
        );
        let resources = locator.locate(&self.config.host_env)?;
        for device in &resources.devices {
            shifter.shift_device(&device.host_path)?;
        }
        Ok(resources)
    }

    fn container_env(&self, gpu: Option<&GpuResources>) -> Vec<String> {
        let mut env = self.config.forwarded_env();
        if let Some(gpu) = gpu {
            for var in &gpu.env {
                if !env.contains(var) {
                    env.push(var.clone());
                }
            }
        }
        env.push(format!("{AGENT_TOKEN_ENV}={}", self.config.agent_token));
        env
    }

    async fn create_container(
        &self,
        metadata: &ImageMetadata,
        devices: Vec<Device>,
        gpu: Option<&GpuResources>,
    ) -> Result<(String, Option<PathBuf>)> {
        let client = &self.deps.client;
        let name = &self.config.container_name;

        // Left behind by an earlier attempt against the same daemon
        if client.remove_container(name).await.is_ok() {
            tracing::info!(container = %name, "removed existing container");
        }

        let mut mounts = self.all_mounts();
        if let Some(gpu) = gpu {
            mounts.extend(gpu.mounts.iter().cloned());
        }

        let (entrypoint, cmd) = if metadata.has_init {
            (vec!["/sbin/init".to_string()], Vec::new())
        } else {
            (vec!["sleep".to_string()], vec!["infinity".to_string()])
        };

        let spec = ContainerSpec {
            name: name.clone(),
            image: self.config.image.clone(),
            hostname: Some(self.config.hostname.clone()),
            entrypoint,
            cmd,
            env: self.container_env(gpu),
            mounts,
            devices,
            limits: self.config.limits.clone(),
            runtime: self.settings.runtime.clone(),
            user: None,
        };

        let id = client.create_container(&spec).await?;
        client.start_container(&id).await?;
        let info = client.inspect_container(&id).await?;
        tracing::info!(container = %id, pid = ?info.pid, "workspace container running");
        Ok((id, info.rootfs))
    }

    async fn create_bootstrap_dir(&self, id: &str, metadata: &ImageMetadata) -> Result<PathBuf> {
        let dir = metadata.home_dir.join(BOOTSTRAP_DIR_NAME);
        let cmd = ExecSpec::new(["mkdir".to_string(), "-p".to_string(), dir.display().to_string()])
            .user(&self.config.username);
        self.deps.client.exec_checked(id, &cmd).await?;
        Ok(dir)
    }

    async fn bootstrap(&self, id: &str, script: &str) -> Result<()> {
        let policy = &self.settings.bootstrap_retry;
        let spec = ExecSpec::new(["/bin/sh", "-c", script])
            .user(&self.config.username)
            .env(vec![format!("{AGENT_TOKEN_ENV}={}", self.config.agent_token)])
            .detach();

        let mut last_error = String::new();
        for attempt in 1..=policy.attempts {
            match self.deps.client.exec(id, &spec).await {
                Ok(out) if out.exit_code == 0 => {
                    tracing::info!(container = %id, attempt, "bootstrap started");
                    return Ok(());
                }
                Ok(out) => last_error = format!("exit code {}: {}", out.exit_code, out.output.trim()),
                Err(e) => last_error = e.to_string(),
            }

            tracing::warn!(container = %id, attempt, error = %last_error, "bootstrap exec failed");
            if attempt < policy.attempts {
                tokio::time::sleep(policy.delay(attempt - 1)).await;
            }
        }

        Err(AgentError::BootstrapFailed {
            attempts: policy.attempts,
            reason: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_names() {
        assert_eq!(Stage::ALL.first(), Some(&Stage::ResolveCredentials));
        assert_eq!(Stage::ALL.last(), Some(&Stage::Bootstrap));
        assert_eq!(Stage::PullImage.to_string(), "pull image");

        let names: std::collections::HashSet<_> = Stage::ALL.iter().map(Stage::as_str).collect();
        assert_eq!(names.len(), Stage::ALL.len());
    }

    #[test]
    fn test_default_settings_mark_runtime_state_private() {
        let settings = PipelineSettings::default();
        assert!(settings
            .inner_state_mounts
            .iter()
            .all(|m| settings.private_dirs.iter().any(|d| m.source.starts_with(d))));
        assert_eq!(settings.runtime.as_deref(), Some(SYSBOX_RUNTIME));
    }
}
