//! Docker-based container client using bollard

use crate::config::{Device, Mount, ResourceLimits};
use crate::error::{AgentError, Result};
use crate::runtime::{
    pull_error, ContainerClient, ContainerInfo, ContainerSpec, ExecOutput, ExecSpec,
    RegistryAuth,
};
use bollard::auth::DockerCredentials;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, DeviceMapping, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, PruneImagesOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::instrument;

/// Default socket of the inner Docker daemon
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Seconds before a request to the daemon times out
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Docker-based container client using bollard
pub struct DockerClient {
    docker: Docker,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient").finish_non_exhaustive()
    }
}

impl DockerClient {
    /// Connect to the daemon behind the given unix socket
    ///
    /// Does not ping the daemon; the caller waits for readiness separately.
    pub fn connect(socket: &str) -> Result<Self> {
        let docker =
            Docker::connect_with_unix(socket, REQUEST_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    AgentError::Runtime(format!("Failed to connect to Docker at {socket}: {e}"))
                })?;
        Ok(Self { docker })
    }

    /// Create a client with a pre-configured bollard Docker client
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Parse an image reference into name and tag
fn parse_image_ref(image: &str) -> (&str, &str) {
    // Digest references are passed through whole
    if image.contains('@') {
        return (image, "");
    }

    if let Some((name, tag)) = image.rsplit_once(':') {
        // A '/' after the ':' means a registry port, not a tag
        if !tag.contains('/') {
            return (name, tag);
        }
    }

    (image, "latest")
}

fn build_devices(devices: &[Device]) -> Vec<DeviceMapping> {
    devices
        .iter()
        .map(|d| DeviceMapping {
            path_on_host: Some(d.host_path.display().to_string()),
            path_in_container: Some(d.container_path.display().to_string()),
            cgroup_permissions: Some(d.permissions.clone()),
        })
        .collect()
}

fn build_host_config(
    mounts: &[Mount],
    devices: &[Device],
    limits: &ResourceLimits,
    runtime: Option<&str>,
) -> HostConfig {
    let binds: Vec<String> = mounts.iter().map(Mount::bind_spec).collect();
    let devices = build_devices(devices);

    // Docker uses nano-CPUs: 1 CPU = 1e9 nano-CPUs
    let nano_cpus = limits.cpus.map(|c| (c * 1_000_000_000.0) as i64);

    HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        devices: if devices.is_empty() {
            None
        } else {
            Some(devices)
        },
        memory: limits.memory_bytes,
        nano_cpus,
        runtime: runtime.map(str::to_string),
        ..Default::default()
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

#[async_trait::async_trait]
impl ContainerClient for DockerClient {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| AgentError::Runtime(format!("Docker ping failed: {e}")))
    }

    /// Pull an image, authenticating when credentials are given
    #[instrument(
        skip(self, auth),
        fields(
            otel.name = "image.pull",
            container.image.name = %image,
            authenticated = auth.is_some(),
        )
    )]
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()> {
        let (name, tag) = parse_image_ref(image);

        tracing::info!(image = %image, name = %name, tag = %tag, "pulling image");

        let options = CreateImageOptions {
            from_image: Some(name.to_string()),
            tag: if tag.is_empty() {
                None
            } else {
                Some(tag.to_string())
            },
            ..Default::default()
        };
        let credentials = auth.map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: auth.server_address.clone(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(Some(options), None, credentials);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => return Err(pull_error(image, e.to_string())),
            }
        }

        tracing::info!(image = %image, "image pulled successfully");
        Ok(())
    }

    #[instrument(
        skip(self, spec),
        fields(
            otel.name = "container.create",
            container.name = %spec.name,
            container.image.name = %spec.image,
        )
    )]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = build_host_config(
            &spec.mounts,
            &spec.devices,
            &spec.limits,
            spec.runtime.as_deref(),
        );

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: spec.hostname.clone(),
            env: non_empty(&spec.env),
            cmd: non_empty(&spec.cmd),
            entrypoint: non_empty(&spec.entrypoint),
            user: spec.user.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        tracing::info!(container = %spec.name, image = %spec.image, "creating container");

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| AgentError::CreateFailed {
                id: spec.name.clone(),
                reason: e.to_string(),
            })?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, %warning, "container create warning");
        }

        tracing::info!(container = %spec.name, id = %response.id, "container created successfully");
        Ok(response.id)
    }

    #[instrument(skip(self), fields(otel.name = "container.start", container.id = %id))]
    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| AgentError::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(container = %id, "container started successfully");
        Ok(())
    }

    #[instrument(skip(self), fields(otel.name = "container.remove", container.id = %id))]
    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| AgentError::NotFound {
                container: id.to_string(),
                reason: format!("failed to remove container: {e}"),
            })?;

        tracing::debug!(container = %id, "container removed");
        Ok(())
    }

    #[instrument(skip(self), fields(otel.name = "container.inspect", container.id = %id))]
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .map_err(|e| AgentError::NotFound {
                container: id.to_string(),
                reason: format!("failed to inspect container: {e}"),
            })?;

        let state = inspect.state.unwrap_or_default();
        let rootfs = inspect
            .graph_driver
            .and_then(|driver| driver.data.get("MergedDir").cloned())
            .map(PathBuf::from);

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            pid: state.pid.filter(|pid| *pid > 0).map(|pid| pid as u32),
            running: state.running.unwrap_or(false),
            rootfs,
        })
    }

    /// Execute a command inside a container
    ///
    /// Detached execs return as soon as the command started, with exit code 0.
    #[instrument(
        skip(self, spec),
        fields(
            otel.name = "container.exec",
            container.id = %id,
            cmd = ?spec.cmd,
            detach = spec.detach,
        )
    )]
    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecOutput> {
        let exec_options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            user: spec.user.clone(),
            env: non_empty(&spec.env),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(!spec.detach),
            attach_stderr: Some(!spec.detach),
            ..Default::default()
        };

        let exec_created = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| AgentError::NotFound {
                container: id.to_string(),
                reason: format!("failed to create exec: {e}"),
            })?;

        let start_options = StartExecOptions {
            detach: spec.detach,
            ..Default::default()
        };
        let start_result = self
            .docker
            .start_exec(&exec_created.id, Some(start_options))
            .await
            .map_err(|e| AgentError::Runtime(format!("failed to start exec: {e}")))?;

        let mut output = String::new();
        match start_result {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(result) = stream.next().await {
                    match result {
                        Ok(bollard::container::LogOutput::StdOut { message })
                        | Ok(bollard::container::LogOutput::StdErr { message }) => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "error reading exec output");
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                tracing::debug!(container = %id, "exec detached");
                return Ok(ExecOutput::default());
            }
        }

        let exec_inspect = self
            .docker
            .inspect_exec(&exec_created.id)
            .await
            .map_err(|e| AgentError::Runtime(format!("failed to inspect exec: {e}")))?;

        let exit_code = exec_inspect.exit_code.unwrap_or(0);

        tracing::debug!(
            container = %id,
            exit_code = exit_code,
            output_len = output.len(),
            "exec completed"
        );

        Ok(ExecOutput { exit_code, output })
    }

    #[instrument(skip(self), fields(otel.name = "image.prune"))]
    async fn prune_images(&self, dangling_only: bool) -> Result<u64> {
        let mut filters = HashMap::new();
        filters.insert(
            "dangling".to_string(),
            vec![if dangling_only { "true" } else { "false" }.to_string()],
        );

        let response = self
            .docker
            .prune_images(Some(PruneImagesOptions {
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|e| AgentError::Runtime(format!("failed to prune images: {e}")))?;

        let deleted = response.images_deleted.map(|d| d.len() as u64).unwrap_or(0);
        tracing::info!(
            deleted,
            reclaimed_bytes = response.space_reclaimed.unwrap_or(0),
            "pruned images"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_image_ref() {
        assert_eq!(parse_image_ref("ubuntu"), ("ubuntu", "latest"));
        assert_eq!(parse_image_ref("ubuntu:22.04"), ("ubuntu", "22.04"));
        assert_eq!(
            parse_image_ref("localhost:5000/dev/image"),
            ("localhost:5000/dev/image", "latest")
        );
        assert_eq!(
            parse_image_ref("ghcr.io/org/img@sha256:abc"),
            ("ghcr.io/org/img@sha256:abc", "")
        );
    }

    #[test]
    fn test_build_host_config() {
        let mounts = vec![
            Mount::new("/home/coder", "/home/coder"),
            Mount::new("/usr/lib/libcuda.so", "/usr/lib/libcuda.so").read_only(),
        ];
        let limits = ResourceLimits {
            cpus: Some(1.5),
            memory_bytes: Some(1024),
        };

        let config = build_host_config(&mounts, &[Device::fuse()], &limits, Some("sysbox-runc"));

        assert_eq!(
            config.binds,
            Some(vec![
                "/home/coder:/home/coder".to_string(),
                "/usr/lib/libcuda.so:/usr/lib/libcuda.so:ro".to_string(),
            ])
        );
        assert_eq!(config.nano_cpus, Some(1_500_000_000));
        assert_eq!(config.memory, Some(1024));
        assert_eq!(config.runtime.as_deref(), Some("sysbox-runc"));

        let devices = config.devices.unwrap();
        assert_eq!(devices[0].path_in_container.as_deref(), Some("/dev/fuse"));
        assert_eq!(
            devices[0].path_on_host.as_deref().map(PathBuf::from),
            Some(Device::fuse().host_path)
        );
    }
}
