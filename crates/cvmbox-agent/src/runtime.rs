//! Abstract container runtime client
//!
//! Defines the [`ContainerClient`] trait the build pipeline drives, plus an
//! in-memory [`MockClient`] for tests and development.

use crate::config::{Device, Mount, ResourceLimits};
use crate::error::{classify_message, AgentError, ErrorKind, Result};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Credentials for an image registry
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    /// Registry host the credentials belong to
    pub server_address: Option<String>,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("server_address", &self.server_address)
            .finish()
    }
}

/// Everything needed to create a container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<Device>,
    pub limits: ResourceLimits,
    /// OCI runtime to run the container with (e.g. `sysbox-runc`)
    pub runtime: Option<String>,
    pub user: Option<String>,
}

/// A command to run inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    /// Return as soon as the command started instead of waiting for it
    pub detach: bool,
}

impl ExecSpec {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn detach(mut self) -> Self {
        self.detach = true;
        self
    }
}

/// Result of a finished exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// stdout and stderr, interleaved
    pub output: String,
}

/// Subset of container inspection the agent uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub running: bool,
    /// Merged root filesystem on the host, when the storage driver exposes one
    pub rootfs: Option<PathBuf>,
}

/// Map a pull failure reported by the runtime to the matching error
pub fn pull_error(image: &str, reason: impl Into<String>) -> AgentError {
    let reason = reason.into();
    match classify_message(&reason) {
        ErrorKind::DiskExhausted => AgentError::DiskExhausted(reason),
        _ => AgentError::PullFailed {
            image: image.to_string(),
            reason,
        },
    }
}

/// Container runtime client driven by the build pipeline
#[async_trait::async_trait]
pub trait ContainerClient: Send + Sync {
    /// Check that the daemon answers
    async fn ping(&self) -> Result<()>;

    /// Pull an image to local storage
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()>;

    /// Create a container and return its ID
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container
    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    /// Execute a command inside a running container
    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecOutput>;

    /// Remove unused images and return how many were deleted
    async fn prune_images(&self, dangling_only: bool) -> Result<u64>;

    /// Execute a command and fail on a non-zero exit code
    async fn exec_checked(&self, id: &str, spec: &ExecSpec) -> Result<String> {
        let result = self.exec(id, spec).await?;
        if result.exit_code != 0 {
            return Err(AgentError::ExecFailed {
                container: id.to_string(),
                cmd: spec.cmd.clone(),
                code: result.exit_code,
                output: result.output,
            });
        }
        Ok(result.output)
    }
}

/// A call recorded by [`MockClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    Ping,
    Pull { image: String, authenticated: bool },
    Create { name: String, image: String },
    Start(String),
    Remove(String),
    Inspect(String),
    Exec {
        container: String,
        cmd: Vec<String>,
        user: Option<String>,
        detach: bool,
    },
    Prune { dangling_only: bool },
}

/// Custom exec behaviour for [`MockClient`]. Returning `None` falls back to the defaults.
pub type ExecHandler = Arc<dyn Fn(&str, &ExecSpec) -> Option<Result<ExecOutput>> + Send + Sync>;

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
}

/// In-memory container client for tests and development
///
/// Answers the image probe commands like a stock Ubuntu image with `/sbin/init`.
pub struct MockClient {
    calls: Mutex<Vec<ClientCall>>,
    pull_failures: Mutex<VecDeque<String>>,
    ping_failures: AtomicU32,
    containers: Mutex<HashMap<String, MockContainer>>,
    exec_handler: Mutex<Option<ExecHandler>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for MockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClient").finish_non_exhaustive()
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            pull_failures: Mutex::new(VecDeque::new()),
            ping_failures: AtomicU32::new(0),
            containers: Mutex::new(HashMap::new()),
            exec_handler: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make the next pulls fail with these messages, in order
    pub fn fail_pulls<I, S>(&self, reasons: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pull_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(reasons.into_iter().map(Into::into));
    }

    /// Make the next `count` pings fail
    pub fn fail_pings(&self, count: u32) {
        self.ping_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_exec_handler(&self, handler: ExecHandler) {
        *self.exec_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn pull_attempts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ClientCall::Pull { .. }))
            .count()
    }

    pub fn prune_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ClientCall::Prune { .. }))
            .count()
    }

    /// Commands executed in the given container, in order
    pub fn exec_commands(&self, container: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::Exec { container: id, cmd, .. } if id == container => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// Spec of a container that still exists, looked up by name or ID
    pub fn container_spec(&self, name_or_id: &str) -> Option<ContainerSpec> {
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers
            .values()
            .find(|c| c.id == name_or_id || c.spec.name == name_or_id)
            .map(|c| c.spec.clone())
    }

    /// Number of containers that still exist
    pub fn container_count(&self) -> usize {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn record(&self, call: ClientCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn with_container<T>(
        &self,
        name_or_id: &str,
        f: impl FnOnce(&mut MockContainer) -> T,
    ) -> Result<T> {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers
            .values_mut()
            .find(|c| c.id == name_or_id || c.spec.name == name_or_id)
            .map(f)
            .ok_or_else(|| AgentError::NotFound {
                container: name_or_id.to_string(),
                reason: "container not found".to_string(),
            })
    }

    fn default_exec(user: Option<&str>, cmd: &[String]) -> ExecOutput {
        let ok = |output: &str| ExecOutput {
            exit_code: 0,
            output: output.to_string(),
        };
        match cmd {
            [getent, passwd, name] if getent == "getent" && passwd == "passwd" => {
                if name == "root" {
                    ok("root:x:0:0:root:/root:/bin/bash\n")
                } else {
                    ok(&format!("{name}:x:1000:1000::/home/{name}:/bin/bash\n"))
                }
            }
            [cat, path] if cat == "cat" && path == "/etc/os-release" => {
                ok("NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n")
            }
            _ => {
                tracing::trace!(?user, ?cmd, "mock exec");
                ok("")
            }
        }
    }
}

#[async_trait::async_trait]
impl ContainerClient for MockClient {
    async fn ping(&self) -> Result<()> {
        self.record(ClientCall::Ping);
        let remaining = self.ping_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.ping_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AgentError::Runtime("daemon not ready".to_string()));
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()> {
        self.record(ClientCall::Pull {
            image: image.to_string(),
            authenticated: auth.is_some(),
        });
        let failure = self
            .pull_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match failure {
            Some(reason) => Err(pull_error(image, reason)),
            None => Ok(()),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(ClientCall::Create {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        if containers.values().any(|c| c.spec.name == spec.name) {
            return Err(AgentError::CreateFailed {
                id: spec.name.clone(),
                reason: "name already in use".to_string(),
            });
        }
        let id = format!("mock{:012x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(ClientCall::Start(id.to_string()));
        self.with_container(id, |c| c.running = true)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(ClientCall::Remove(id.to_string()));
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        let key = containers
            .values()
            .find(|c| c.id == id || c.spec.name == id)
            .map(|c| c.id.clone());
        match key {
            Some(key) => {
                containers.remove(&key);
                Ok(())
            }
            None => Err(AgentError::NotFound {
                container: id.to_string(),
                reason: "container not found".to_string(),
            }),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        self.record(ClientCall::Inspect(id.to_string()));
        self.with_container(id, |c| ContainerInfo {
            id: c.id.clone(),
            pid: c.running.then_some(4242),
            running: c.running,
            rootfs: Some(PathBuf::from(format!(
                "/var/lib/docker/overlay2/{}/merged",
                c.id
            ))),
        })
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecOutput> {
        self.record(ClientCall::Exec {
            container: id.to_string(),
            cmd: spec.cmd.clone(),
            user: spec.user.clone(),
            detach: spec.detach,
        });
        let running = self.with_container(id, |c| c.running)?;
        if !running {
            return Err(AgentError::Runtime(format!("container {id} is not running")));
        }

        let handler = self
            .exec_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            if let Some(result) = handler(id, spec) {
                return result;
            }
        }
        Ok(Self::default_exec(spec.user.as_deref(), &spec.cmd))
    }

    async fn prune_images(&self, dangling_only: bool) -> Result<u64> {
        self.record(ClientCall::Prune { dangling_only });
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_lifecycle() {
        let client = MockClient::new();
        let spec = ContainerSpec {
            name: "workspace".to_string(),
            image: "ubuntu:22.04".to_string(),
            ..Default::default()
        };

        client.pull_image("ubuntu:22.04", None).await.unwrap();
        let id = client.create_container(&spec).await.unwrap();
        client.start_container(&id).await.unwrap();

        let info = client.inspect_container("workspace").await.unwrap();
        assert!(info.running);
        assert_eq!(info.id, id);

        let passwd = client
            .exec_checked(&id, &ExecSpec::new(["getent", "passwd", "coder"]))
            .await
            .unwrap();
        assert!(passwd.starts_with("coder:x:1000:1000"));

        client.remove_container(&id).await.unwrap();
        assert!(client.inspect_container(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_pull_failures_are_classified() {
        let client = MockClient::new();
        client.fail_pulls(["write /var/lib/docker: no space left on device", "timeout"]);

        assert!(matches!(
            client.pull_image("ubuntu", None).await,
            Err(AgentError::DiskExhausted(_))
        ));
        assert!(matches!(
            client.pull_image("ubuntu", None).await,
            Err(AgentError::PullFailed { .. })
        ));
        client.pull_image("ubuntu", None).await.unwrap();
        assert_eq!(client.pull_attempts(), 3);
    }

    #[tokio::test]
    async fn test_exec_checked_reports_exit_code() {
        let client = MockClient::new();
        client.set_exec_handler(Arc::new(|_: &str, spec: &ExecSpec| {
            (spec.cmd[0] == "false").then(|| {
                Ok(ExecOutput {
                    exit_code: 1,
                    output: "nope".to_string(),
                })
            })
        }));
        let id = client
            .create_container(&ContainerSpec {
                name: "c".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        client.start_container(&id).await.unwrap();

        let err = client
            .exec_checked(&id, &ExecSpec::new(["false"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ExecFailed { code: 1, .. }));
    }
}
