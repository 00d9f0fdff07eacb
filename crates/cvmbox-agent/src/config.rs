//! Build inputs: the workspace description handed to one pipeline attempt

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default shift applied to uids/gids inside the inner container
pub const DEFAULT_NAMESPACE_OFFSET: u32 = 100_000;

/// Default name of the inner container
pub const DEFAULT_CONTAINER_NAME: &str = "workspace_cvm";

/// Host directory holding device nodes created for the inner container
pub const DEVICE_DIR: &str = "/var/lib/cvmbox/dev";

/// A bind mount between the host and the inner container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Path on the host
    pub source: PathBuf,
    /// Path inside the inner container
    pub mountpoint: PathBuf,
    /// Mounted read-only into the inner container
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn new(source: impl Into<PathBuf>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            mountpoint: mountpoint.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Docker bind syntax: `src:dst[:ro]`
    pub fn bind_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.source.display(), self.mountpoint.display());
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

/// A character device exposed to the inner container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub major: u64,
    pub minor: u64,
    /// cgroup device permissions, e.g. `rwm`
    pub permissions: String,
}

impl Device {
    /// TUN device for in-workspace networking (10:200)
    pub fn tun() -> Self {
        Self {
            host_path: Path::new(DEVICE_DIR).join("tun"),
            container_path: PathBuf::from("/dev/net/tun"),
            major: 10,
            minor: 200,
            permissions: "rwm".to_string(),
        }
    }

    /// FUSE device (10:229)
    pub fn fuse() -> Self {
        Self {
            host_path: Path::new(DEVICE_DIR).join("fuse"),
            container_path: PathBuf::from("/dev/fuse"),
            major: 10,
            minor: 229,
            permissions: "rwm".to_string(),
        }
    }
}

/// GPU passthrough settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Host directory scanned for GPU shared libraries
    #[serde(default = "default_usr_lib_dir")]
    pub host_lib_dir: PathBuf,
    /// Where those libraries are mounted inside the inner container (same path when unset)
    #[serde(default)]
    pub inner_lib_dir: Option<PathBuf>,
}

fn default_usr_lib_dir() -> PathBuf {
    PathBuf::from("/usr/lib/x86_64-linux-gnu")
}

/// CPU and memory limits applied to the inner container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Number of CPUs (fractional allowed)
    #[serde(default)]
    pub cpus: Option<f64>,
    /// Memory limit in bytes
    #[serde(default)]
    pub memory_bytes: Option<i64>,
}

/// Immutable input to one build attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Image reference for the workspace
    pub image: String,
    /// User the workspace runs as inside the image
    pub username: String,
    /// Token handed to the bootstrap script
    #[serde(skip_serializing)]
    pub agent_token: String,
    /// Names of outer environment variables forwarded to the inner container.
    /// A trailing `*` matches a prefix.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    /// Snapshot of the outer environment taken when the attempt was configured
    #[serde(default)]
    pub host_env: BTreeMap<String, String>,
    /// Declared bind mounts
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub gpu: GpuConfig,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Script run inside the inner container once it is up
    #[serde(default)]
    pub bootstrap_script: Option<String>,
    /// `user:password` credentials for the image registry
    #[serde(default, skip_serializing)]
    pub pull_secret: Option<String>,
    /// Docker config.json consulted when no pull secret is given
    #[serde(default = "default_docker_config")]
    pub docker_config: PathBuf,
    #[serde(default = "default_container_name")]
    pub container_name: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_offset")]
    pub namespace_offset: u32,
}

fn default_docker_config() -> PathBuf {
    PathBuf::from("/root/.docker/config.json")
}

fn default_container_name() -> String {
    DEFAULT_CONTAINER_NAME.to_string()
}

fn default_hostname() -> String {
    "cvmbox".to_string()
}

fn default_offset() -> u32 {
    DEFAULT_NAMESPACE_OFFSET
}

impl BuildConfig {
    /// Create a config with the required fields and defaults for everything else
    pub fn new(
        image: impl Into<String>,
        username: impl Into<String>,
        agent_token: impl Into<String>,
    ) -> Self {
        Self {
            image: image.into(),
            username: username.into(),
            agent_token: agent_token.into(),
            env_allowlist: Vec::new(),
            host_env: BTreeMap::new(),
            mounts: Vec::new(),
            gpu: GpuConfig {
                host_lib_dir: default_usr_lib_dir(),
                ..Default::default()
            },
            limits: ResourceLimits::default(),
            bootstrap_script: None,
            pull_secret: None,
            docker_config: default_docker_config(),
            container_name: default_container_name(),
            hostname: default_hostname(),
            namespace_offset: DEFAULT_NAMESPACE_OFFSET,
        }
    }

    /// Check the required fields before the pipeline starts
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("image", &self.image),
            ("username", &self.username),
            ("agent token", &self.agent_token),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(AgentError::Configuration(format!("{name} must be set")));
            }
        }
        if self.container_name.is_empty() {
            return Err(AgentError::Configuration(
                "container name must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Outer environment variables selected by the allow-list, as `KEY=VALUE`
    pub fn forwarded_env(&self) -> Vec<String> {
        filter_env(&self.host_env, &self.env_allowlist)
    }
}

/// Parse a comma separated `src:dst[:ro]` list
pub fn parse_mounts(raw: &str) -> Result<Vec<Mount>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').collect();
            match parts.as_slice() {
                [src, dst] if !src.is_empty() && !dst.is_empty() => Ok(Mount::new(*src, *dst)),
                [src, dst, "ro"] if !src.is_empty() && !dst.is_empty() => {
                    Ok(Mount::new(*src, *dst).read_only())
                }
                _ => Err(AgentError::Configuration(format!(
                    "invalid mount '{entry}', expected src:dst[:ro]"
                ))),
            }
        })
        .collect()
}

/// Select `KEY=VALUE` pairs whose key is allowed. `FOO_*` matches every key starting with `FOO_`.
pub fn filter_env(env: &BTreeMap<String, String>, allowlist: &[String]) -> Vec<String> {
    env.iter()
        .filter(|(key, _)| {
            allowlist.iter().any(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) => key.starts_with(prefix),
                None => key.as_str() == pattern.as_str(),
            })
        })
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Parse a memory string (e.g., "512Mi", "1G", "1048576") to bytes
pub fn parse_memory(memory: &str) -> Option<i64> {
    let memory = memory.trim();

    let split_idx = memory
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i);

    let Some(split_idx) = split_idx else {
        return memory.parse::<i64>().ok();
    };

    let (num_str, unit) = memory.split_at(split_idx);
    let num: f64 = num_str.parse().ok()?;

    let multiplier: i64 = match unit.to_uppercase().as_str() {
        "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GI" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TI" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => return None,
    };

    Some((num * multiplier as f64) as i64)
}
