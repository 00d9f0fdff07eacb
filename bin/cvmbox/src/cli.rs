//! Command line definitions
//!
//! Every `docker` flag can also be set through its `CVMBOX_*` environment
//! variable, which is how the outer container is normally configured.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use cvmbox_agent::config::{DEFAULT_CONTAINER_NAME, DEFAULT_NAMESPACE_OFFSET};
use cvmbox_agent::{parse_memory, parse_mounts, BuildConfig, GpuConfig, ResourceLimits};
use cvmbox_observability::{LogFormat, LoggingConfig, DEFAULT_TERMINATION_LOG};

/// Run a workspace image as a nested system container
#[derive(Parser)]
#[command(name = "cvmbox", version, about, long_about = None)]
pub struct Cli {
    /// Console log format: pretty, json or compact
    #[arg(long, env = "CVMBOX_LOG_FORMAT", default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Log filter directives (RUST_LOG syntax; RUST_LOG itself wins)
    #[arg(long, env = "CVMBOX_LOG_FILTER", global = true)]
    pub log_filter: Option<String>,

    /// File receiving the final error message
    #[arg(long, env = "CVMBOX_TERMINATION_LOG", default_value = DEFAULT_TERMINATION_LOG, global = true)]
    pub termination_log: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the runtime daemons and build the workspace container
    Docker(DockerArgs),
}

#[derive(Args)]
pub struct DockerArgs {
    /// Workspace image reference
    #[arg(long, env = "CVMBOX_IMAGE")]
    pub image: String,

    /// User the workspace runs as
    #[arg(long, env = "CVMBOX_USERNAME")]
    pub username: String,

    /// Token handed to the bootstrap script
    #[arg(long, env = "CVMBOX_AGENT_TOKEN", hide_env_values = true)]
    pub agent_token: String,

    /// Bind mounts as `src:dst[:ro]`, comma separated
    #[arg(long, env = "CVMBOX_MOUNTS")]
    pub mounts: Option<String>,

    /// Outer environment variables to forward, comma separated; `PREFIX*` matches a prefix
    #[arg(long, env = "CVMBOX_INNER_ENVS")]
    pub inner_envs: Option<String>,

    /// Pass the host GPUs through
    #[arg(long, env = "CVMBOX_ADD_GPU")]
    pub add_gpu: bool,

    /// Host directory searched for GPU libraries
    #[arg(long, env = "CVMBOX_USR_LIB_DIR", default_value = "/usr/lib/x86_64-linux-gnu")]
    pub usr_lib_dir: PathBuf,

    /// Where GPU libraries are mounted inside the workspace
    #[arg(long, env = "CVMBOX_INNER_USR_LIB_DIR")]
    pub inner_usr_lib_dir: Option<PathBuf>,

    /// CPU limit for the workspace
    #[arg(long, env = "CVMBOX_CPUS")]
    pub cpus: Option<f64>,

    /// Memory limit for the workspace (`512Mi`, `2G`, bytes)
    #[arg(long, env = "CVMBOX_MEMORY")]
    pub memory: Option<String>,

    /// Registry credentials as `user:password`
    #[arg(long, env = "CVMBOX_IMAGE_PULL_SECRET", hide_env_values = true)]
    pub image_pull_secret: Option<String>,

    /// Docker config.json consulted for registry credentials
    #[arg(long, env = "CVMBOX_DOCKER_CONFIG", default_value = "/root/.docker/config.json")]
    pub docker_config: PathBuf,

    /// Script run inside the workspace once it is up
    #[arg(long, env = "CVMBOX_BOOTSTRAP")]
    pub bootstrap: Option<String>,

    /// Endpoint receiving build output
    #[arg(long, env = "CVMBOX_BUILD_LOG_URL")]
    pub build_log_url: Option<String>,

    /// Hostname of the workspace container
    #[arg(long, env = "CVMBOX_HOSTNAME", default_value = "cvmbox")]
    pub hostname: String,

    /// Name of the workspace container
    #[arg(long, env = "CVMBOX_CONTAINER_NAME", default_value = DEFAULT_CONTAINER_NAME)]
    pub container_name: String,

    /// Host uid that maps to root inside the workspace
    #[arg(long, env = "CVMBOX_NAMESPACE_OFFSET", default_value_t = DEFAULT_NAMESPACE_OFFSET)]
    pub namespace_offset: u32,

    /// Socket of the inner dockerd
    #[arg(long, env = "CVMBOX_DOCKER_SOCKET", default_value = cvmbox_agent::DEFAULT_DOCKER_SOCKET)]
    pub docker_socket: PathBuf,

    /// Seconds to wait for dockerd to answer
    #[arg(long, env = "CVMBOX_READY_TIMEOUT", default_value_t = 60)]
    pub ready_timeout: u64,
}

impl Cli {
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            format: self.log_format,
            filter_directives: self.log_filter.clone(),
            termination_log: Some(self.termination_log.clone()),
            ..Default::default()
        }
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

impl DockerArgs {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout)
    }

    /// Build configuration from the flags and a snapshot of the outer environment
    pub fn build_config(&self, host_env: BTreeMap<String, String>) -> Result<BuildConfig> {
        let mounts = match self.mounts.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                parse_mounts(raw).context("Invalid --mounts")?
            }
            _ => Vec::new(),
        };

        let memory_bytes = match self.memory.as_deref() {
            Some(raw) => match parse_memory(raw) {
                Some(bytes) => Some(bytes),
                None => bail!("Invalid --memory value '{raw}'"),
            },
            None => None,
        };
        if let Some(cpus) = self.cpus {
            if cpus <= 0.0 {
                bail!("--cpus must be positive, got {cpus}");
            }
        }

        let mut config = BuildConfig::new(&self.image, &self.username, &self.agent_token);
        config.mounts = mounts;
        config.env_allowlist = split_list(self.inner_envs.as_deref());
        config.host_env = host_env;
        config.gpu = GpuConfig {
            enabled: self.add_gpu,
            host_lib_dir: self.usr_lib_dir.clone(),
            inner_lib_dir: self.inner_usr_lib_dir.clone(),
        };
        config.limits = ResourceLimits {
            cpus: self.cpus,
            memory_bytes,
        };
        config.bootstrap_script = self.bootstrap.clone().filter(|s| !s.trim().is_empty());
        config.pull_secret = self.image_pull_secret.clone().filter(|s| !s.is_empty());
        config.docker_config = self.docker_config.clone();
        config.container_name = self.container_name.clone();
        config.hostname = self.hostname.clone();
        config.namespace_offset = self.namespace_offset;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> DockerArgs {
        let cli = Cli::try_parse_from(
            ["cvmbox", "docker", "--image", "ubuntu:22.04", "--username", "coder", "--agent-token", "t"]
                .iter()
                .chain(args),
        )
        .unwrap();
        match cli.command {
            Commands::Docker(args) => args,
        }
    }

    #[test]
    fn test_build_config_from_flags() {
        let args = parse(&[
            "--mounts",
            "/home/coder:/home/coder,/data:/data:ro",
            "--inner-envs",
            "EDITOR, CODER_*",
            "--memory",
            "2Gi",
            "--cpus",
            "1.5",
            "--add-gpu",
        ]);
        let env = BTreeMap::from([("EDITOR".to_string(), "vim".to_string())]);
        let config = args.build_config(env).unwrap();

        assert_eq!(config.mounts.len(), 2);
        assert!(config.mounts[1].read_only);
        assert_eq!(config.env_allowlist, vec!["EDITOR", "CODER_*"]);
        assert_eq!(config.limits.memory_bytes, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(config.limits.cpus, Some(1.5));
        assert!(config.gpu.enabled);
        assert_eq!(config.forwarded_env(), vec!["EDITOR=vim"]);
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        let config = args.build_config(BTreeMap::new()).unwrap();
        assert_eq!(config.container_name, DEFAULT_CONTAINER_NAME);
        assert_eq!(config.hostname, "cvmbox");
        assert!(config.mounts.is_empty());
        assert!(config.bootstrap_script.is_none());
        assert_eq!(args.docker_socket, PathBuf::from("/var/run/docker.sock"));
    }

    #[test]
    fn test_invalid_memory_is_rejected() {
        let args = parse(&["--memory", "lots"]);
        assert!(args.build_config(BTreeMap::new()).is_err());
    }
}
