//! GPU resource discovery
//!
//! GPUs reach the outer container as device nodes, driver bind mounts and
//! shared libraries put there by the host's GPU runtime. This module finds
//! all three so they can be passed on to the inner container:
//!
//! - host mounts whose path matches `nvidia|vulkan|cuda` become devices when
//!   under `/dev/`, bind mounts otherwise
//! - GPU shared libraries in the host library directory are bind-mounted
//!   read-only together with every link of their symlink chain
//! - `NVIDIA*` environment variables are forwarded

use crate::config::{Device, Mount};
use crate::error::{AgentError, Result};
use crate::host::{FileKind, Filesystem, MountPoint, Mounter};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

static GPU_MOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)nvidia|vulkan|cuda").expect("valid regex"));

static GPU_LIB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)libgl(e|sx|\.)|nvidia|vulkan|cuda").expect("valid regex")
});

static GPU_ENV_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)nvidia").expect("valid regex"));

/// Upper bound on symlink hops followed for one library
const MAX_SYMLINK_DEPTH: usize = 40;

/// Everything the inner container needs to use the host GPUs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuResources {
    pub devices: Vec<Device>,
    pub mounts: Vec<Mount>,
    /// `KEY=VALUE` pairs
    pub env: Vec<String>,
}

/// Whether a host mount point belongs to the GPU runtime
pub fn is_gpu_mount(path: &Path) -> bool {
    GPU_MOUNT_RE.is_match(&path.to_string_lossy())
}

/// Whether a library path names a GPU library
pub fn is_gpu_library(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    let is_shared_object = name.ends_with(".so") || name.contains(".so.");
    is_shared_object && GPU_LIB_RE.is_match(&path.to_string_lossy())
}

/// GPU environment variables from the outer environment, as `KEY=VALUE`
pub fn gpu_env(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .filter(|(key, _)| GPU_ENV_RE.is_match(key))
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Discovers GPU devices, mounts and libraries on the host
pub struct GpuLocator {
    fs: Arc<dyn Filesystem>,
    mounter: Arc<dyn Mounter>,
    host_lib_dir: PathBuf,
    inner_lib_dir: Option<PathBuf>,
}

impl GpuLocator {
    pub fn new(
        fs: Arc<dyn Filesystem>,
        mounter: Arc<dyn Mounter>,
        host_lib_dir: impl Into<PathBuf>,
        inner_lib_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            fs,
            mounter,
            host_lib_dir: host_lib_dir.into(),
            inner_lib_dir,
        }
    }

    /// Host mounts belonging to the GPU runtime
    pub fn gpu_mounts(&self) -> Result<Vec<MountPoint>> {
        let mounts = self
            .mounter
            .list()
            .map_err(|e| AgentError::io("/proc/self/mountinfo", e))?;
        Ok(mounts.into_iter().filter(|m| is_gpu_mount(&m.path)).collect())
    }

    /// Split GPU mounts into device nodes and bind mounts
    pub fn classify_mounts(&self, mounts: &[MountPoint]) -> (Vec<Device>, Vec<Mount>) {
        let mut devices = Vec::new();
        let mut binds = Vec::new();

        for mount in mounts.iter().filter(|m| is_gpu_mount(&m.path)) {
            if mount.path.starts_with("/dev") {
                match self.fs.stat(&mount.path) {
                    Ok(stat) if stat.kind == FileKind::CharDevice => devices.push(Device {
                        host_path: mount.path.clone(),
                        container_path: mount.path.clone(),
                        major: nix::sys::stat::major(stat.rdev),
                        minor: nix::sys::stat::minor(stat.rdev),
                        permissions: "rwm".to_string(),
                    }),
                    Ok(stat) => tracing::debug!(
                        path = %mount.path.display(),
                        kind = ?stat.kind,
                        "skipping non-device gpu mount under /dev"
                    ),
                    Err(e) => tracing::warn!(
                        path = %mount.path.display(),
                        error = %e,
                        "cannot stat gpu device"
                    ),
                }
            } else {
                let mut bind = Mount::new(&mount.path, &mount.path);
                bind.read_only = mount.options.iter().any(|o| o == "ro");
                binds.push(bind);
            }
        }

        (devices, binds)
    }

    /// Every path of the symlink chain starting at `path`, bounded to the library root
    pub fn symlink_chain(&self, path: &Path) -> Vec<PathBuf> {
        let root = &self.host_lib_dir;
        let mut chain = vec![path.to_path_buf()];
        let mut seen: HashSet<PathBuf> = chain.iter().cloned().collect();
        let mut current = path.to_path_buf();

        for _ in 0..MAX_SYMLINK_DEPTH {
            let is_link = matches!(self.fs.stat(&current), Ok(s) if s.kind == FileKind::Symlink);
            if !is_link {
                break;
            }
            let Ok(target) = self.fs.read_link(&current) else {
                break;
            };
            let target = if target.is_absolute() {
                normalize(&target)
            } else {
                let parent = current.parent().unwrap_or(root);
                normalize(&parent.join(target))
            };

            if !target.starts_with(root) {
                tracing::debug!(
                    link = %current.display(),
                    target = %target.display(),
                    "symlink leaves library dir"
                );
                break;
            }
            if !seen.insert(target.clone()) {
                tracing::warn!(link = %current.display(), "symlink cycle");
                break;
            }
            chain.push(target.clone());
            current = target;
        }
        chain
    }

    fn inner_path(&self, host_path: &Path) -> PathBuf {
        match (&self.inner_lib_dir, host_path.strip_prefix(&self.host_lib_dir)) {
            (Some(inner), Ok(relative)) => inner.join(relative),
            _ => host_path.to_path_buf(),
        }
    }

    /// Read-only bind mounts for every GPU library and its symlink chain, without duplicates
    pub fn library_mounts(&self) -> Result<Vec<Mount>> {
        let entries = self
            .fs
            .walk(&self.host_lib_dir)
            .map_err(|e| AgentError::io(&self.host_lib_dir, e))?;

        let mut seen = HashSet::new();
        let mut mounts = Vec::new();
        for entry in entries.iter().filter(|p| is_gpu_library(p)) {
            for link in self.symlink_chain(entry) {
                if seen.insert(link.clone()) {
                    let mountpoint = self.inner_path(&link);
                    mounts.push(Mount::new(link, mountpoint).read_only());
                }
            }
        }
        Ok(mounts)
    }

    /// Devices, mounts and environment for passing the host GPUs through
    pub fn locate(&self, host_env: &BTreeMap<String, String>) -> Result<GpuResources> {
        let (devices, mut mounts) = self.classify_mounts(&self.gpu_mounts()?);

        let libraries = self.library_mounts()?;
        for library in libraries {
            if !mounts.iter().any(|m| m.source == library.source) {
                mounts.push(library);
            }
        }

        let resources = GpuResources {
            devices,
            mounts,
            env: gpu_env(host_env),
        };
        tracing::info!(
            devices = resources.devices.len(),
            mounts = resources.mounts.len(),
            env = resources.env.len(),
            "located gpu resources"
        );
        Ok(resources)
    }
}
