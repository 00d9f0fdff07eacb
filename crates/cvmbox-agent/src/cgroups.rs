//! CPU quota propagation across cgroup versions
//!
//! The outer container's CPU limit lives in its own cgroup. The inner
//! container gets a fresh cgroup from the nested runtime, so the limit is
//! copied over after the inner container starts, translated between the v1
//! (`cpu.cfs_quota_us` + `cpu.cfs_period_us`) and v2 (`cpu.max`) layouts.

use crate::error::{AgentError, Result};
use crate::host::Filesystem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default cgroup mount point
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

const V1_CPU_DIR: &str = "cpu,cpuacct";
const V1_QUOTA_FILE: &str = "cpu.cfs_quota_us";
const V1_PERIOD_FILE: &str = "cpu.cfs_period_us";
const V2_MAX_FILE: &str = "cpu.max";

/// Cgroup hierarchy layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

/// A CPU bandwidth limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuQuota {
    /// Microseconds per period, -1 when unlimited
    pub quota: i64,
    /// Period length in microseconds
    pub period: u64,
    pub version: CgroupVersion,
}

impl CpuQuota {
    pub fn is_unlimited(&self) -> bool {
        self.quota < 0
    }
}

/// Parse a v2 `cpu.max` value (`"<quota|max> <period>"`) into quota and period
pub fn parse_cpu_max(raw: &str) -> Result<(i64, u64)> {
    let mut parts = raw.split_whitespace();
    let (Some(quota), Some(period), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(AgentError::Cgroup(format!("malformed cpu.max '{}'", raw.trim())));
    };

    let quota = if quota == "max" {
        -1
    } else {
        quota
            .parse::<i64>()
            .map_err(|_| AgentError::Cgroup(format!("invalid cpu.max quota '{quota}'")))?
    };
    let period = period
        .parse::<u64>()
        .map_err(|_| AgentError::Cgroup(format!("invalid cpu.max period '{period}'")))?;
    Ok((quota, period))
}

/// Render a quota and period as a v2 `cpu.max` value
pub fn format_cpu_max(quota: i64, period: u64) -> String {
    if quota < 0 {
        format!("max {period}")
    } else {
        format!("{quota} {period}")
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, file: &Path) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        AgentError::Cgroup(format!(
            "invalid value '{}' in {}",
            raw.trim(),
            file.display()
        ))
    })
}

/// Copies the host CPU quota into the inner container's cgroup
pub struct QuotaPropagator {
    fs: Arc<dyn Filesystem>,
    root: PathBuf,
}

impl QuotaPropagator {
    pub fn new(fs: Arc<dyn Filesystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    /// Probe which hierarchy the host uses; `None` when neither layout is present
    pub fn detect(&self) -> Option<CgroupVersion> {
        if self.fs.exists(&self.root.join(V2_MAX_FILE)) {
            Some(CgroupVersion::V2)
        } else if self
            .fs
            .exists(&self.root.join(V1_CPU_DIR).join(V1_QUOTA_FILE))
        {
            Some(CgroupVersion::V1)
        } else {
            None
        }
    }

    fn read(&self, path: &Path) -> Result<String> {
        self.fs
            .read_to_string(path)
            .map_err(|e| AgentError::Cgroup(format!("read {}: {e}", path.display())))
    }

    fn write(&self, path: &Path, value: &str) -> Result<()> {
        self.fs
            .write(path, value.as_bytes())
            .map_err(|e| AgentError::Cgroup(format!("write {}: {e}", path.display())))
    }

    /// The host's own CPU quota
    pub fn read_host_quota(&self, version: CgroupVersion) -> Result<CpuQuota> {
        match version {
            CgroupVersion::V1 => {
                let dir = self.root.join(V1_CPU_DIR);
                let quota_path = dir.join(V1_QUOTA_FILE);
                let period_path = dir.join(V1_PERIOD_FILE);
                Ok(CpuQuota {
                    quota: parse_number(&self.read(&quota_path)?, &quota_path)?,
                    period: parse_number(&self.read(&period_path)?, &period_path)?,
                    version,
                })
            }
            CgroupVersion::V2 => {
                let (quota, period) = parse_cpu_max(&self.read(&self.root.join(V2_MAX_FILE))?)?;
                Ok(CpuQuota {
                    quota,
                    period,
                    version,
                })
            }
        }
    }

    /// Cgroup directory the nested runtime creates for container `id`
    pub fn container_dir(&self, version: CgroupVersion, id: &str) -> PathBuf {
        match version {
            CgroupVersion::V1 => self
                .root
                .join(V1_CPU_DIR)
                .join("docker")
                .join(id)
                .join("syscont-cgroup-root"),
            CgroupVersion::V2 => self.root.join("docker").join(id).join("init.scope"),
        }
    }

    pub fn write_container_quota(&self, id: &str, quota: &CpuQuota) -> Result<()> {
        let dir = self.container_dir(quota.version, id);
        match quota.version {
            CgroupVersion::V1 => {
                self.write(&dir.join(V1_PERIOD_FILE), &quota.period.to_string())?;
                self.write(&dir.join(V1_QUOTA_FILE), &quota.quota.to_string())
            }
            CgroupVersion::V2 => self.write(
                &dir.join(V2_MAX_FILE),
                &format_cpu_max(quota.quota, quota.period),
            ),
        }
    }

    /// Copy the host quota to container `id`
    ///
    /// Returns `None` when the host exposes no CPU controller files.
    pub fn propagate(&self, id: &str) -> Result<Option<CpuQuota>> {
        let Some(version) = self.detect() else {
            tracing::warn!(root = %self.root.display(), "no cpu cgroup files found, skipping quota");
            return Ok(None);
        };

        let quota = self.read_host_quota(version)?;
        self.write_container_quota(id, &quota)?;
        tracing::info!(
            container = %id,
            version = ?version,
            quota = quota.quota,
            period = quota.period,
            "propagated cpu quota"
        );
        Ok(Some(quota))
    }
}
