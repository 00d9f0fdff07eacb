//! cvmbox Agent - Nested Workspace Supervisor
//!
//! Supervises the container runtime's daemons and builds the inner workspace
//! container: image pull, metadata probe, user-namespace ownership shifting,
//! GPU passthrough, CPU quota propagation and bootstrap.

pub mod cgroups;
pub mod config;
pub mod credentials;
pub mod daemons;
pub mod error;
pub mod gpu;
pub mod host;
pub mod idshift;
pub mod image;
pub mod pipeline;
pub mod process;
pub mod retry;
pub mod runtime;
pub mod runtimes;
pub mod workspace;

pub use cgroups::{CgroupVersion, CpuQuota, QuotaPropagator};
pub use config::{
    filter_env, parse_memory, parse_mounts, BuildConfig, Device, GpuConfig, Mount, ResourceLimits,
};
pub use credentials::{resolve_registry_auth, DockerConfigAuth};
pub use daemons::{
    wait_ready, DaemonCommand, DaemonConfig, DaemonSet, DiskSignal, StorageMode,
};
pub use error::*;
pub use gpu::{GpuLocator, GpuResources};
pub use host::{
    Filesystem, MemFilesystem, MockMounter, MountPoint, Mounter, OsFilesystem, OsMounter,
};
pub use idshift::NamespaceShifter;
pub use image::{probe_image, ImageMetadata};
pub use pipeline::{
    BuildPipeline, CvmHandle, LogReporter, PipelineDeps, PipelineSettings, ProgressReporter, Stage,
};
pub use process::{HeadTailBuffer, ManagedProcess, ProcessConfig, ProcessIdentity};
pub use retry::{BackoffConfig, RetryPolicy};
pub use runtime::*;
pub use workspace::{run_workspace, DaemonControl, ReadinessConfig};

#[cfg(feature = "docker")]
pub use runtimes::{DockerClient, DEFAULT_DOCKER_SOCKET};
