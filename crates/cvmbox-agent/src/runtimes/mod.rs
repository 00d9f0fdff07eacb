//! Container runtime client implementations
//!
//! - **docker**: talks to the inner Docker daemon over its unix socket (bollard).
//!   Containers are created with the `sysbox-runc` OCI runtime.
//!
//! # Feature Flags
//!
//! - `docker`: Enables the Docker client (uses bollard crate)

#[cfg(feature = "docker")]
mod docker;

#[cfg(feature = "docker")]
pub use docker::{DockerClient, DEFAULT_DOCKER_SOCKET};
