//! Image introspection through an ephemeral probe container

use crate::error::{AgentError, Result};
use crate::runtime::{ContainerClient, ContainerSpec, ExecSpec};
use std::path::PathBuf;

/// OS release ID reported when the image has no usable `/etc/os-release`
pub const FALLBACK_OS_RELEASE: &str = "linux";

/// Facts about the workspace image the rest of the build depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub uid: u32,
    pub gid: u32,
    pub home_dir: PathBuf,
    /// The image ships `/sbin/init`
    pub has_init: bool,
    pub os_release_id: String,
}

/// A parsed `/etc/passwd` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home_dir: PathBuf,
    pub shell: String,
}

/// Parse one `name:x:uid:gid:gecos:home:shell` line
pub fn parse_passwd_entry(line: &str) -> Result<PasswdEntry> {
    let line = line.trim();
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != 7 {
        return Err(AgentError::Metadata(format!(
            "malformed passwd entry '{line}': expected 7 fields, got {}",
            fields.len()
        )));
    }

    let id = |field: &str, what: &str| {
        field
            .parse::<u32>()
            .map_err(|_| AgentError::Metadata(format!("invalid {what} '{field}' in passwd entry")))
    };

    Ok(PasswdEntry {
        name: fields[0].to_string(),
        uid: id(fields[2], "uid")?,
        gid: id(fields[3], "gid")?,
        home_dir: PathBuf::from(fields[5]),
        shell: fields[6].to_string(),
    })
}

/// `ID` field of an os-release file
pub fn parse_os_release(contents: &str) -> String {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("ID="))
        .map(|id| id.trim().trim_matches(['"', '\'']).to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| FALLBACK_OS_RELEASE.to_string())
}

/// Start a throwaway container from `image` and read the user, init and OS facts out of it
///
/// The probe container is removed whether or not probing succeeds.
pub async fn probe_image(
    client: &dyn ContainerClient,
    image: &str,
    username: &str,
    probe_name: &str,
) -> Result<ImageMetadata> {
    // Leftover from an interrupted attempt
    if client.remove_container(probe_name).await.is_ok() {
        tracing::debug!(container = %probe_name, "removed stale probe container");
    }

    let spec = ContainerSpec {
        name: probe_name.to_string(),
        image: image.to_string(),
        entrypoint: vec!["sleep".to_string()],
        cmd: vec!["infinity".to_string()],
        user: Some("0".to_string()),
        ..Default::default()
    };
    let id = client.create_container(&spec).await?;

    let result = read_metadata(client, &id, username).await;

    if let Err(e) = client.remove_container(&id).await {
        tracing::warn!(container = %id, error = %e, "failed to remove probe container");
    }
    result
}

async fn read_metadata(
    client: &dyn ContainerClient,
    id: &str,
    username: &str,
) -> Result<ImageMetadata> {
    client.start_container(id).await?;

    let has_init = client
        .exec(id, &ExecSpec::new(["stat", "/sbin/init"]))
        .await
        .map(|out| out.exit_code == 0)?;

    let passwd = client
        .exec(id, &ExecSpec::new(["getent", "passwd", username]))
        .await?;
    if passwd.exit_code != 0 || passwd.output.trim().is_empty() {
        return Err(AgentError::Metadata(format!(
            "user '{username}' does not exist in the image"
        )));
    }
    let entry = parse_passwd_entry(passwd.output.lines().next().unwrap_or_default())?;

    let os_release_id = match client
        .exec(id, &ExecSpec::new(["cat", "/etc/os-release"]))
        .await
    {
        Ok(out) if out.exit_code == 0 => parse_os_release(&out.output),
        Ok(out) => {
            tracing::warn!(exit_code = out.exit_code, "could not read /etc/os-release");
            FALLBACK_OS_RELEASE.to_string()
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not read /etc/os-release");
            FALLBACK_OS_RELEASE.to_string()
        }
    };

    let metadata = ImageMetadata {
        uid: entry.uid,
        gid: entry.gid,
        home_dir: entry.home_dir,
        has_init,
        os_release_id,
    };
    tracing::info!(
        uid = metadata.uid,
        gid = metadata.gid,
        home = %metadata.home_dir.display(),
        has_init = metadata.has_init,
        os = %metadata.os_release_id,
        "probed image"
    );
    Ok(metadata)
}
