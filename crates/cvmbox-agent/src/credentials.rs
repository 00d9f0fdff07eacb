//! Registry credential resolution
//!
//! Credentials come from an explicit `user:password` pull secret, else from
//! the Docker config.json entry for the image's registry, else the pull is
//! anonymous.

use crate::error::{AgentError, Result};
use crate::host::Filesystem;
use crate::runtime::RegistryAuth;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::Path;

/// Registry that unqualified image references resolve to
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Docker config.json authentication entries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfigAuth {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Authentication entry in Docker config
#[derive(Debug, Clone, Deserialize)]
struct AuthEntry {
    /// Base64-encoded "username:password"
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl DockerConfigAuth {
    /// Read a config.json; a missing file yields an empty config
    pub fn load(fs: &dyn Filesystem, path: &Path) -> Result<Self> {
        let contents = match fs.read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(AgentError::io(path, e)),
        };
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| AgentError::Configuration(format!("Failed to parse Docker config: {e}")))
    }

    /// Credentials for a registry host, trying the `https://` and Docker Hub index spellings
    pub fn get_credentials(&self, registry: &str) -> Option<RegistryAuth> {
        let mut candidates = vec![registry.to_string(), format!("https://{registry}")];
        if registry == "docker.io" || registry == "registry-1.docker.io" {
            candidates.push("https://index.docker.io/v1/".to_string());
            candidates.push("index.docker.io".to_string());
        }

        candidates
            .iter()
            .find_map(|key| self.auths.get(key))
            .and_then(extract_credentials)
            .map(|(username, password)| RegistryAuth {
                username,
                password,
                server_address: Some(registry.to_string()),
            })
    }

    pub fn registries(&self) -> Vec<String> {
        self.auths.keys().cloned().collect()
    }
}

fn extract_credentials(entry: &AuthEntry) -> Option<(String, String)> {
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Some((username.clone(), password.clone()));
    }
    entry.auth.as_deref().and_then(decode_auth)
}

/// Decode base64-encoded "username:password"
fn decode_auth(auth: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD.decode(auth).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Registry host of an image reference
pub fn registry_host(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            first
        }
        _ => DEFAULT_REGISTRY,
    }
}

/// Parse an explicit `user:password` pull secret
pub fn parse_pull_secret(secret: &str, image: &str) -> Result<RegistryAuth> {
    match secret.split_once(':') {
        Some((username, password)) if !username.is_empty() => Ok(RegistryAuth {
            username: username.to_string(),
            password: password.to_string(),
            server_address: Some(registry_host(image).to_string()),
        }),
        _ => Err(AgentError::Configuration(
            "image pull secret must have the form user:password".to_string(),
        )),
    }
}

/// Pick the credentials for pulling `image`
pub fn resolve_registry_auth(
    fs: &dyn Filesystem,
    pull_secret: Option<&str>,
    docker_config: &Path,
    image: &str,
) -> Result<Option<RegistryAuth>> {
    if let Some(secret) = pull_secret.filter(|s| !s.is_empty()) {
        tracing::debug!(image = %image, "using explicit pull secret");
        return parse_pull_secret(secret, image).map(Some);
    }

    let registry = registry_host(image);
    let auth = DockerConfigAuth::load(fs, docker_config)?.get_credentials(registry);
    match &auth {
        Some(_) => tracing::debug!(registry = %registry, "using docker config credentials"),
        None => tracing::debug!(registry = %registry, "pulling anonymously"),
    }
    Ok(auth)
}
