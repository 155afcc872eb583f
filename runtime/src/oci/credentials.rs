//! Registry credentials.
//!
//! Credentials come from the Docker client config (`~/.docker/config.json`,
//! or `$DOCKER_CONFIG/config.json`) `auths` section, falling back to
//! `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, then anonymous access.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pack_core::error::{PackError, Result};
use serde::Deserialize;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    /// Docker config first, then env vars, then anonymous.
    pub fn resolve(registry: &str) -> Self {
        if let Ok(config) = DockerConfig::default_path() {
            match config.get(registry) {
                Ok(Some(auth)) => return auth,
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Ignoring unreadable docker config"),
            }
        }
        Self::from_env()
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }

    /// `Basic <base64(user:password)>`, when credentials are present.
    pub fn basic_header(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some(format!("Basic {}", BASE64.encode(format!("{}:{}", u, p)))),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Read-only view over the Docker client config.
pub struct DockerConfig {
    path: PathBuf,
}

impl DockerConfig {
    /// `$DOCKER_CONFIG/config.json` or `~/.docker/config.json`.
    pub fn default_path() -> Result<Self> {
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            return Ok(Self::new(PathBuf::from(dir).join("config.json")));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            PackError::Other("Cannot determine home directory for docker config".to_string())
        })?;
        Ok(Self::new(home.join(".docker").join("config.json")))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Credentials recorded for `registry`.
    pub fn get(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        let file = self.load()?;
        let wanted = normalize_registry(registry);
        let entry = file
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .map(|(_, entry)| entry);

        let Some(entry) = entry else {
            return Ok(None);
        };
        if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
            return Ok(Some(RegistryAuth::basic(u, p)));
        }
        match &entry.auth {
            Some(encoded) if !encoded.is_empty() => {
                let decoded = BASE64.decode(encoded.trim()).map_err(|e| {
                    PackError::Other(format!("invalid auth entry for {}: {}", registry, e))
                })?;
                let decoded = String::from_utf8(decoded).map_err(|e| {
                    PackError::Other(format!("invalid auth entry for {}: {}", registry, e))
                })?;
                let (u, p) = decoded.split_once(':').ok_or_else(|| {
                    PackError::Other(format!(
                        "invalid auth entry for {}: expected user:password",
                        registry
                    ))
                })?;
                Ok(Some(RegistryAuth::basic(u, p)))
            }
            _ => Ok(None),
        }
    }

    fn load(&self) -> Result<DockerConfigFile> {
        if !self.path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            PackError::Other(format!(
                "Failed to read docker config {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            PackError::Other(format!(
                "Failed to parse docker config {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Normalize registry names (e.g., "docker.io" and "https://index.docker.io/v1/" → "index.docker.io").
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    let r = r
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let r = r.split('/').next().unwrap_or(r);
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r.to_string()
    }
}
