//! Image reference parsing.
//!
//! Parses references like `localhost:5000/org/app:v1` into structured
//! components. A reference whose leading segment is not a host (no `.` or
//! `:`, not `localhost`) targets the local daemon.

use std::fmt;

use pack_core::error::{PackError, Result};

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Registry host used when a daemon-style name must be pulled or pushed.
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// Where a reference lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Registry {
    /// The local container daemon.
    Daemon,
    /// A remote registry host, with optional port.
    Remote(String),
}

impl Registry {
    pub fn host(&self) -> Option<&str> {
        match self {
            Registry::Daemon => None,
            Registry::Remote(host) => Some(host),
        }
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Registry::Daemon => write!(f, "daemon"),
            Registry::Remote(host) => write!(f, "{}", host),
        }
    }
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Daemon sentinel or registry host (e.g. "localhost:5000", "gcr.io")
    pub registry: Registry,
    /// Repository path (e.g. "org/node-app")
    pub repository: String,
    /// Tag (e.g. "latest", "v1")
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `node-app` → daemon, `node-app:latest`
    /// - `local/node-app:v1` → daemon, `local/node-app:v1`
    /// - `localhost:5000/org/app` → registry `localhost:5000`, `org/app:latest`
    /// - `gcr.io/org/app@sha256:abc...` → registry `gcr.io`, pinned by digest
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PackError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.split_once('@') {
            Some((name_tag, digest)) => {
                validate_digest(reference, digest)?;
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // Tag follows the last ':' after the last '/'
        let tag_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[tag_start..].rfind(':') {
            Some(colon) => {
                let split = tag_start + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if tag.is_some() && digest.is_some() {
            return Err(PackError::InvalidReference(format!(
                "'{}' has both a tag and a digest",
                reference
            )));
        }
        if let Some(tag) = &tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = split_registry_repository(reference, name)?;

        if registry == Registry::Daemon && digest.is_some() {
            return Err(PackError::InvalidReference(format!(
                "'{}' targets the local daemon and cannot carry a digest",
                reference
            )));
        }

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host and repository without tag or digest.
    pub fn name(&self) -> String {
        match &self.registry {
            Registry::Daemon => self.repository.clone(),
            Registry::Remote(host) => format!("{}/{}", host, self.repository),
        }
    }

    /// The tag or digest used in `/v2/<name>/manifests/<reference>`.
    pub fn tag_or_digest(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Canonical form for equality comparison: implicit parts made explicit.
    ///
    /// A digest pins the content, so any tag is dropped when one is present.
    pub fn canonical(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}@{}", self.name(), digest),
            None => format!(
                "{}:{}",
                self.name(),
                self.tag.as_deref().unwrap_or(DEFAULT_TAG)
            ),
        }
    }

    /// Map a daemon-style name onto Docker Hub for registry access.
    pub fn for_pull(&self) -> ImageReference {
        match self.registry {
            Registry::Remote(_) => self.clone(),
            Registry::Daemon => {
                let repository = if self.repository.contains('/') {
                    self.repository.clone()
                } else {
                    format!("library/{}", self.repository)
                };
                ImageReference {
                    registry: Registry::Remote(DOCKER_HUB_REGISTRY.to_string()),
                    repository,
                    tag: self.tag.clone(),
                    digest: self.digest.clone(),
                }
            }
        }
    }

    /// `name@digest`, the form reported after publication.
    pub fn with_digest(&self, digest: &str) -> String {
        format!("{}@{}", self.name(), digest)
    }

    /// Same repository pinned to `digest`. Registry references only.
    pub fn pinned(&self, digest: &str) -> ImageReference {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(reference: &str, name: &str) -> Result<(Registry, String)> {
    let (registry, repository) = match name.split_once('/') {
        // The first component is a registry when it looks like a hostname
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Registry::Remote(first.to_string()), rest)
        }
        _ => (Registry::Daemon, name),
    };

    if repository.is_empty() {
        return Err(PackError::InvalidReference(format!(
            "empty repository in reference '{}'",
            reference
        )));
    }
    for segment in repository.split('/') {
        if segment.is_empty() {
            return Err(PackError::InvalidReference(format!(
                "empty path component in reference '{}'",
                reference
            )));
        }
        let valid = segment.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
        });
        if !valid {
            return Err(PackError::InvalidReference(format!(
                "invalid repository component '{}' in reference '{}'",
                segment, reference
            )));
        }
    }
    if let Registry::Remote(host) = &registry {
        if host.ends_with(':') || host.starts_with(':') {
            return Err(PackError::InvalidReference(format!(
                "invalid registry host in reference '{}'",
                reference
            )));
        }
    }

    Ok((registry, repository.to_string()))
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(PackError::InvalidReference(format!(
            "invalid tag '{}' in reference '{}'",
            tag, reference
        )));
    }
    Ok(())
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    match digest.split_once(':') {
        Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => Ok(()),
        _ => Err(PackError::InvalidReference(format!(
            "invalid digest format in reference '{}': expected algorithm:hex",
            reference
        ))),
    }
}
