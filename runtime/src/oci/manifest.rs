//! Image manifest, index and config documents.
//!
//! Both Docker v2 schema 2 and OCI media types are accepted on read. Unknown
//! config fields are carried through untouched so a rewritten config differs
//! from its source only where we changed it.

use std::collections::BTreeMap;

use pack_core::error::{PackError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Manifest media types sent in `Accept`.
pub const MANIFEST_ACCEPT: &[&str] = &[
    DOCKER_MANIFEST_V2,
    OCI_MANIFEST,
    DOCKER_MANIFEST_LIST,
    OCI_INDEX,
];

/// `sha256:<hex>` of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            platform: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Docker v2 manifest over `config` and `layers`.
    pub fn docker(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(DOCKER_MANIFEST_V2.to_string()),
            config,
            layers,
        }
    }

    /// Media type to send on `PUT`.
    pub fn content_type(&self) -> &str {
        self.media_type.as_deref().unwrap_or(OCI_MANIFEST)
    }

    /// Layer media type matching this manifest's flavour.
    pub fn layer_media_type(&self) -> &'static str {
        if self.content_type() == DOCKER_MANIFEST_V2 {
            DOCKER_LAYER_GZIP
        } else {
            OCI_LAYER_GZIP
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Multi-platform index (OCI index or Docker manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Entry for `os`/`architecture`.
    pub fn select(&self, os: &str, architecture: &str) -> Option<&Descriptor> {
        self.manifests.iter().find(|d| {
            d.platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == architecture)
        })
    }
}

/// Either kind of manifest document.
#[derive(Debug, Clone)]
pub enum ManifestDocument {
    Image(ImageManifest),
    Index(ImageIndex),
}

impl ManifestDocument {
    /// Parse using the `Content-Type` when known, else the document's own fields.
    pub fn parse(content_type: Option<&str>, bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let media_type = content_type
            .map(|c| c.split(';').next().unwrap_or(c).trim().to_string())
            .filter(|c| !c.is_empty() && c != "application/json")
            .or_else(|| value["mediaType"].as_str().map(str::to_string));

        let is_index = match media_type.as_deref() {
            Some(DOCKER_MANIFEST_LIST) | Some(OCI_INDEX) => true,
            Some(DOCKER_MANIFEST_V2) | Some(OCI_MANIFEST) => false,
            _ => value.get("manifests").is_some(),
        };

        if is_index {
            Ok(ManifestDocument::Index(serde_json::from_value(value)?))
        } else {
            let mut manifest: ImageManifest = serde_json::from_value(value)?;
            if manifest.schema_version != 2 {
                return Err(PackError::Other(format!(
                    "unsupported manifest schema version {}",
                    manifest.schema_version
                )));
            }
            if manifest.media_type.is_none() {
                manifest.media_type = media_type;
            }
            Ok(ManifestDocument::Image(manifest))
        }
    }
}

/// Image configuration blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default)]
    pub config: ContainerConfig,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ImageConfig {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: impl Into<String>) {
        self.config
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.into());
    }

    /// Number of leading history entries that cover the first `layers` layers.
    ///
    /// Empty-layer entries trailing the last covered layer are included.
    pub fn history_covering(&self, layers: usize) -> usize {
        let mut seen = 0;
        for (i, entry) in self.history.iter().enumerate() {
            if entry.empty_layer {
                continue;
            }
            if seen == layers {
                return i;
            }
            seen += 1;
        }
        self.history.len()
    }
}

/// The runtime portion of an image config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ContainerConfig {
    /// Set `KEY=value`, replacing an existing entry for `KEY`.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let env = self.env.get_or_insert_with(Vec::new);
        let prefix = format!("{}=", key);
        let entry = format!("{}{}", prefix, value);
        match env.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(existing) => *existing = entry,
            None => env.push(entry),
        }
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}=", key);
        self.env
            .as_ref()?
            .iter()
            .find_map(|e| e.strip_prefix(prefix.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

impl RootFs {
    pub fn layers(diff_ids: Vec<String>) -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

impl History {
    pub fn layer(created: &str, created_by: impl Into<String>) -> Self {
        Self {
            created: Some(created.to_string()),
            created_by: Some(created_by.into()),
            comment: None,
            empty_layer: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "digest": "sha256:c0", "size": 10},
        "layers": [
            {"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": "sha256:l1", "size": 100}
        ]
    }"#;

    #[test]
    fn test_parse_docker_manifest() {
        match ManifestDocument::parse(Some(DOCKER_MANIFEST_V2), DOCKER_MANIFEST.as_bytes())
            .unwrap()
        {
            ManifestDocument::Image(m) => {
                assert_eq!(m.config.digest, "sha256:c0");
                assert_eq!(m.layers.len(), 1);
                assert_eq!(m.layer_media_type(), DOCKER_LAYER_GZIP);
            }
            ManifestDocument::Index(_) => panic!("expected image manifest"),
        }
    }

    #[test]
    fn test_parse_oci_manifest_without_media_type_field() {
        let body = r#"{"schemaVersion":2,"config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:c","size":1},"layers":[]}"#;
        match ManifestDocument::parse(Some(OCI_MANIFEST), body.as_bytes()).unwrap() {
            ManifestDocument::Image(m) => assert_eq!(m.content_type(), OCI_MANIFEST),
            ManifestDocument::Index(_) => panic!("expected image manifest"),
        }
    }

    #[test]
    fn test_parse_index_and_select() {
        let body = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:arm", "size": 1,
                 "platform": {"architecture": "arm64", "os": "linux"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:amd", "size": 1,
                 "platform": {"architecture": "amd64", "os": "linux"}}
            ]
        }"#;
        match ManifestDocument::parse(None, body.as_bytes()).unwrap() {
            ManifestDocument::Index(idx) => {
                assert_eq!(idx.select("linux", "amd64").unwrap().digest, "sha256:amd");
                assert!(idx.select("windows", "amd64").is_none());
            }
            ManifestDocument::Image(_) => panic!("expected index"),
        }
    }

    #[test]
    fn test_config_preserves_unknown_fields() {
        let body = r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["PATH=/bin"], "ExposedPorts": {"8080/tcp": {}}},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:d1"]},
            "container": "abc",
            "docker_version": "18.09"
        }"#;
        let config = ImageConfig::from_slice(body.as_bytes()).unwrap();
        assert!(config.extra.contains_key("docker_version"));
        assert!(config.config.extra.contains_key("ExposedPorts"));

        let again = ImageConfig::from_slice(&config.to_bytes().unwrap()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_labels() {
        let mut config = ImageConfig::default();
        assert!(config.label("io.buildpacks.stack.id").is_none());
        config.set_label("io.buildpacks.stack.id", "io.buildpacks.stacks.bionic");
        assert_eq!(
            config.label("io.buildpacks.stack.id"),
            Some("io.buildpacks.stacks.bionic")
        );
    }

    #[test]
    fn test_set_env_overrides() {
        let mut config = ContainerConfig::default();
        config.set_env("PATH", "/bin");
        config.set_env("HOME", "/root");
        config.set_env("PATH", "/usr/bin:/bin");
        assert_eq!(config.get_env("PATH"), Some("/usr/bin:/bin"));
        assert_eq!(config.env.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_history_covering_skips_empty_layers() {
        let mut config = ImageConfig::default();
        config.history = vec![
            History::layer("t", "ADD base"),
            History {
                empty_layer: true,
                ..History::default()
            },
            History::layer("t", "RUN apt-get"),
            History::layer("t", "app"),
        ];
        assert_eq!(config.history_covering(0), 0);
        assert_eq!(config.history_covering(1), 2);
        assert_eq!(config.history_covering(2), 3);
        assert_eq!(config.history_covering(3), 4);
        assert_eq!(config.history_covering(9), 4);
    }

    #[test]
    fn test_sha256_digest() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
