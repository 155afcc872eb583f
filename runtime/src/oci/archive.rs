//! Docker image archives (`docker save` / `docker load` format).
//!
//! ```text
//! manifest.json             [{"Config": "<id>.json", "RepoTags": [...], "Layers": [...]}]
//! <id>.json                 image config
//! <diff-id hex>/layer.tar   uncompressed layer
//! ```

use std::collections::HashMap;
use std::io::Read;

use bytes::Bytes;
use flate2::read::GzDecoder;
use pack_core::error::{PackError, Result};
use serde::{Deserialize, Serialize};

use super::layers::NORMALIZED_MTIME;
use super::manifest::{sha256_digest, ImageConfig};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// An image held as config plus uncompressed layer tars.
#[derive(Debug, Clone)]
pub struct DockerArchive {
    pub config: ImageConfig,
    pub repo_tags: Vec<String>,
    /// Uncompressed tars in `config.rootfs.diff_ids` order
    pub layers: Vec<Bytes>,
}

impl DockerArchive {
    pub fn new(config: ImageConfig, layers: Vec<Bytes>) -> Self {
        Self {
            config,
            repo_tags: Vec::new(),
            layers,
        }
    }

    /// Parse an archive, verifying each layer against its diff-id.
    pub fn read(data: &[u8]) -> Result<Self> {
        let mut files: HashMap<String, Vec<u8>> = HashMap::new();
        let mut archive = tar::Archive::new(data);
        let entries = archive
            .entries()
            .map_err(|e| PackError::Other(format!("Failed to read image archive: {}", e)))?;
        for entry in entries {
            let mut entry = entry
                .map_err(|e| PackError::Other(format!("Failed to read image archive: {}", e)))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry
                .path()
                .map_err(|e| PackError::Other(format!("Invalid archive path: {}", e)))?
                .to_string_lossy()
                .trim_start_matches("./")
                .to_string();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            files.insert(path, contents);
        }

        let index = files
            .get("manifest.json")
            .ok_or_else(|| PackError::Other("image archive has no manifest.json".to_string()))?;
        let entries: Vec<ArchiveEntry> = serde_json::from_slice(index)?;
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| PackError::Other("image archive manifest is empty".to_string()))?;

        let config_bytes = files.get(&entry.config).ok_or_else(|| {
            PackError::Other(format!("image archive is missing {}", entry.config))
        })?;
        let config = ImageConfig::from_slice(config_bytes)?;
        if config.rootfs.diff_ids.len() != entry.layers.len() {
            return Err(PackError::Other(format!(
                "image archive lists {} layers for {} diff-ids",
                entry.layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }

        let mut layers = Vec::with_capacity(entry.layers.len());
        for (path, diff_id) in entry.layers.iter().zip(&config.rootfs.diff_ids) {
            let raw = files.get(path).ok_or_else(|| {
                PackError::Other(format!("image archive is missing layer {}", path))
            })?;
            let tar = if raw.starts_with(&[0x1f, 0x8b]) {
                let mut out = Vec::new();
                GzDecoder::new(&raw[..]).read_to_end(&mut out)?;
                out
            } else {
                raw.clone()
            };
            let actual = sha256_digest(&tar);
            if &actual != diff_id {
                return Err(PackError::Other(format!(
                    "layer {} does not match diff-id {} (got {})",
                    path, diff_id, actual
                )));
            }
            layers.push(Bytes::from(tar));
        }

        Ok(Self {
            config,
            repo_tags: entry.repo_tags.unwrap_or_default(),
            layers,
        })
    }

    /// Serialize to a loadable archive tagged with `repo_tags`.
    pub fn write(&self) -> Result<Vec<u8>> {
        let config_bytes = self.config.to_bytes()?;
        let config_digest = sha256_digest(&config_bytes);
        let image_hex = hex_of(&config_digest);
        let config_name = format!("{}.json", image_hex);

        let mut builder = tar::Builder::new(Vec::new());
        let mut layer_paths = Vec::with_capacity(self.layers.len());
        for (layer, diff_id) in self.layers.iter().zip(&self.config.rootfs.diff_ids) {
            let path = format!("{}/layer.tar", hex_of(diff_id));
            if !layer_paths.contains(&path) {
                append(&mut builder, &path, layer)?;
            }
            layer_paths.push(path);
        }
        append(&mut builder, &config_name, &config_bytes)?;

        let index = vec![ArchiveEntry {
            config: config_name,
            repo_tags: Some(self.repo_tags.clone()),
            layers: layer_paths,
        }];
        append(&mut builder, "manifest.json", &serde_json::to_vec(&index)?)?;

        builder
            .into_inner()
            .map_err(|e| PackError::Other(format!("Failed to finalize image archive: {}", e)))
    }

    /// Daemon image id: `sha256:` of the serialized config.
    pub fn image_id(&self) -> Result<String> {
        Ok(sha256_digest(&self.config.to_bytes()?))
    }
}

fn hex_of(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, contents: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(NORMALIZED_MTIME);
    builder
        .append_data(&mut header, path, contents)
        .map_err(|e| PackError::Other(format!("Failed to write {} to image archive: {}", path, e)))
}
