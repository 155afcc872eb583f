//! Labels written on application images.
//!
//! `io.buildpacks.lifecycle.metadata` carries what the next build and a
//! rebase need to know about an image:
//!
//! ```json
//! {
//!   "run-image": {"layers": 3, "reference": "localhost:5000/packs/run@sha256:..."},
//!   "launcher":  {"sha": "sha256:..."},
//!   "config":    {"sha": "sha256:..."},
//!   "app":       {"sha": "sha256:..."},
//!   "buildpacks": [
//!     {"id": "io.buildpacks.nodejs", "version": "1.0", "layers": {
//!       "node_modules": {"sha": "sha256:...", "data": {"lock": "abc"}}
//!     }}
//!   ]
//! }
//! ```
//!
//! Every `sha` is a diff-id.

use std::collections::BTreeMap;

use pack_core::error::{PackError, Result};
use serde::{Deserialize, Serialize};

use crate::oci::manifest::ImageConfig;

pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";
pub const LIFECYCLE_METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunImageMetadata {
    /// Number of leading image layers that came from the run image
    pub layers: usize,
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LayerMetadata {
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_digest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackLayerMetadata {
    pub sha: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackMetadata {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub layers: BTreeMap<String, BuildpackLayerMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LifecycleMetadata {
    pub run_image: RunImageMetadata,
    #[serde(default)]
    pub launcher: LayerMetadata,
    #[serde(default)]
    pub config: LayerMetadata,
    #[serde(default)]
    pub app: LayerMetadata,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackMetadata>,
}

impl LifecycleMetadata {
    pub fn from_label(label: &str) -> Result<Self> {
        serde_json::from_str(label).map_err(|e| {
            PackError::SerializationError(format!(
                "invalid {} label: {}",
                LIFECYCLE_METADATA_LABEL, e
            ))
        })
    }

    /// Metadata of an image config, `None` when the label is absent.
    pub fn from_config(config: &ImageConfig) -> Result<Option<Self>> {
        config
            .label(LIFECYCLE_METADATA_LABEL)
            .map(Self::from_label)
            .transpose()
    }

    pub fn to_label(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn buildpack_layer(&self, buildpack: &str, layer: &str) -> Option<&BuildpackLayerMetadata> {
        self.buildpacks
            .iter()
            .find(|bp| bp.id == buildpack)
            .and_then(|bp| bp.layers.get(layer))
    }
}

/// Convert a layer's `[metadata]` table to the JSON recorded in the label.
pub fn toml_to_json(table: &toml::Table) -> serde_json::Value {
    serde_json::to_value(table).unwrap_or(serde_json::Value::Null)
}

/// Convert recorded layer data back into a `[metadata]` table.
pub fn json_to_toml(value: &serde_json::Value) -> Option<toml::Table> {
    match value {
        serde_json::Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}
