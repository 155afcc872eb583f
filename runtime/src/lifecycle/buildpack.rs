//! Builder metadata and buildpack group selection inputs.

use std::cmp::Ordering;

use pack_core::error::{PackError, Result};
use serde::{Deserialize, Serialize};

use crate::log::{Phase, PhaseLog};

/// Label on the build image describing its buildpacks and detection order.
pub const BUILDER_METADATA_LABEL: &str = "io.buildpacks.builder.metadata";

/// Fallback detection order shipped inside the build image.
pub const ORDER_TOML_PATH: &str = "/buildpacks/order.toml";

/// A buildpack as listed by the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackInfo {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub latest: bool,
}

/// `id@version` reference inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackRef {
    pub id: String,
    pub version: String,
}

impl BuildpackRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Directory of the buildpack inside the build image.
    pub fn dir(&self) -> String {
        format!("/buildpacks/{}/{}", escape_id(&self.id), self.version)
    }

    /// Directory of the buildpack's layers under `/layers`.
    pub fn layers_dir(&self) -> String {
        format!("/layers/{}", escape_id(&self.id))
    }
}

/// Buildpack ids may contain `/`, which cannot appear in a path segment.
pub fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub buildpacks: Vec<BuildpackRef>,
}

/// Buildpacks and ordered groups offered by a builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderMetadata {
    #[serde(default)]
    pub buildpacks: Vec<BuildpackInfo>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl BuilderMetadata {
    pub fn from_label(label: &str) -> Result<Self> {
        serde_json::from_str(label).map_err(|e| {
            PackError::InvalidInput(format!("invalid {} label: {}", BUILDER_METADATA_LABEL, e))
        })
    }

    /// Groups from an `order.toml`; buildpack names fall back to ids.
    pub fn from_order_toml(contents: &str) -> Result<Self> {
        let order: Self = toml::from_str(contents)
            .map_err(|e| PackError::InvalidInput(format!("invalid order.toml: {}", e)))?;
        let mut buildpacks: Vec<BuildpackInfo> = Vec::new();
        for bp in order.groups.iter().flat_map(|g| &g.buildpacks) {
            if !buildpacks
                .iter()
                .any(|b| b.id == bp.id && b.version == bp.version)
            {
                buildpacks.push(BuildpackInfo {
                    id: bp.id.clone(),
                    version: bp.version.clone(),
                    name: None,
                    latest: false,
                });
            }
        }
        Ok(Self {
            buildpacks,
            groups: order.groups,
        })
    }

    /// Display name used in the detect summary.
    pub fn display_name(&self, bp: &BuildpackRef) -> String {
        self.buildpacks
            .iter()
            .find(|b| b.id == bp.id && b.version == bp.version)
            .and_then(|b| b.name.clone())
            .unwrap_or_else(|| bp.id.clone())
    }

    /// Version that `@latest` stands for: the flagged entry, else the highest.
    pub fn latest_version(&self, id: &str) -> Option<&str> {
        let candidates: Vec<&BuildpackInfo> =
            self.buildpacks.iter().filter(|b| b.id == id).collect();
        if let Some(flagged) = candidates.iter().find(|b| b.latest) {
            return Some(&flagged.version);
        }
        candidates
            .into_iter()
            .max_by(|a, b| compare_versions(&a.version, &b.version))
            .map(|b| b.version.as_str())
    }

    /// Groups with every `latest` version pinned.
    pub fn resolved_groups(&self) -> Result<Vec<Group>> {
        self.groups
            .iter()
            .map(|group| {
                let buildpacks = group
                    .buildpacks
                    .iter()
                    .map(|bp| {
                        if bp.version == "latest" {
                            self.resolve(&bp.id, "latest")
                        } else {
                            Ok(bp.clone())
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Group { buildpacks })
            })
            .collect()
    }

    fn resolve(&self, id: &str, version: &str) -> Result<BuildpackRef> {
        if version == "latest" {
            let resolved = self.latest_version(id).ok_or_else(|| {
                PackError::InvalidInput(format!("buildpack '{}' is not in the builder", id))
            })?;
            return Ok(BuildpackRef::new(id, resolved));
        }
        if !self
            .buildpacks
            .iter()
            .any(|b| b.id == id && b.version == version)
        {
            return Err(PackError::InvalidInput(format!(
                "buildpack '{}@{}' is not in the builder",
                id, version
            )));
        }
        Ok(BuildpackRef::new(id, version))
    }

    /// Turn `--buildpack id[@version]` values into a group, in the given order.
    pub fn override_group(&self, overrides: &[String], log: &PhaseLog) -> Result<Group> {
        let mut buildpacks = Vec::with_capacity(overrides.len());
        for spec in overrides {
            let (id, version) = match spec.split_once('@') {
                Some((id, version)) if !id.is_empty() && !version.is_empty() => (id, version),
                Some(_) => {
                    return Err(PackError::InvalidInput(format!(
                        "invalid buildpack '{}', expected <id>[@<version>]",
                        spec
                    )))
                }
                None => {
                    log.line(
                        Phase::Detect,
                        format!(
                            "No version for '{}' buildpack provided, will use '{}@latest'",
                            spec, spec
                        ),
                    );
                    (spec.as_str(), "latest")
                }
            };
            let resolved = self.resolve(id, version)?;
            if version == "latest" {
                tracing::info!(
                    buildpack = %id,
                    version = %resolved.version,
                    "Resolved latest buildpack version"
                );
                log.line(
                    Phase::Detect,
                    format!("Using '{}@{}' for '{}@latest'", id, resolved.version, id),
                );
            }
            buildpacks.push(resolved);
        }
        Ok(Group { buildpacks })
    }
}

/// Dotted-numeric comparison, falling back to string order per segment.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-']);
    let mut right = b.split(['.', '-']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// The `group.toml` written for later phases.
pub fn group_toml(group: &Group) -> Result<String> {
    Ok(toml::to_string(group)?)
}
