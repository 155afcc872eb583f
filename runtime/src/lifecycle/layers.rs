//! Reading what buildpacks left under `/layers`.
//!
//! ```text
//! layers/<bp>/launch.toml        [[processes]] type, command
//! layers/<bp>/<layer>.toml       launch/build/cache flags, [metadata]
//! layers/<bp>/<layer>/           layer contents
//! layers/<bp>/<layer>/env.launch/<NAME>
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pack_core::error::{PackError, Result};
use serde::{Deserialize, Serialize};

use super::buildpack::{escape_id, BuildpackRef};

/// `<layer>.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerToml {
    #[serde(default)]
    pub launch: bool,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<toml::Table>,
}

/// A process type declared in `launch.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchToml {
    #[serde(default)]
    pub processes: Vec<Process>,
}

impl LaunchToml {
    /// Merge buildpack launch metadata; later process types replace earlier ones.
    pub fn merge<'a>(all: impl IntoIterator<Item = &'a LaunchToml>) -> LaunchToml {
        let mut processes: Vec<Process> = Vec::new();
        for launch in all {
            for process in &launch.processes {
                match processes.iter_mut().find(|p| p.kind == process.kind) {
                    Some(existing) => *existing = process.clone(),
                    None => processes.push(process.clone()),
                }
            }
        }
        LaunchToml { processes }
    }

    /// `web` when declared, otherwise the first process type.
    pub fn default_process(&self) -> Option<&Process> {
        self.processes
            .iter()
            .find(|p| p.kind == "web")
            .or_else(|| self.processes.first())
    }
}

/// One layer a buildpack declared.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildpackLayer {
    pub name: String,
    pub toml: LayerToml,
    /// Contents directory, when the buildpack left one
    pub dir: Option<PathBuf>,
}

impl BuildpackLayer {
    /// `env.launch/<NAME>` files, by variable name.
    pub fn launch_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let Some(dir) = &self.dir else {
            return env;
        };
        let Ok(entries) = std::fs::read_dir(dir.join("env.launch")) else {
            return env;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(value) => {
                    env.insert(entry.file_name().to_string_lossy().to_string(), value);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable launch env"
                    );
                }
            }
        }
        env
    }
}

/// Everything one buildpack produced.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildpackOutput {
    pub buildpack: BuildpackRef,
    pub layers: Vec<BuildpackLayer>,
    pub launch: LaunchToml,
}

impl BuildpackOutput {
    pub fn launch_layers(&self) -> impl Iterator<Item = &BuildpackLayer> {
        self.layers.iter().filter(|l| l.toml.launch)
    }
}

/// Read the exported `/layers` tree for every buildpack of the group.
///
/// Unreadable layer TOMLs come from the cache and are skipped with a
/// warning; an unreadable `launch.toml` was written by this build and fails it.
pub fn read_layers(root: &Path, group: &[BuildpackRef]) -> Result<Vec<BuildpackOutput>> {
    group
        .iter()
        .map(|bp| read_buildpack(&root.join(escape_id(&bp.id)), bp))
        .collect()
}

fn read_buildpack(dir: &Path, buildpack: &BuildpackRef) -> Result<BuildpackOutput> {
    let mut output = BuildpackOutput {
        buildpack: buildpack.clone(),
        layers: Vec::new(),
        launch: LaunchToml::default(),
    };
    if !dir.is_dir() {
        return Ok(output);
    }

    let launch_path = dir.join("launch.toml");
    if launch_path.is_file() {
        let contents = std::fs::read_to_string(&launch_path)?;
        output.launch = toml::from_str(&contents).map_err(|e| {
            PackError::ExportFailed(format!(
                "buildpack '{}' wrote an invalid launch.toml: {}",
                buildpack.id, e
            ))
        })?;
    }

    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let stem = name.strip_suffix(".toml")?;
            (stem != "launch").then(|| stem.to_string())
        })
        .collect();
    names.sort();

    for name in names {
        let toml_path = dir.join(format!("{}.toml", name));
        let parsed = std::fs::read_to_string(&toml_path)
            .map_err(|e| e.to_string())
            .and_then(|c| toml::from_str::<LayerToml>(&c).map_err(|e| e.to_string()));
        let toml = match parsed {
            Ok(toml) => toml,
            Err(e) => {
                tracing::warn!(
                    buildpack = %buildpack.id,
                    layer = %name,
                    error = %e,
                    "Ignoring unreadable layer metadata"
                );
                continue;
            }
        };
        let layer_dir = dir.join(&name);
        output.layers.push(BuildpackLayer {
            name,
            toml,
            dir: layer_dir.is_dir().then_some(layer_dir),
        });
    }
    Ok(output)
}
