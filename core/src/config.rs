//! Persisted pack configuration and the stack registry.
//!
//! The configuration lives in `<home>/.pack/config.toml`:
//!
//! ```toml
//! default-stack-id = "io.buildpacks.stacks.bionic"
//!
//! [[stacks]]
//!   id = "io.buildpacks.stacks.bionic"
//!   build-images = ["packs/build"]
//!   run-images = ["packs/run"]
//! ```
//!
//! [`StackRegistry`] is the only writer. Readers hold a shared `fs2` lock on
//! `config.toml.lock`, writers an exclusive one; writes go to a tmp file and
//! are renamed into place.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{PackError, Result};

/// Stack seeded into a fresh configuration.
pub const DEFAULT_STACK_ID: &str = "io.buildpacks.stacks.bionic";
pub const DEFAULT_BUILD_IMAGE: &str = "packs/build";
pub const DEFAULT_RUN_IMAGE: &str = "packs/run";

/// Environment variable overriding the pack home directory.
pub const PACK_HOME_ENV: &str = "PACK_HOME";

/// A paired build-image/run-image family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Stack {
    pub id: String,
    pub build_images: Vec<String>,
    pub run_images: Vec<String>,
}

impl Stack {
    pub fn new(
        id: impl Into<String>,
        build_images: Vec<String>,
        run_images: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            build_images,
            run_images,
        }
    }

    /// The built-in default stack.
    pub fn bionic() -> Self {
        Self::new(
            DEFAULT_STACK_ID,
            vec![DEFAULT_BUILD_IMAGE.to_string()],
            vec![DEFAULT_RUN_IMAGE.to_string()],
        )
    }

    /// First build image; stacks always carry at least one.
    pub fn build_image(&self) -> Result<&str> {
        self.build_images
            .first()
            .map(String::as_str)
            .ok_or_else(|| PackError::InvalidStack(format!("{} has no build images", self.id)))
    }

    /// Check the stack's own invariants.
    pub fn validate(&self) -> Result<()> {
        if !is_reverse_domain(&self.id) {
            return Err(PackError::InvalidStack(format!(
                "id '{}' is not a reverse-domain name",
                self.id
            )));
        }
        if self.build_images.iter().all(|s| s.trim().is_empty()) {
            return Err(PackError::InvalidStack(format!(
                "{} must have at least one build image",
                self.id
            )));
        }
        if self.run_images.iter().all(|s| s.trim().is_empty()) {
            return Err(PackError::InvalidStack(format!(
                "{} must have at least one run image",
                self.id
            )));
        }
        Ok(())
    }
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_stack_id: Option<String>,
    #[serde(default)]
    pub stacks: Vec<Stack>,
}

impl PackConfig {
    /// Configuration written when no file exists yet.
    pub fn seeded() -> Self {
        Self {
            default_stack_id: Some(DEFAULT_STACK_ID.to_string()),
            stacks: vec![Stack::bionic()],
        }
    }

    pub fn get(&self, id: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.id == id)
    }

    /// Check every invariant of the configuration as a whole.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for stack in &self.stacks {
            stack.validate()?;
            if !seen.insert(stack.id.as_str()) {
                return Err(PackError::StackExists(stack.id.clone()));
            }
        }
        if let Some(id) = &self.default_stack_id {
            if self.get(id).is_none() {
                return Err(PackError::UnknownStack(id.clone()));
            }
        }
        Ok(())
    }
}

/// `a.b[.c...]` with lowercase alphanumeric or `-` segments.
fn is_reverse_domain(id: &str) -> bool {
    let segments: Vec<&str> = id.split('.').collect();
    segments.len() >= 2
        && segments.iter().all(|seg| {
            !seg.is_empty()
                && !seg.starts_with('-')
                && !seg.ends_with('-')
                && seg
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

/// Pack home directory (`$PACK_HOME` or `~/.pack`).
pub fn pack_home() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(PACK_HOME_ENV) {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".pack"))
        .ok_or_else(|| PackError::Other("cannot determine home directory".to_string()))
}

/// Single owner of `config.toml`.
#[derive(Debug, Clone)]
pub struct StackRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl StackRegistry {
    /// Registry backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("toml.lock");
        Self { path, lock_path }
    }

    /// Registry at `<pack home>/config.toml`.
    pub fn default_path() -> Result<Self> {
        Ok(Self::new(pack_home()?.join("config.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a stack by id.
    pub fn get(&self, id: &str) -> Result<Stack> {
        self.with_shared(|config| {
            config
                .get(id)
                .cloned()
                .ok_or_else(|| PackError::UnknownStack(id.to_string()))
        })
    }

    /// The stack named by `default-stack-id`.
    pub fn default_stack(&self) -> Result<Stack> {
        self.with_shared(|config| {
            let id = config
                .default_stack_id
                .as_deref()
                .ok_or(PackError::NoDefaultStack)?;
            config.get(id).cloned().ok_or(PackError::NoDefaultStack)
        })
    }

    /// All stacks in file order.
    pub fn list(&self) -> Result<Vec<Stack>> {
        self.with_shared(|config| Ok(config.stacks.clone()))
    }

    pub fn add_stack(&self, stack: Stack) -> Result<()> {
        stack.validate()?;
        self.with_exclusive(|config| {
            if config.get(&stack.id).is_some() {
                return Err(PackError::StackExists(stack.id.clone()));
            }
            tracing::info!(stack = %stack.id, "Adding stack");
            config.stacks.push(stack);
            Ok(())
        })
    }

    pub fn update_stack(
        &self,
        id: &str,
        build_images: Vec<String>,
        run_images: Vec<String>,
    ) -> Result<()> {
        let updated = Stack::new(id, build_images, run_images);
        updated.validate()?;
        self.with_exclusive(|config| {
            let slot = config
                .stacks
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| PackError::UnknownStack(id.to_string()))?;
            tracing::info!(stack = %id, "Updating stack");
            *slot = updated;
            Ok(())
        })
    }

    pub fn delete_stack(&self, id: &str) -> Result<()> {
        self.with_exclusive(|config| {
            if config.get(id).is_none() {
                return Err(PackError::UnknownStack(id.to_string()));
            }
            if config.default_stack_id.as_deref() == Some(id) {
                return Err(PackError::InvalidStack(format!(
                    "{} cannot be deleted when it is the default stack. \
                     You can change your default stack by running \"pack set-default-stack\".",
                    id
                )));
            }
            tracing::info!(stack = %id, "Deleting stack");
            config.stacks.retain(|s| s.id != id);
            Ok(())
        })
    }

    pub fn set_default_stack(&self, id: &str) -> Result<()> {
        self.with_exclusive(|config| {
            if config.get(id).is_none() {
                return Err(PackError::UnknownStack(id.to_string()));
            }
            config.default_stack_id = Some(id.to_string());
            Ok(())
        })
    }

    /// Run `operation` against the configuration under a shared lock.
    pub fn with_shared<T>(&self, operation: impl FnOnce(&PackConfig) -> Result<T>) -> Result<T> {
        let lock_file = self.open_lock()?;
        lock_file.lock_shared().map_err(|e| {
            PackError::Other(format!(
                "failed to lock config {}: {}",
                self.lock_path.display(),
                e
            ))
        })?;
        let config = self.load()?;
        let result = operation(&config);
        drop(lock_file);
        result
    }

    /// Run `operation` under an exclusive lock, then validate and persist.
    pub fn with_exclusive<T>(
        &self,
        operation: impl FnOnce(&mut PackConfig) -> Result<T>,
    ) -> Result<T> {
        let lock_file = self.open_lock()?;
        lock_file.lock_exclusive().map_err(|e| {
            PackError::Other(format!(
                "failed to lock config {}: {}",
                self.lock_path.display(),
                e
            ))
        })?;
        let mut config = self.load()?;
        let result = operation(&mut config)?;
        config.validate()?;
        self.save(&config)?;
        drop(lock_file);
        Ok(result)
    }

    /// Read the file; a missing file yields the seeded default.
    fn load(&self) -> Result<PackConfig> {
        if !self.path.exists() {
            return Ok(PackConfig::seeded());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            PackError::ConfigCorrupt(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let config: PackConfig = toml::from_str(&data).map_err(|e| {
            PackError::ConfigCorrupt(format!("failed to parse {}: {}", self.path.display(), e))
        })?;
        config
            .validate()
            .map_err(|e| PackError::ConfigCorrupt(format!("{}: {}", self.path.display(), e)))?;
        Ok(config)
    }

    fn save(&self, config: &PackConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = toml::to_string_pretty(config)?;

        let tmp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, data).map_err(|e| {
            PackError::Other(format!(
                "failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            PackError::Other(format!(
                "failed to rename {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn open_lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| {
                PackError::Other(format!(
                    "failed to open config lock {}: {}",
                    self.lock_path.display(),
                    e
                ))
            })
    }
}
