//! ContainerSpec - What the engine needs to create a phase container.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A named volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    /// Volume name
    pub volume: String,
    /// Mount point inside the container
    pub target: String,
    /// Whether the mount is read-only
    pub read_only: bool,
}

impl Bind {
    pub fn read_write(volume: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(volume: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// `volume:target[:ro]`, the docker bind syntax.
    pub fn to_docker(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.volume, self.target)
        } else {
            format!("{}:{}", self.volume, self.target)
        }
    }
}

/// Configuration for one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Deterministic container name
    pub name: String,
    /// Image to create the container from
    pub image: String,
    /// Command (argv)
    pub cmd: Vec<String>,
    /// Environment variables
    pub env: Vec<(String, String)>,
    /// Volume mounts
    pub binds: Vec<Bind>,
    /// Working directory
    pub working_dir: Option<String>,
    /// `uid[:gid]` to run as
    pub user: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn bind(mut self, bind: Bind) -> Self {
        self.binds.push(bind);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// The parts of an image inspect the build uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInspect {
    /// Image id (`sha256:` of the config)
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub env: Vec<String>,
    pub user: Option<String>,
}

impl ImageInspect {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Result of running a container to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRun {
    pub exit_code: i64,
    /// Combined stdout/stderr, one entry per line
    pub output: Vec<String>,
}

impl ContainerRun {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
