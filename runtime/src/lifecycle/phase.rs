//! Phase containers and their cleanup.

use std::sync::Arc;

use pack_core::context::OperationContext;
use pack_core::error::{PackError, Result};

use crate::daemon::{ContainerEngine, ContainerRun, ContainerSpec};

/// Owns every container a build creates.
///
/// Containers are named `pack-<build-id>-<phase>[-<n>]`. Whatever has not
/// been released when the build ends is killed and removed by
/// [`ContainerGuard::cleanup`], or from `Drop` if the build future was
/// dropped first.
pub struct ContainerGuard {
    engine: Arc<dyn ContainerEngine>,
    build_id: String,
    containers: Vec<String>,
}

impl ContainerGuard {
    pub fn new(engine: Arc<dyn ContainerEngine>, build_id: impl Into<String>) -> Self {
        Self {
            engine,
            build_id: build_id.into(),
            containers: Vec::new(),
        }
    }

    /// Deterministic container name for a phase.
    pub fn name(&self, phase: &str, index: Option<usize>) -> String {
        match index {
            Some(n) => format!("pack-{}-{}-{}", self.build_id, phase, n),
            None => format!("pack-{}-{}", self.build_id, phase),
        }
    }

    /// Create a container that stays around until released.
    pub async fn create(&mut self, spec: &ContainerSpec) -> Result<String> {
        self.containers.push(spec.name.clone());
        self.engine.create_container(spec).await
    }

    /// Run a container to completion and remove it.
    pub async fn run(
        &mut self,
        ctx: &OperationContext,
        spec: &ContainerSpec,
    ) -> Result<ContainerRun> {
        self.containers.push(spec.name.clone());
        tracing::debug!(container = %spec.name, cmd = ?spec.cmd, "Running phase container");
        let result = self.engine.run_container(ctx, spec).await;
        self.release(&spec.name).await;
        result
    }

    /// Kill and remove one container.
    pub async fn release(&mut self, name: &str) {
        remove(self.engine.as_ref(), name).await;
        self.containers.retain(|c| c != name);
    }

    /// Kill and remove everything still tracked.
    pub async fn cleanup(&mut self) {
        for name in std::mem::take(&mut self.containers) {
            remove(self.engine.as_ref(), &name).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.containers.is_empty() {
            return;
        }
        let containers = std::mem::take(&mut self.containers);
        let engine = self.engine.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for name in containers {
                        remove(engine.as_ref(), &name).await;
                    }
                });
            }
            Err(_) => {
                tracing::warn!(?containers, "No runtime to remove build containers");
            }
        }
    }
}

async fn remove(engine: &dyn ContainerEngine, name: &str) {
    if let Err(e) = engine.kill_container(name).await {
        if !matches!(e, PackError::NotFound(_)) {
            tracing::debug!(container = %name, error = %e, "Kill failed");
        }
    }
    match engine.remove_container(name).await {
        Ok(()) => tracing::debug!(container = %name, "Removed container"),
        Err(PackError::NotFound(_)) => {}
        Err(e) => tracing::warn!(container = %name, error = %e, "Failed to remove container"),
    }
}
