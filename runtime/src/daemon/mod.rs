//! Daemon client - the container engine contract the build depends on.
//!
//! - `ContainerEngine`: pull, create/start/wait, copy in/out, volumes, save/load
//! - `DockerEngine`: the bollard implementation
//! - `ContainerSpec`: what a phase container looks like

mod docker;
mod spec;

pub use docker::DockerEngine;
pub use spec::{Bind, ContainerRun, ContainerSpec, ImageInspect};

use async_trait::async_trait;
use bytes::Bytes;
use pack_core::context::OperationContext;
use pack_core::error::Result;

/// Capabilities of a local container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull_image(&self, reference: &str) -> Result<()>;

    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// `NotFound` when the image is absent.
    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Block until the container exits and return its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Everything the container wrote to stdout and stderr.
    async fn container_logs(&self, id: &str) -> Result<Vec<String>>;

    /// Extract `tar` at `dest` inside the container.
    async fn copy_in(&self, id: &str, dest: &str, tar: Bytes) -> Result<()>;

    /// Tar of `src`; entries are rooted at the basename of `src`.
    async fn copy_out(&self, id: &str, src: &str) -> Result<Bytes>;

    /// Commit the container's filesystem as `reference`, returning the image id.
    async fn commit(&self, id: &str, reference: &str) -> Result<String>;

    async fn kill_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;

    async fn create_volume(&self, name: &str) -> Result<()>;

    /// Remove a volume; a missing volume is not an error.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// `docker save` archive of `reference`.
    async fn save_image(&self, reference: &str) -> Result<Bytes>;

    /// `docker load` an archive.
    async fn load_image(&self, archive: Bytes) -> Result<()>;

    async fn remove_image(&self, reference: &str, force: bool) -> Result<()>;

    /// Create, start and wait for a container, collecting its output.
    ///
    /// The container is left behind; removing it is the caller's job.
    async fn run_container(
        &self,
        ctx: &OperationContext,
        spec: &ContainerSpec,
    ) -> Result<ContainerRun> {
        let id = self.create_container(spec).await?;
        self.start_container(&id).await?;
        let exit_code = ctx
            .run(&format!("container {}", spec.name), self.wait_container(&id))
            .await?;
        let output = self.container_logs(&id).await?;
        Ok(ContainerRun { exit_code, output })
    }
}
