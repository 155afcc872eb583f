//! Entry points used by the CLI.
//!
//! [`Pack`] wires the container engine, the registry client and the stack
//! registry together and exposes build, rebase and stack management.

use std::path::PathBuf;
use std::sync::Arc;

use pack_core::config::{pack_home, Stack, StackRegistry};
use pack_core::context::OperationContext;
use pack_core::error::Result;

use crate::config::EngineConfig;
use crate::daemon::{ContainerEngine, DockerEngine};
use crate::lifecycle::{BuildContext, BuildResult, Orchestrator};
use crate::log::PhaseLog;
use crate::oci::reference::ImageReference;
use crate::oci::registry::{ImageRegistry, RegistryClient};
use crate::rebase::{RebaseEngine, RebaseOptions, RebaseResult};

/// What the caller asks to build.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub image: String,
    pub source: PathBuf,
    /// Stack id; the default stack when unset
    pub stack: Option<String>,
    pub builder: Option<String>,
    pub run_image: Option<String>,
    pub buildpacks: Vec<String>,
    pub publish: bool,
    pub pull: bool,
}

pub struct Pack {
    stacks: StackRegistry,
    orchestrator: Orchestrator,
    rebaser: RebaseEngine,
}

impl Pack {
    pub fn new(
        stacks: StackRegistry,
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<dyn ImageRegistry>,
        lock_dir: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> Self {
        let orchestrator =
            Orchestrator::new(engine.clone(), registry.clone(), lock_dir, config.clone());
        let rebaser = RebaseEngine::new(engine, registry, config);
        Self {
            stacks,
            orchestrator,
            rebaser,
        }
    }

    /// Docker daemon, HTTP registries and the config under the pack home.
    pub fn connect(config: EngineConfig) -> Result<Self> {
        let home = pack_home()?;
        let engine = Arc::new(DockerEngine::connect()?);
        let registry = Arc::new(RegistryClient::new(config.clone())?);
        tracing::debug!(home = %home.display(), "Using pack home");
        Ok(Self::new(
            StackRegistry::new(home.join("config.toml")),
            engine,
            registry,
            home.join("locks"),
            config,
        ))
    }

    pub fn stacks(&self) -> &StackRegistry {
        &self.stacks
    }

    pub async fn build(
        &self,
        ctx: &OperationContext,
        request: BuildRequest,
        log: &PhaseLog,
    ) -> Result<BuildResult> {
        let stack = match &request.stack {
            Some(id) => self.stacks.get(id)?,
            None => self.stacks.default_stack()?,
        };
        let build = BuildContext {
            source: request.source,
            image: ImageReference::parse(&request.image)?,
            stack,
            builder: request.builder,
            run_image: request.run_image,
            buildpacks: request.buildpacks,
            publish: request.publish,
            pull: request.pull,
        };
        self.orchestrator.build(ctx, &build, log).await
    }

    /// Rebase `image` onto the default stack's run image.
    pub async fn rebase(
        &self,
        ctx: &OperationContext,
        image: &str,
        opts: RebaseOptions,
        log: &PhaseLog,
    ) -> Result<RebaseResult> {
        let reference = ImageReference::parse(image)?;
        let stack = self.stacks.default_stack()?;
        self.rebaser.rebase(ctx, &reference, &stack, opts, log).await
    }

    pub fn add_stack(
        &self,
        id: &str,
        build_images: Vec<String>,
        run_images: Vec<String>,
    ) -> Result<()> {
        self.stacks.add_stack(Stack::new(id, build_images, run_images))
    }

    pub fn update_stack(
        &self,
        id: &str,
        build_images: Vec<String>,
        run_images: Vec<String>,
    ) -> Result<()> {
        self.stacks.update_stack(id, build_images, run_images)
    }

    pub fn delete_stack(&self, id: &str) -> Result<()> {
        self.stacks.delete_stack(id)
    }

    pub fn set_default_stack(&self, id: &str) -> Result<()> {
        self.stacks.set_default_stack(id)
    }
}
