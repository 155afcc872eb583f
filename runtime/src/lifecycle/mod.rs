//! Lifecycle orchestrator.
//!
//! A build runs detect, analyze, build and export, one container at a time,
//! from the stack's build image. The source lives in a per-build workspace
//! volume mounted at `/workspace`; the repository's cache volume is mounted
//! at `/layers`. Every container is removed and the workspace volume is
//! deleted on every exit path; the cache volume is kept.

pub mod buildpack;
pub mod layers;
pub mod phase;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use pack_core::config::Stack;
use pack_core::context::OperationContext;
use pack_core::error::{PackError, Result};

use crate::cache::CacheManager;
use crate::config::EngineConfig;
use crate::daemon::{Bind, ContainerEngine, ContainerSpec, ImageInspect};
use crate::image::metadata::json_to_toml;
use crate::image::{
    Exported, ExportRequest, ImageAssembler, LifecycleMetadata, PriorImage, PriorSource, APP_DIR,
    LAUNCHER_PATH, LAYERS_DIR, LIFECYCLE_METADATA_LABEL, STACK_ID_LABEL,
};
use crate::log::{Phase, PhaseLog};
use crate::oci::layers::{read_single_file, tar_dir, tar_files, tar_single_file, unpack};
use crate::oci::reference::ImageReference;
use crate::oci::registry::ImageRegistry;

use buildpack::{
    group_toml, BuilderMetadata, BuildpackRef, Group, BUILDER_METADATA_LABEL, ORDER_TOML_PATH,
};
use layers::{read_layers, LayerToml};
use phase::ContainerGuard;

const WORKSPACE_DIR: &str = "/workspace";
const PLATFORM_DIR: &str = "/platform";
const PLAN_PATH: &str = "/workspace/plan.toml";
const GROUP_PATH: &str = "/workspace/group.toml";

const DETECT_PASS: i64 = 0;
const DETECT_FAIL: i64 = 100;

/// Inputs of one build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Application source directory
    pub source: PathBuf,
    pub image: ImageReference,
    pub stack: Stack,
    /// Build image; the stack's first build image when unset
    pub builder: Option<String>,
    /// Run image; chosen from the stack when unset
    pub run_image: Option<String>,
    /// `id[@version]` overrides forming the group directly
    pub buildpacks: Vec<String>,
    pub publish: bool,
    pub pull: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub reference: ImageReference,
    /// Manifest digest when published, image id otherwise
    pub digest: String,
    pub group: Vec<BuildpackRef>,
    /// `<bp>:<layer>` of every layer reused from the previous image
    pub reused_layers: Vec<String>,
}

/// The run image the stack offers for `target`: the one on the same
/// registry when there is one, otherwise the first.
pub fn run_image_for(stack: &Stack, target: &ImageReference) -> Result<ImageReference> {
    let candidates = stack
        .run_images
        .iter()
        .map(|r| ImageReference::parse(r))
        .collect::<Result<Vec<_>>>()?;
    candidates
        .iter()
        .find(|c| c.registry == target.registry)
        .or_else(|| candidates.first())
        .cloned()
        .ok_or_else(|| PackError::InvalidStack(format!("stack '{}' has no run image", stack.id)))
}

/// State of one build.
struct Session<'a> {
    build: &'a BuildContext,
    log: &'a PhaseLog,
    target: ImageReference,
    guard: ContainerGuard,
    builder: String,
    workspace: String,
    cache: String,
    user: String,
}

impl Session<'_> {
    /// Phase container with the workspace and cache mounted read-write.
    fn container(&self, name: String) -> ContainerSpec {
        ContainerSpec::new(name, &self.builder)
            .bind(Bind::read_write(&self.workspace, WORKSPACE_DIR))
            .bind(Bind::read_write(&self.cache, LAYERS_DIR))
            .env("CNB_STACK_ID", &self.build.stack.id)
            .user(&self.user)
    }
}

/// Drives a build through its phases.
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn ImageRegistry>,
    cache: CacheManager,
    assembler: ImageAssembler,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<dyn ImageRegistry>,
        lock_dir: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> Self {
        let cache = CacheManager::new(engine.clone(), lock_dir, config.cache_lock_timeout);
        let assembler = ImageAssembler::new(engine.clone(), registry.clone(), config.clone());
        Self {
            engine,
            registry,
            cache,
            assembler,
            config,
        }
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Build `build.image` from `build.source`.
    pub async fn build(
        &self,
        ctx: &OperationContext,
        build: &BuildContext,
        log: &PhaseLog,
    ) -> Result<BuildResult> {
        if !build.source.is_dir() {
            return Err(PackError::InvalidInput(format!(
                "source path '{}' is not a directory",
                build.source.display()
            )));
        }
        let target = if build.publish {
            build.image.for_pull()
        } else {
            build.image.clone()
        };
        let builder = match &build.builder {
            Some(builder) => builder.clone(),
            None => build.stack.build_image()?.to_string(),
        };
        let builder = ImageReference::parse(&builder)?.full_reference();

        let _lock = self.cache.lock(ctx, &target).await?;
        let build_id = new_build_id();
        tracing::info!(image = %target, %build_id, publish = build.publish, "Starting build");

        let mut session = Session {
            build,
            log,
            guard: ContainerGuard::new(self.engine.clone(), build_id.clone()),
            builder,
            workspace: format!("pack-workspace-{}", build_id),
            cache: CacheManager::volume_for(&target),
            user: format!("{}:{}", self.config.user_id, self.config.group_id),
            target,
        };
        let result = self.run(ctx, &mut session).await;

        session.guard.cleanup().await;
        if let Err(e) = self.engine.remove_volume(&session.workspace).await {
            tracing::warn!(
                volume = %session.workspace,
                error = %e,
                "Failed to remove workspace volume"
            );
        }
        match &result {
            Ok(built) => {
                tracing::info!(image = %built.reference, digest = %built.digest, "Build complete")
            }
            Err(e) => {
                tracing::warn!(image = %session.target, %build_id, error = %e, "Build failed")
            }
        }
        result
    }

    async fn run(&self, ctx: &OperationContext, s: &mut Session<'_>) -> Result<BuildResult> {
        let inspect = self.prepare_image(ctx, &s.builder, s.build.pull, s.log).await?;
        if let Some(stack_id) = inspect.label(STACK_ID_LABEL) {
            if stack_id != s.build.stack.id {
                return Err(PackError::StackMismatch {
                    image: stack_id.to_string(),
                    expected: s.build.stack.id.clone(),
                });
            }
        }
        let run_image = self.select_run_image(ctx, s).await?;

        self.cache.ensure(&s.target).await?;
        self.engine.create_volume(&s.workspace).await?;
        let source = tar_dir(
            &s.build.source,
            "workspace/app",
            self.config.user_id,
            self.config.group_id,
        )?;
        self.copy_into_volumes(s, "setup", source).await?;

        let metadata = match inspect.label(BUILDER_METADATA_LABEL) {
            Some(label) => BuilderMetadata::from_label(label)?,
            None => self.order_from_image(s).await?,
        };

        let group = self.detect(ctx, s, &metadata).await?;
        let prior = self.analyze(ctx, s, &group).await?;
        self.chown(ctx, s).await?;
        self.build_buildpacks(ctx, s, &group).await?;
        let exported = self
            .export(ctx, s, &group, &run_image, prior.as_ref())
            .await
            .map_err(export_error)?;

        s.log.line(
            Phase::Export,
            format!("*** Image: {}", s.target.with_digest(&exported.digest)),
        );
        Ok(BuildResult {
            reference: s.target.clone(),
            digest: exported.digest,
            group: group.buildpacks,
            reused_layers: exported.reused,
        })
    }

    /// Make `reference` available in the daemon, pulling when asked to.
    async fn prepare_image(
        &self,
        ctx: &OperationContext,
        reference: &str,
        pull: bool,
        log: &PhaseLog,
    ) -> Result<ImageInspect> {
        if pull {
            log.line(Phase::Setup, format!("Pulling image '{}'", reference));
            ctx.run("image pull", self.engine.pull_image(reference)).await?;
        } else if !self.engine.image_exists(reference).await? {
            return Err(PackError::NotFound(format!(
                "image '{}' is not in the daemon and pulling is disabled",
                reference
            )));
        }
        self.engine.inspect_image(reference).await
    }

    async fn select_run_image(
        &self,
        ctx: &OperationContext,
        s: &Session<'_>,
    ) -> Result<ImageReference> {
        let reference = match &s.build.run_image {
            Some(run_image) => ImageReference::parse(run_image)?,
            None => run_image_for(&s.build.stack, &s.target)?,
        };
        let not_found = |e: PackError| match e {
            PackError::NotFound(_) => PackError::RunImageNotFound(reference.to_string()),
            other => other,
        };

        let stack_label = if s.build.publish {
            let image = self
                .registry
                .get_manifest(ctx, &reference.for_pull())
                .await
                .map_err(not_found)?;
            image.config.label(STACK_ID_LABEL).map(str::to_string)
        } else {
            let inspect = self
                .prepare_image(ctx, &reference.full_reference(), s.build.pull, s.log)
                .await
                .map_err(not_found)?;
            inspect.label(STACK_ID_LABEL).map(str::to_string)
        };
        if let Some(run_stack) = stack_label {
            if run_stack != s.build.stack.id {
                return Err(PackError::StackMismatch {
                    image: run_stack,
                    expected: s.build.stack.id.clone(),
                });
            }
        }
        tracing::debug!(run_image = %reference, "Selected run image");
        Ok(reference)
    }

    /// Copy a tar rooted at `/` into the build's volumes.
    async fn copy_into_volumes(
        &self,
        s: &mut Session<'_>,
        phase: &str,
        tar: Vec<u8>,
    ) -> Result<()> {
        let spec = s.container(s.guard.name(phase, None));
        let id = s.guard.create(&spec).await?;
        let result = self.engine.copy_in(&id, "/", Bytes::from(tar)).await;
        s.guard.release(&spec.name).await;
        result
    }

    /// Detection order read from `order.toml` inside the build image.
    async fn order_from_image(&self, s: &mut Session<'_>) -> Result<BuilderMetadata> {
        let spec = ContainerSpec::new(s.guard.name("order", None), &s.builder);
        let id = s.guard.create(&spec).await?;
        let copied = self.engine.copy_out(&id, ORDER_TOML_PATH).await;
        s.guard.release(&spec.name).await;
        let archive = copied.map_err(|e| match e {
            PackError::NotFound(_) => PackError::InvalidInput(format!(
                "build image '{}' has neither a {} label nor {}",
                s.builder, BUILDER_METADATA_LABEL, ORDER_TOML_PATH
            )),
            other => other,
        })?;
        let contents = read_single_file(&archive)?;
        BuilderMetadata::from_order_toml(&String::from_utf8_lossy(&contents))
    }

    async fn detect(
        &self,
        ctx: &OperationContext,
        s: &mut Session<'_>,
        metadata: &BuilderMetadata,
    ) -> Result<Group> {
        s.log.line(Phase::Detect, "===> DETECTING");
        let groups = if s.build.buildpacks.is_empty() {
            metadata.resolved_groups()?
        } else {
            let group = metadata.override_group(&s.build.buildpacks, s.log)?;
            s.log.line(Phase::Detect, "DETECTING WITH MANUALLY-PROVIDED GROUP:");
            vec![group]
        };

        let mut index = 0;
        for group in groups {
            let mut summary = Vec::with_capacity(group.buildpacks.len());
            let mut passed = !group.buildpacks.is_empty();
            for bp in &group.buildpacks {
                ctx.check("detect")?;
                index += 1;
                let spec = s
                    .container(s.guard.name("detect", Some(index)))
                    .cmd([
                        format!("{}/bin/detect", bp.dir()),
                        PLATFORM_DIR.to_string(),
                        PLAN_PATH.to_string(),
                    ])
                    .working_dir(APP_DIR);
                let run = s.guard.run(ctx, &spec).await?;
                s.log.output(Phase::Detect, &run.output);
                let status = match run.exit_code {
                    DETECT_PASS => "pass",
                    DETECT_FAIL => {
                        passed = false;
                        "fail"
                    }
                    code => {
                        return Err(PackError::BuildpackFailed {
                            id: bp.id.clone(),
                            code,
                        })
                    }
                };
                summary.push(format!("{}: {}", metadata.display_name(bp), status));
            }
            s.log.line(Phase::Detect, summary.join(" | "));

            if passed {
                let ids: Vec<String> = group
                    .buildpacks
                    .iter()
                    .map(|bp| format!("{}@{}", bp.id, bp.version))
                    .collect();
                tracing::info!(group = ?ids, "Selected buildpack group");
                let contents = group_toml(&group)?;
                let tar = tar_single_file(GROUP_PATH, contents.as_bytes(), 0o644)?;
                self.copy_into_volumes(s, "group", tar).await?;
                return Ok(group);
            }
        }
        Err(PackError::NoSatisfyingGroup)
    }

    /// Look up the previous image and put its layer metadata back into the
    /// cache where the cache lost it.
    async fn analyze(
        &self,
        ctx: &OperationContext,
        s: &mut Session<'_>,
        group: &Group,
    ) -> Result<Option<PriorImage>> {
        s.log.line(Phase::Analyze, "===> ANALYZING");
        let Some(prior) = self.prior_image(ctx, s).await? else {
            tracing::info!(image = %s.target, "No previous image to reuse layers from");
            return Ok(None);
        };

        let spec = s.container(s.guard.name("analyze", None));
        let id = s.guard.create(&spec).await?;
        let restored = self.restore_layer_metadata(&id, group, &prior.metadata).await;
        s.guard.release(&spec.name).await;
        for path in restored? {
            s.log.line(Phase::Analyze, format!("restoring metadata for layer {}", path));
        }
        Ok(Some(prior))
    }

    async fn prior_image(
        &self,
        ctx: &OperationContext,
        s: &Session<'_>,
    ) -> Result<Option<PriorImage>> {
        let (label, source) = if s.build.publish {
            let image = match self.registry.get_manifest(ctx, &s.target).await {
                Ok(image) => image,
                Err(PackError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            let label = image.config.label(LIFECYCLE_METADATA_LABEL).map(str::to_string);
            (label, PriorSource::Registry(image))
        } else {
            let reference = s.target.full_reference();
            let inspect = match self.engine.inspect_image(&reference).await {
                Ok(inspect) => inspect,
                Err(PackError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            let label = inspect.label(LIFECYCLE_METADATA_LABEL).map(str::to_string);
            (label, PriorSource::Daemon(reference))
        };

        let Some(label) = label else {
            tracing::debug!(image = %s.target, "Previous image carries no lifecycle metadata");
            return Ok(None);
        };
        match LifecycleMetadata::from_label(&label) {
            Ok(metadata) => Ok(Some(PriorImage { metadata, source })),
            Err(e) => {
                tracing::warn!(
                    image = %s.target,
                    error = %e,
                    "Ignoring unreadable metadata on previous image"
                );
                Ok(None)
            }
        }
    }

    /// Write `<layer>.toml` for every recorded layer the cache does not
    /// know about. Returns the paths written.
    async fn restore_layer_metadata(
        &self,
        container: &str,
        group: &Group,
        prior: &LifecycleMetadata,
    ) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for bp in &group.buildpacks {
            let Some(recorded) = prior.buildpacks.iter().find(|r| r.id == bp.id) else {
                continue;
            };
            for (name, layer) in &recorded.layers {
                let path = format!("{}/{}.toml", bp.layers_dir(), name);
                match self.engine.copy_out(container, &path).await {
                    Ok(_) => continue,
                    Err(PackError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                let toml = LayerToml {
                    launch: true,
                    metadata: json_to_toml(&layer.data),
                    ..LayerToml::default()
                };
                files.push((path, toml::to_string(&toml)?.into_bytes()));
            }
        }
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let tar = tar_files(&files, 0o644, self.config.user_id, self.config.group_id)?;
        self.engine.copy_in(container, "/", Bytes::from(tar)).await?;
        Ok(files.into_iter().map(|(path, _)| path).collect())
    }

    /// Hand `/workspace` and `/layers` to the build user.
    async fn chown(&self, ctx: &OperationContext, s: &mut Session<'_>) -> Result<()> {
        let spec = s
            .container(s.guard.name("chown", None))
            .user("0:0")
            .cmd(["chown", "-R", s.user.as_str(), WORKSPACE_DIR, LAYERS_DIR]);
        let run = s.guard.run(ctx, &spec).await?;
        if !run.success() {
            return Err(PackError::Daemon(format!(
                "chown of build volumes exited with {}: {}",
                run.exit_code,
                run.output.join("\n")
            )));
        }
        Ok(())
    }

    async fn build_buildpacks(
        &self,
        ctx: &OperationContext,
        s: &mut Session<'_>,
        group: &Group,
    ) -> Result<()> {
        s.log.line(Phase::Build, "===> BUILDING");
        for (i, bp) in group.buildpacks.iter().enumerate() {
            ctx.check("build")?;
            let spec = s
                .container(s.guard.name("build", Some(i + 1)))
                .cmd([
                    format!("{}/bin/build", bp.dir()),
                    bp.layers_dir(),
                    PLATFORM_DIR.to_string(),
                    PLAN_PATH.to_string(),
                ])
                .env("PACK_LAYERS_DIR", LAYERS_DIR)
                .env("PACK_APP_DIR", APP_DIR)
                .working_dir(APP_DIR);
            let run = s.guard.run(ctx, &spec).await?;
            s.log.output(Phase::Build, &run.output);
            if !run.success() {
                return Err(PackError::BuildpackFailed {
                    id: bp.id.clone(),
                    code: run.exit_code,
                });
            }
            tracing::info!(buildpack = %bp.id, version = %bp.version, "Buildpack finished");
        }
        Ok(())
    }

    async fn export(
        &self,
        ctx: &OperationContext,
        s: &mut Session<'_>,
        group: &Group,
        run_image: &ImageReference,
        prior: Option<&PriorImage>,
    ) -> Result<Exported> {
        s.log.line(Phase::Export, "===> EXPORTING");
        let scratch = tempfile::TempDir::new()?;
        let spec = ContainerSpec::new(s.guard.name("export", None), &s.builder)
            .bind(Bind::read_only(&s.workspace, WORKSPACE_DIR))
            .bind(Bind::read_only(&s.cache, LAYERS_DIR));
        let id = s.guard.create(&spec).await?;
        let copied = self.copy_out_results(&id, scratch.path()).await;
        s.guard.release(&spec.name).await;
        let launcher = copied?;

        ctx.check("export")?;
        let outputs = read_layers(&scratch.path().join("layers"), &group.buildpacks)?;
        let app_dir = scratch.path().join("app");
        self.assembler
            .export(
                ctx,
                ExportRequest {
                    target: &s.target,
                    publish: s.build.publish,
                    stack_id: &s.build.stack.id,
                    run_image,
                    launcher: &launcher,
                    app_dir: &app_dir,
                    outputs: &outputs,
                    prior,
                    log: s.log,
                },
            )
            .await
    }

    /// Unpack `/workspace/app` and `/layers` into `dir`; returns the launcher.
    async fn copy_out_results(&self, container: &str, dir: &Path) -> Result<Vec<u8>> {
        let app = self.engine.copy_out(container, APP_DIR).await?;
        unpack(&app, dir)?;
        let layers = self.engine.copy_out(container, LAYERS_DIR).await?;
        unpack(&layers, dir)?;
        let launcher = self.engine.copy_out(container, LAUNCHER_PATH).await?;
        read_single_file(&launcher)
    }
}

fn new_build_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn export_error(err: PackError) -> PackError {
    match err {
        e @ (PackError::ExportFailed(_) | PackError::RunImageNotFound(_)) => e,
        e if e.is_interrupted() => e,
        other => PackError::ExportFailed(other.to_string()),
    }
}
