//! Rebase: put an application image on top of a newer run image.
//!
//! The run image layers recorded in the lifecycle metadata label are swapped
//! for the new run image's layers; the application layers are reused as they
//! are. No buildpack runs.

use std::sync::Arc;

use bytes::Bytes;
use futures::{future, stream, StreamExt, TryStreamExt};
use pack_core::config::Stack;
use pack_core::context::OperationContext;
use pack_core::error::{PackError, Result};

use crate::config::EngineConfig;
use crate::daemon::ContainerEngine;
use crate::image::{
    LifecycleMetadata, RunImageMetadata, LIFECYCLE_METADATA_LABEL, STACK_ID_LABEL,
};
use crate::lifecycle::run_image_for;
use crate::log::{Phase, PhaseLog};
use crate::oci::archive::DockerArchive;
use crate::oci::manifest::{
    Descriptor, ImageConfig, ImageManifest, DOCKER_CONFIG, DOCKER_LAYER_GZIP,
};
use crate::oci::reference::ImageReference;
use crate::oci::registry::{transfer_blob, ImageRegistry};

#[derive(Debug, Clone, Copy, Default)]
pub struct RebaseOptions {
    /// Rewrite the image in the registry instead of the daemon
    pub publish: bool,
    /// Pull the new run image into the daemon first
    pub pull: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseResult {
    pub reference: ImageReference,
    /// Manifest digest when published, image id otherwise
    pub digest: String,
    /// Run image the application now sits on
    pub run_image: String,
}

/// Leading layers of `app` that came from its run image.
fn run_layer_count(app: &ImageConfig) -> Result<(LifecycleMetadata, usize)> {
    let metadata = LifecycleMetadata::from_config(app)?.ok_or_else(|| {
        PackError::InvalidInput(format!(
            "image has no {} label; only images built by pack can be rebased",
            LIFECYCLE_METADATA_LABEL
        ))
    })?;
    let k = metadata.run_image.layers;
    if k > app.rootfs.diff_ids.len() {
        return Err(PackError::InvalidInput(format!(
            "metadata records {} run image layers but the image has {}",
            k,
            app.rootfs.diff_ids.len()
        )));
    }
    Ok((metadata, k))
}

/// App config rebased onto `run`.
///
/// The first `k` diff-ids (k from the metadata label) and the history
/// entries covering them are replaced by the run image's.
pub fn rebase_config(
    app: &ImageConfig,
    run: &ImageConfig,
    run_reference: &str,
) -> Result<ImageConfig> {
    let (mut metadata, k) = run_layer_count(app)?;
    let app_layers = &app.rootfs.diff_ids;

    let mut config = app.clone();
    config.rootfs.diff_ids = run
        .rootfs
        .diff_ids
        .iter()
        .chain(&app_layers[k..])
        .cloned()
        .collect();
    let covered = app.history_covering(k);
    config.history = run
        .history
        .iter()
        .chain(&app.history[covered..])
        .cloned()
        .collect();
    config.created = Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));

    metadata.run_image = RunImageMetadata {
        layers: run.rootfs.diff_ids.len(),
        reference: run_reference.to_string(),
    };
    config.set_label(LIFECYCLE_METADATA_LABEL, metadata.to_label()?);
    Ok(config)
}

fn app_stack_check(app: &ImageConfig, stack: &Stack) -> Result<()> {
    match app.label(STACK_ID_LABEL) {
        Some(id) if id == stack.id => Ok(()),
        other => Err(PackError::StackMismatch {
            image: other.unwrap_or_default().to_string(),
            expected: stack.id.clone(),
        }),
    }
}

/// A run image that declares a stack must declare the configured one.
fn run_stack_check(stack: &Stack, run: &ImageConfig) -> Result<()> {
    match run.label(STACK_ID_LABEL) {
        Some(id) if id != stack.id => Err(PackError::StackMismatch {
            image: id.to_string(),
            expected: stack.id.clone(),
        }),
        _ => Ok(()),
    }
}

pub struct RebaseEngine {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn ImageRegistry>,
    config: EngineConfig,
}

impl RebaseEngine {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<dyn ImageRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            config,
        }
    }

    /// Rebase `reference` onto `stack`'s run image, in place.
    pub async fn rebase(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        stack: &Stack,
        opts: RebaseOptions,
        log: &PhaseLog,
    ) -> Result<RebaseResult> {
        let run_image = run_image_for(stack, reference)?;
        tracing::info!(
            image = %reference,
            run_image = %run_image,
            publish = opts.publish,
            "Rebasing"
        );
        log.line(
            Phase::Rebase,
            format!("Rebasing {} on run image {}", reference, run_image),
        );
        let result = if opts.publish {
            self.rebase_registry(ctx, &reference.for_pull(), &run_image, stack).await?
        } else {
            self.rebase_daemon(ctx, reference, &run_image, stack, opts.pull, log)
                .await?
        };
        log.line(
            Phase::Rebase,
            format!("*** Image: {}", result.reference.with_digest(&result.digest)),
        );
        Ok(result)
    }

    async fn rebase_registry(
        &self,
        ctx: &OperationContext,
        target: &ImageReference,
        run_image: &ImageReference,
        stack: &Stack,
    ) -> Result<RebaseResult> {
        let app = self.registry.get_manifest(ctx, target).await?;
        app_stack_check(&app.config, stack)?;

        let run_reference = run_image.for_pull();
        let run = self
            .registry
            .get_manifest(ctx, &run_reference)
            .await
            .map_err(|e| match e {
                PackError::NotFound(_) => PackError::RunImageNotFound(run_image.to_string()),
                other => other,
            })?;
        run_stack_check(stack, &run.config)?;

        let pinned = run_reference.pinned(&run.manifest_digest).canonical();
        let (metadata, k) = run_layer_count(&app.config)?;
        let current = ImageReference::parse(&metadata.run_image.reference).map(|r| r.canonical());
        if current.is_ok_and(|current| current == pinned) {
            tracing::info!(image = %target, run_image = %pinned, "Already on run image");
            return Ok(RebaseResult {
                reference: target.clone(),
                digest: app.manifest_digest,
                run_image: pinned,
            });
        }

        let config = rebase_config(&app.config, &run.config, &pinned)?;
        let app_layers = app.manifest.layers.get(k..).ok_or_else(|| {
            PackError::InvalidInput(format!(
                "{} has fewer layers than its metadata records",
                target
            ))
        })?;

        let fan_out = self.config.upload_concurrency.max(1);
        let present: Vec<(String, bool)> = stream::iter(app_layers.iter())
            .map(|d| async move {
                let found = self.registry.head_blob(ctx, target, &d.digest).await?;
                Ok::<_, PackError>((d.digest.clone(), found))
            })
            .buffered(fan_out)
            .try_collect()
            .await?;
        let missing: Vec<String> = present
            .into_iter()
            .filter(|(_, found)| !found)
            .map(|(digest, _)| digest)
            .collect();
        if !missing.is_empty() {
            return Err(PackError::ApplicationLayersMissing {
                repository: target.name(),
                digests: missing,
            });
        }

        stream::iter(run.manifest.layers.iter())
            .map(|d| transfer_blob(self.registry.as_ref(), ctx, target, &run_reference, &d.digest))
            .buffer_unordered(fan_out)
            .try_for_each(|_| future::ok(()))
            .await?;

        let layers: Vec<Descriptor> = run
            .manifest
            .layers
            .iter()
            .chain(app_layers)
            .map(|d| Descriptor::new(DOCKER_LAYER_GZIP, d.digest.clone(), d.size))
            .collect();
        let config_bytes = Bytes::from(config.to_bytes()?);
        let config_size = config_bytes.len() as u64;
        let config_digest = self.registry.put_blob(ctx, target, config_bytes).await?;
        let manifest = ImageManifest::docker(
            Descriptor::new(DOCKER_CONFIG, config_digest, config_size),
            layers,
        );

        ctx.check("publish manifest")?;
        let digest = self.registry.put_manifest(ctx, target, &manifest).await?;
        tracing::info!(image = %target, %digest, run_image = %pinned, "Rebased image");
        Ok(RebaseResult {
            reference: target.clone(),
            digest,
            run_image: pinned,
        })
    }

    async fn rebase_daemon(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        run_image: &ImageReference,
        stack: &Stack,
        pull: bool,
        log: &PhaseLog,
    ) -> Result<RebaseResult> {
        let run_name = run_image.full_reference();
        let not_found = |e: PackError| match e {
            PackError::NotFound(_) => PackError::RunImageNotFound(run_image.to_string()),
            other => other,
        };
        if pull {
            log.line(Phase::Rebase, format!("Pulling image '{}'", run_name));
            ctx.run("image pull", self.engine.pull_image(&run_name))
                .await
                .map_err(not_found)?;
        }

        let saved = ctx
            .run("save image", self.engine.save_image(&reference.full_reference()))
            .await?;
        let app = DockerArchive::read(&saved)?;
        app_stack_check(&app.config, stack)?;

        let saved = ctx
            .run("save run image", self.engine.save_image(&run_name))
            .await
            .map_err(not_found)?;
        let run = DockerArchive::read(&saved)?;
        run_stack_check(stack, &run.config)?;

        let config = rebase_config(&app.config, &run.config, &run_name)?;
        let (_, k) = run_layer_count(&app.config)?;
        let app_layers = app.layers.get(k..).ok_or_else(|| {
            PackError::InvalidInput(format!(
                "{} has fewer layers than its metadata records",
                reference
            ))
        })?;
        let layers: Vec<Bytes> = run
            .layers
            .iter()
            .chain(app_layers)
            .cloned()
            .collect();

        let mut rebased = DockerArchive::new(config, layers);
        rebased.repo_tags = vec![reference.full_reference()];
        let image_id = rebased.image_id()?;
        ctx.check("load image")?;
        self.engine.load_image(Bytes::from(rebased.write()?)).await?;
        tracing::info!(image = %reference, %image_id, run_image = %run_name, "Rebased image");
        Ok(RebaseResult {
            reference: reference.clone(),
            digest: image_id,
            run_image: run_name,
        })
    }
}
