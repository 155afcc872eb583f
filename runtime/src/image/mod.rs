//! Image assembler.
//!
//! Turns the exported lifecycle output into the application image: the run
//! image's layers, then the launcher, the launch config, the app and every
//! buildpack launch layer. The result is loaded into the daemon or pushed to
//! the registry with the manifest written last.

pub mod metadata;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::{future, stream, StreamExt, TryStreamExt};
use pack_core::context::OperationContext;
use pack_core::error::{PackError, Result};

use crate::config::EngineConfig;
use crate::daemon::ContainerEngine;
use crate::lifecycle::buildpack::escape_id;
use crate::lifecycle::layers::{BuildpackOutput, LaunchToml};
use crate::log::{Phase, PhaseLog};
use crate::oci::archive::DockerArchive;
use crate::oci::layers::{files_in_dir, tar_dir, tar_single_file, Layer, LayerStore};
use crate::oci::manifest::{
    Descriptor, History, ImageConfig, ImageManifest, DOCKER_CONFIG, DOCKER_LAYER_GZIP,
};
use crate::oci::reference::ImageReference;
use crate::oci::registry::{transfer_blob, ImageRegistry, RemoteImage};

pub use metadata::{
    BuildpackLayerMetadata, BuildpackMetadata, LayerMetadata, LifecycleMetadata,
    RunImageMetadata, LIFECYCLE_METADATA_LABEL, STACK_ID_LABEL,
};

pub const LAUNCHER_PATH: &str = "/lifecycle/launcher";
pub const LAYERS_DIR: &str = "/layers";
pub const APP_DIR: &str = "/workspace/app";

/// The image a build replaces, as seen by Analyze.
#[derive(Debug, Clone)]
pub struct PriorImage {
    pub metadata: LifecycleMetadata,
    pub source: PriorSource,
}

#[derive(Debug, Clone)]
pub enum PriorSource {
    /// Manifest and config fetched from the registry
    Registry(RemoteImage),
    /// Image in the daemon; layers are read with `save_image` when needed
    Daemon(String),
}

/// Everything export needs from the build.
pub struct ExportRequest<'a> {
    pub target: &'a ImageReference,
    pub publish: bool,
    pub stack_id: &'a str,
    pub run_image: &'a ImageReference,
    pub launcher: &'a [u8],
    pub app_dir: &'a Path,
    pub outputs: &'a [BuildpackOutput],
    pub prior: Option<&'a PriorImage>,
    pub log: &'a PhaseLog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exported {
    /// Manifest digest (registry) or image id (daemon)
    pub digest: String,
    /// `<bp>:<layer>` of every layer taken over from the prior image
    pub reused: Vec<String>,
}

enum LayerSource {
    /// Ingested into the scratch store during this export
    Fresh(Layer),
    /// Blob already in the target repository
    Remote(Descriptor),
    /// Uncompressed tar read from the daemon
    Local(Bytes),
}

struct ExportLayer {
    diff_id: String,
    created_by: String,
    source: LayerSource,
}

impl ExportLayer {
    fn fresh(layer: Layer, created_by: impl Into<String>) -> Self {
        Self {
            diff_id: layer.diff_id.clone(),
            created_by: created_by.into(),
            source: LayerSource::Fresh(layer),
        }
    }
}

/// The run image the application is stacked on.
enum Base {
    Remote {
        reference: ImageReference,
        image: RemoteImage,
    },
    Local(DockerArchive),
}

impl Base {
    fn config(&self) -> &ImageConfig {
        match self {
            Base::Remote { image, .. } => &image.config,
            Base::Local(archive) => &archive.config,
        }
    }
}

pub struct ImageAssembler {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn ImageRegistry>,
    config: EngineConfig,
}

impl ImageAssembler {
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

    /// Build and publish the application image.
    pub async fn export(&self, ctx: &OperationContext, req: ExportRequest<'_>) -> Result<Exported> {
        let base = self.base(ctx, &req).await?;
        let store = LayerStore::temporary()?;
        let (uid, gid) = (self.config.user_id, self.config.group_id);
        let mut layers = Vec::new();
        let mut metadata = LifecycleMetadata::default();
        let mut reused = Vec::new();
        let mut prior_archive: Option<DockerArchive> = None;

        let launcher = store.ingest(&tar_single_file(LAUNCHER_PATH, req.launcher, 0o755)?[..])?;
        metadata.launcher = layer_metadata(&launcher);
        layers.push(ExportLayer::fresh(launcher, "pack: launcher"));

        let launch = LaunchToml::merge(req.outputs.iter().map(|o| &o.launch));
        let launch_toml = toml::to_string(&launch)?;
        let config_layer = store.ingest(
            &tar_single_file("/layers/config/metadata.toml", launch_toml.as_bytes(), 0o644)?[..],
        )?;
        metadata.config = layer_metadata(&config_layer);
        layers.push(ExportLayer::fresh(config_layer, "pack: launch config"));

        let app = store.ingest(&tar_dir(req.app_dir, APP_DIR, uid, gid)?[..])?;
        metadata.app = layer_metadata(&app);
        layers.push(ExportLayer::fresh(app, "pack: app"));

        let mut launch_env = BTreeMap::new();
        for output in req.outputs {
            let id = &output.buildpack.id;
            let mut recorded_layers = BTreeMap::new();
            for layer in output.launch_layers() {
                ctx.check("export")?;
                let key = format!("{}:{}", id, layer.name);
                let recorded = req
                    .prior
                    .and_then(|p| p.metadata.buildpack_layer(id, &layer.name));
                let data = layer
                    .toml
                    .metadata
                    .as_ref()
                    .map(metadata::toml_to_json)
                    .unwrap_or(serde_json::Value::Null);

                match &layer.dir {
                    Some(dir) => {
                        let target = format!("{}/{}/{}", LAYERS_DIR, escape_id(id), layer.name);
                        let ingested = store.ingest(&tar_dir(dir, &target, uid, gid)?[..])?;
                        if recorded.is_some_and(|r| r.sha == ingested.diff_id) {
                            req.log.line(
                                Phase::Export,
                                format!("reusing layer '{}' with SHA {}", key, ingested.diff_id),
                            );
                            reused.push(key.clone());
                        } else {
                            tracing::debug!(
                                layer = %key,
                                diff_id = %ingested.diff_id,
                                "New launch layer"
                            );
                        }
                        launch_env.extend(layer.launch_env());
                        recorded_layers.insert(
                            layer.name.clone(),
                            BuildpackLayerMetadata {
                                sha: ingested.diff_id.clone(),
                                data,
                            },
                        );
                        layers.push(ExportLayer::fresh(ingested, format!("buildpack: {}", key)));
                    }
                    None => {
                        let (Some(recorded), Some(prior)) = (recorded, req.prior) else {
                            tracing::warn!(
                                layer = %key,
                                "Launch layer has no contents and no previous image; skipping"
                            );
                            continue;
                        };
                        req.log.line(
                            Phase::Export,
                            format!("reusing layer '{}' from previous image", key),
                        );
                        reused.push(key.clone());
                        let source = self
                            .prior_layer(ctx, prior, &recorded.sha, &mut prior_archive)
                            .await?;
                        let env_dir =
                            format!("{}/{}/{}/env.launch", LAYERS_DIR, escape_id(id), layer.name);
                        launch_env.extend(
                            self.prior_launch_env(ctx, req.target, &source, &env_dir)
                                .await?,
                        );
                        recorded_layers.insert(
                            layer.name.clone(),
                            BuildpackLayerMetadata {
                                sha: recorded.sha.clone(),
                                data: if data.is_null() { recorded.data.clone() } else { data },
                            },
                        );
                        layers.push(ExportLayer {
                            diff_id: recorded.sha.clone(),
                            created_by: format!("buildpack: {}", key),
                            source,
                        });
                    }
                }
            }
            metadata.buildpacks.push(BuildpackMetadata {
                id: id.clone(),
                version: output.buildpack.version.clone(),
                layers: recorded_layers,
            });
        }

        metadata.run_image = RunImageMetadata {
            layers: base.config().rootfs.diff_ids.len(),
            reference: match &base {
                Base::Remote { reference, image } => reference.with_digest(&image.manifest_digest),
                Base::Local(_) => req.run_image.full_reference(),
            },
        };

        let config = assemble_config(
            base.config(),
            &layers,
            &launch,
            &launch_env,
            req.stack_id,
            &metadata,
        )?;

        let digest = match base {
            Base::Remote { reference, image } => {
                self.publish_registry(ctx, req.target, &reference, &image, &layers, &store, &config)
                    .await?
            }
            Base::Local(archive) => {
                self.publish_daemon(req.target, archive, &layers, &store, config)
                    .await?
            }
        };
        tracing::info!(image = %req.target, %digest, "Exported image");
        Ok(Exported { digest, reused })
    }

    async fn base(&self, ctx: &OperationContext, req: &ExportRequest<'_>) -> Result<Base> {
        if req.publish {
            let reference = req.run_image.for_pull();
            let image = self
                .registry
                .get_manifest(ctx, &reference)
                .await
                .map_err(|e| run_image_error(req.run_image, e))?;
            Ok(Base::Remote { reference, image })
        } else {
            let saved = self
                .engine
                .save_image(&req.run_image.full_reference())
                .await
                .map_err(|e| run_image_error(req.run_image, e))?;
            Ok(Base::Local(DockerArchive::read(&saved)?))
        }
    }

    /// A layer of the prior image, located by diff-id.
    async fn prior_layer(
        &self,
        ctx: &OperationContext,
        prior: &PriorImage,
        diff_id: &str,
        archive: &mut Option<DockerArchive>,
    ) -> Result<LayerSource> {
        match &prior.source {
            PriorSource::Registry(image) => {
                let index = image
                    .config
                    .rootfs
                    .diff_ids
                    .iter()
                    .position(|d| d == diff_id)
                    .ok_or_else(|| {
                        PackError::ExportFailed(format!("previous image has no layer {}", diff_id))
                    })?;
                let descriptor = image.manifest.layers.get(index).cloned().ok_or_else(|| {
                    PackError::ExportFailed(format!(
                        "previous image manifest lacks layer {}",
                        index
                    ))
                })?;
                Ok(LayerSource::Remote(descriptor))
            }
            PriorSource::Daemon(reference) => {
                if archive.is_none() {
                    ctx.check("read previous image")?;
                    let saved = self.engine.save_image(reference).await?;
                    *archive = Some(DockerArchive::read(&saved)?);
                }
                let prior = archive.as_ref().ok_or_else(|| {
                    PackError::ExportFailed(format!("previous image {} unavailable", reference))
                })?;
                prior
                    .config
                    .rootfs
                    .diff_ids
                    .iter()
                    .position(|d| d == diff_id)
                    .and_then(|i| prior.layers.get(i).cloned())
                    .map(LayerSource::Local)
                    .ok_or_else(|| {
                        PackError::ExportFailed(format!("previous image has no layer {}", diff_id))
                    })
            }
        }
    }

    /// `env.launch` files of a layer taken over from the prior image.
    async fn prior_launch_env(
        &self,
        ctx: &OperationContext,
        target: &ImageReference,
        source: &LayerSource,
        env_dir: &str,
    ) -> Result<BTreeMap<String, String>> {
        let data = match source {
            LayerSource::Remote(d) => self.registry.get_blob(ctx, target, &d.digest).await?,
            LayerSource::Local(data) => data.clone(),
            LayerSource::Fresh(_) => return Ok(BTreeMap::new()),
        };
        Ok(files_in_dir(&data, env_dir)?
            .into_iter()
            .map(|(name, value)| (name, String::from_utf8_lossy(&value).into_owned()))
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish_registry(
        &self,
        ctx: &OperationContext,
        target: &ImageReference,
        run_reference: &ImageReference,
        run: &RemoteImage,
        layers: &[ExportLayer],
        store: &LayerStore,
        config: &ImageConfig,
    ) -> Result<String> {
        let fan_out = self.config.upload_concurrency.max(1);

        stream::iter(run.manifest.layers.iter())
            .map(|descriptor| {
                transfer_blob(
                    self.registry.as_ref(),
                    ctx,
                    target,
                    run_reference,
                    &descriptor.digest,
                )
            })
            .buffer_unordered(fan_out)
            .try_for_each(|_| future::ok(()))
            .await?;

        let mut descriptors: Vec<Descriptor> = run
            .manifest
            .layers
            .iter()
            .map(|d| Descriptor::new(DOCKER_LAYER_GZIP, d.digest.clone(), d.size))
            .collect();
        for layer in layers {
            match &layer.source {
                LayerSource::Fresh(l) => {
                    descriptors.push(Descriptor::new(DOCKER_LAYER_GZIP, l.digest.clone(), l.size))
                }
                LayerSource::Remote(d) => {
                    descriptors.push(Descriptor::new(DOCKER_LAYER_GZIP, d.digest.clone(), d.size))
                }
                LayerSource::Local(_) => {
                    return Err(PackError::ExportFailed(
                        "daemon layer cannot be published to a registry".to_string(),
                    ))
                }
            }
        }

        stream::iter(layers.iter())
            .map(|layer| self.upload_layer(ctx, target, store, layer))
            .buffer_unordered(fan_out)
            .try_for_each(|_| future::ok(()))
            .await?;

        let config_bytes = Bytes::from(config.to_bytes()?);
        let config_size = config_bytes.len() as u64;
        let config_digest = self.registry.put_blob(ctx, target, config_bytes).await?;
        let manifest = ImageManifest::docker(
            Descriptor::new(DOCKER_CONFIG, config_digest, config_size),
            descriptors,
        );

        ctx.check("publish manifest")?;
        self.registry.put_manifest(ctx, target, &manifest).await
    }

    async fn upload_layer(
        &self,
        ctx: &OperationContext,
        target: &ImageReference,
        store: &LayerStore,
        layer: &ExportLayer,
    ) -> Result<()> {
        match &layer.source {
            LayerSource::Fresh(l) => {
                if self.registry.head_blob(ctx, target, &l.digest).await? {
                    tracing::debug!(digest = %l.digest, "Layer already present");
                    return Ok(());
                }
                let blob = store.read_blob(&l.digest)?;
                let digest = self.registry.put_blob(ctx, target, blob).await?;
                tracing::debug!(%digest, by = %layer.created_by, "Uploaded layer");
                Ok(())
            }
            LayerSource::Remote(d) => {
                if self.registry.head_blob(ctx, target, &d.digest).await? {
                    Ok(())
                } else {
                    Err(PackError::ExportFailed(format!(
                        "layer {} of the previous image is gone from {}",
                        d.digest,
                        target.name()
                    )))
                }
            }
            LayerSource::Local(_) => Ok(()),
        }
    }

    async fn publish_daemon(
        &self,
        target: &ImageReference,
        mut archive: DockerArchive,
        layers: &[ExportLayer],
        store: &LayerStore,
        config: ImageConfig,
    ) -> Result<String> {
        for layer in layers {
            let data = match &layer.source {
                LayerSource::Fresh(l) => Bytes::from(store.uncompressed(l)?),
                LayerSource::Local(data) => data.clone(),
                LayerSource::Remote(d) => {
                    return Err(PackError::ExportFailed(format!(
                        "registry layer {} cannot be loaded into the daemon",
                        d.digest
                    )))
                }
            };
            archive.layers.push(data);
        }
        archive.config = config;
        archive.repo_tags = vec![target.full_reference()];
        let image_id = archive.image_id()?;
        self.engine
            .load_image(Bytes::from(archive.write()?))
            .await?;
        Ok(image_id)
    }
}

fn layer_metadata(layer: &Layer) -> LayerMetadata {
    LayerMetadata {
        sha: layer.diff_id.clone(),
        layer_digest: Some(layer.digest.clone()),
    }
}

fn run_image_error(run_image: &ImageReference, err: PackError) -> PackError {
    match err {
        PackError::NotFound(_) => PackError::RunImageNotFound(run_image.to_string()),
        other => other,
    }
}

/// The run image's config with the application stacked on top.
fn assemble_config(
    base: &ImageConfig,
    layers: &[ExportLayer],
    launch: &LaunchToml,
    launch_env: &BTreeMap<String, String>,
    stack_id: &str,
    metadata: &LifecycleMetadata,
) -> Result<ImageConfig> {
    let created = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let mut config = base.clone();
    config.created = Some(created.clone());
    for layer in layers {
        config.rootfs.diff_ids.push(layer.diff_id.clone());
        config
            .history
            .push(History::layer(&created, layer.created_by.clone()));
    }

    let container = &mut config.config;
    container.set_env("PACK_LAYERS_DIR", LAYERS_DIR);
    container.set_env("PACK_APP_DIR", APP_DIR);
    for (key, value) in launch_env {
        container.set_env(key, value);
    }
    container.entrypoint = Some(vec![LAUNCHER_PATH.to_string()]);
    container.cmd = launch.default_process().map(|p| vec![p.kind.clone()]);
    container.working_dir = Some(APP_DIR.to_string());

    config.set_label(STACK_ID_LABEL, stack_id);
    config.set_label(LIFECYCLE_METADATA_LABEL, metadata.to_label()?);
    Ok(config)
}
