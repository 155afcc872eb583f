//! DockerEngine - `ContainerEngine` over the Docker API via bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
    LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{
    CommitContainerOptions, CreateImageOptions, ImportImageOptions, RemoveImageOptions,
};
use bollard::models::HostConfig;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use pack_core::error::{PackError, Result};

use super::spec::{ContainerSpec, ImageInspect};
use super::ContainerEngine;

/// Container engine backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| PackError::Daemon(format!("Failed to connect to docker: {}", e)))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Map a bollard error, turning 404s into `NotFound(what)`.
fn map_err(what: &str, err: BollardError) -> PackError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => PackError::NotFound(what.to_string()),
        other => PackError::Daemon(format!("{}: {}", what, other)),
    }
}

/// Split `name[:tag]` or `name@digest` for the image create and commit endpoints.
fn split_tag(reference: &str) -> (&str, &str) {
    if let Some((repo, digest)) = reference.split_once('@') {
        return (repo, digest);
    }
    let slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[slash..].rfind(':') {
        Some(colon) => (&reference[..slash + colon], &reference[slash + colon + 1..]),
        None => (reference, "latest"),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, reference: &str) -> Result<()> {
        let (image, tag) = split_tag(reference);
        tracing::info!(reference, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            tag,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| map_err(&format!("image {}", reference), e))?;
            if let Some(status) = progress.status {
                tracing::debug!(reference, %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_err(&format!("image {}", reference), e)),
        }
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect> {
        let inspect = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(|e| map_err(&format!("image {}", reference), e))?;
        let config = inspect.config.unwrap_or_default();
        Ok(ImageInspect {
            id: inspect.id.unwrap_or_default(),
            labels: config.labels.unwrap_or_default().into_iter().collect(),
            env: config.env.unwrap_or_default(),
            user: config.user.filter(|u| !u.is_empty()),
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let binds: Vec<String> = spec.binds.iter().map(|b| b.to_docker()).collect();
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            host_config: Some(HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_err(&format!("image {}", spec.image), e))?;
        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, %warning, "Docker warning");
        }
        tracing::debug!(container = %spec.name, id = %response.id, "Created container");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(&format!("container {}", id), e))
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        let mut exit_code = 0;
        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => exit_code = response.status_code,
                // Non-zero exits surface as this error variant
                Err(BollardError::DockerContainerWaitError { code, .. }) => exit_code = code,
                Err(e) => return Err(map_err(&format!("container {}", id), e)),
            }
        }
        Ok(exit_code)
    }

    async fn container_logs(&self, id: &str) -> Result<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| map_err(&format!("container {}", id), e))? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => {
                    text.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(text.lines().map(str::to_string).collect())
    }

    async fn copy_in(&self, id: &str, dest: &str, tar: Bytes) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), tar)
            .await
            .map_err(|e| map_err(&format!("container {}", id), e))
    }

    async fn copy_out(&self, id: &str, src: &str) -> Result<Bytes> {
        let options = DownloadFromContainerOptions {
            path: src.to_string(),
        };
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(id, Some(options))
            .try_collect()
            .await
            .map_err(|e| map_err(&format!("{} in container {}", src, id), e))?;
        Ok(Bytes::from(chunks.concat()))
    }

    async fn commit(&self, id: &str, reference: &str) -> Result<String> {
        let (repo, tag) = split_tag(reference);
        let options = CommitContainerOptions {
            container: id.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            pause: true,
            ..Default::default()
        };
        let commit = self
            .docker
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(|e| map_err(&format!("container {}", id), e))?;
        Ok(commit.id.unwrap_or_default())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 409: not running
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(map_err(&format!("container {}", id), e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err(&format!("container {}", id), e))
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_err(&format!("volume {}", name), e)),
        }
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels: HashMap::from([("io.buildpacks.pack".to_string(), "true".to_string())]),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| map_err(&format!("volume {}", name), e))?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_err(&format!("volume {}", name), e)),
        }
    }

    async fn save_image(&self, reference: &str) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self
            .docker
            .export_image(reference)
            .try_collect()
            .await
            .map_err(|e| map_err(&format!("image {}", reference), e))?;
        Ok(Bytes::from(chunks.concat()))
    }

    async fn load_image(&self, archive: Bytes) -> Result<()> {
        let mut stream =
            self.docker
                .import_image(ImportImageOptions { quiet: true }, archive, None);
        while let Some(info) = stream.next().await {
            let info = info.map_err(|e| map_err("image load", e))?;
            if let Some(error) = info.error {
                return Err(PackError::Daemon(format!("image load: {}", error)));
            }
            if let Some(stream) = info.stream {
                tracing::debug!(output = %stream.trim(), "Image load");
            }
        }
        Ok(())
    }

    async fn remove_image(&self, reference: &str, force: bool) -> Result<()> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_image(reference, Some(options), None)
            .await
            .map_err(|e| map_err(&format!("image {}", reference), e))?;
        Ok(())
    }
}
