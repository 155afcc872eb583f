//! Per-repository build cache.
//!
//! Every repository gets one named volume, mounted at `/layers` during the
//! build. Concurrent builds of the same repository serialize on an advisory
//! file lock next to the stack configuration.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use pack_core::context::OperationContext;
use pack_core::error::{PackError, Result};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::daemon::ContainerEngine;
use crate::oci::reference::ImageReference;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_POLL_JITTER_MS: u64 = 50;

/// Held for the duration of a build; releases the volume lock on drop.
#[derive(Debug)]
pub struct CacheLock {
    _file: File,
    volume: String,
}

impl CacheLock {
    pub fn volume(&self) -> &str {
        &self.volume
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        tracing::debug!(volume = %self.volume, "Released cache lock");
    }
}

/// Maps repositories to cache volumes and guards their use.
pub struct CacheManager {
    engine: Arc<dyn ContainerEngine>,
    lock_dir: PathBuf,
    lock_timeout: Duration,
}

impl CacheManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        lock_dir: impl Into<PathBuf>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            lock_dir: lock_dir.into(),
            lock_timeout,
        }
    }

    /// Volume name for a repository; the tag and digest do not matter.
    pub fn volume_for(reference: &ImageReference) -> String {
        let hash = hex::encode(Sha256::digest(reference.name().as_bytes()));
        format!("pack-cache-{}", &hash[..12])
    }

    fn lock_path(&self, volume: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", volume))
    }

    /// Take the repository's cache lock, waiting up to the configured timeout.
    pub async fn lock(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
    ) -> Result<CacheLock> {
        let volume = Self::volume_for(reference);
        let path = self.lock_path(&volume);
        let started = Instant::now();
        let mut announced = false;

        loop {
            if let Some(file) = try_lock(&path)? {
                tracing::debug!(%volume, "Acquired cache lock");
                return Ok(CacheLock {
                    _file: file,
                    volume,
                });
            }
            if started.elapsed() >= self.lock_timeout {
                return Err(PackError::CacheBusy(format!(
                    "cache {} for {} is in use by another build (waited {}s)",
                    volume,
                    reference.name(),
                    self.lock_timeout.as_secs()
                )));
            }
            if !announced {
                tracing::info!(%volume, "Waiting for another build to release the cache");
                announced = true;
            }
            let jitter = rand::random::<u64>() % (LOCK_POLL_JITTER_MS + 1);
            ctx.run("cache lock wait", async {
                tokio::time::sleep(LOCK_POLL_INTERVAL + Duration::from_millis(jitter)).await;
                Ok(())
            })
            .await?;
        }
    }

    /// Create the volume when missing and return its name.
    pub async fn ensure(&self, reference: &ImageReference) -> Result<String> {
        let volume = Self::volume_for(reference);
        if !self.engine.volume_exists(&volume).await? {
            tracing::info!(%volume, repository = %reference.name(), "Creating cache volume");
            self.engine.create_volume(&volume).await?;
        }
        Ok(volume)
    }

    /// Remove the repository's cache volume.
    pub async fn drop(&self, reference: &ImageReference) -> Result<()> {
        let volume = Self::volume_for(reference);
        tracing::info!(%volume, repository = %reference.name(), "Dropping cache volume");
        self.engine.remove_volume(&volume).await
    }
}

/// Open the lock file and try to take it without blocking.
fn try_lock(path: &Path) -> Result<Option<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            PackError::Other(format!("Failed to open lock file {}: {}", path.display(), e))
        })?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
        Err(e) => Err(PackError::Other(format!(
            "Failed to lock {}: {}",
            path.display(),
            e
        ))),
    }
}
