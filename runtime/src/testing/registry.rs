//! In-memory `ImageRegistry`.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use pack_core::context::OperationContext;
use pack_core::error::{PackError, Result};
use parking_lot::Mutex;

use crate::oci::manifest::{sha256_digest, ImageConfig, ImageManifest};
use crate::oci::reference::ImageReference;
use crate::oci::registry::{ImageRegistry, RemoteImage};

#[derive(Default)]
struct State {
    /// repository -> digest -> blob
    blobs: HashMap<String, HashMap<String, Bytes>>,
    /// (repository, tag or digest) -> manifest bytes
    manifests: HashMap<(String, String), Bytes>,
    journal: Vec<String>,
    failing: BTreeSet<String>,
}

/// Registry holding blobs per repository, as a real registry does.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `operation` (e.g. `put_manifest`) fail.
    pub fn fail(&self, operation: &str) {
        self.state.lock().failing.insert(operation.to_string());
    }

    pub fn heal(&self, operation: &str) {
        self.state.lock().failing.remove(operation);
    }

    /// Calls made so far, as `<operation> <repository> <detail>`.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    /// Journal entries that change registry state, in call order.
    pub fn writes(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter(|entry| {
                !["get_", "head_", "catalog"]
                    .iter()
                    .any(|read| entry.starts_with(read))
            })
            .collect()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        self.state
            .lock()
            .blobs
            .get(repository)
            .is_some_and(|b| b.contains_key(digest))
    }

    /// Forget a blob, as garbage collection would.
    pub fn delete_blob(&self, repository: &str, digest: &str) {
        if let Some(blobs) = self.state.lock().blobs.get_mut(repository) {
            blobs.remove(digest);
        }
    }

    /// Store a blob directly, bypassing the journal.
    pub fn seed_blob(&self, repository: &str, data: Bytes) -> String {
        let digest = sha256_digest(&data);
        self.state
            .lock()
            .blobs
            .entry(repository.to_string())
            .or_default()
            .insert(digest.clone(), data);
        digest
    }

    /// Store a manifest directly, bypassing blob checks and the journal.
    pub fn seed_manifest(&self, reference: &ImageReference, manifest: &ImageManifest) -> String {
        let body = Bytes::from(manifest.to_bytes().unwrap_or_default());
        let digest = sha256_digest(&body);
        let mut state = self.state.lock();
        let repository = reference.repository.clone();
        state.manifests.insert(
            (repository.clone(), reference.tag_or_digest().to_string()),
            body.clone(),
        );
        state.manifests.insert((repository, digest.clone()), body);
        digest
    }

    /// Digest of the manifest a tag currently points at.
    pub fn manifest_digest(&self, reference: &ImageReference) -> Option<String> {
        self.state
            .lock()
            .manifests
            .get(&(
                reference.repository.clone(),
                reference.tag_or_digest().to_string(),
            ))
            .map(|body| sha256_digest(body))
    }

    fn enter(&self, operation: &str, repository: &str, detail: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .journal
            .push(format!("{} {} {}", operation, repository, detail));
        if state.failing.contains(operation) {
            return Err(PackError::TransportFailure {
                registry: "memory".to_string(),
                message: format!("injected failure in {}", operation),
            });
        }
        Ok(())
    }

    fn blob(&self, repository: &str, digest: &str) -> Option<Bytes> {
        self.state
            .lock()
            .blobs
            .get(repository)
            .and_then(|b| b.get(digest))
            .cloned()
    }
}

#[async_trait]
impl ImageRegistry for MemoryRegistry {
    async fn head_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<bool> {
        ctx.check("HEAD blob")?;
        self.enter("head_blob", &reference.repository, digest)?;
        Ok(self.has_blob(&reference.repository, digest))
    }

    async fn get_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Bytes> {
        ctx.check("GET blob")?;
        self.enter("get_blob", &reference.repository, digest)?;
        self.blob(&reference.repository, digest)
            .ok_or_else(|| PackError::NotFound(format!("blob {}", digest)))
    }

    async fn put_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        data: Bytes,
    ) -> Result<String> {
        ctx.check("PUT blob")?;
        let digest = sha256_digest(&data);
        self.enter("put_blob", &reference.repository, &digest)?;
        self.seed_blob(&reference.repository, data);
        Ok(digest)
    }

    async fn mount_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        digest: &str,
        from_repository: &str,
    ) -> Result<bool> {
        ctx.check("mount blob")?;
        self.enter("mount_blob", &reference.repository, digest)?;
        match self.blob(from_repository, digest) {
            Some(data) => {
                self.seed_blob(&reference.repository, data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_manifest(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
    ) -> Result<RemoteImage> {
        ctx.check("GET manifest")?;
        self.enter(
            "get_manifest",
            &reference.repository,
            reference.tag_or_digest(),
        )?;
        let body = self
            .state
            .lock()
            .manifests
            .get(&(
                reference.repository.clone(),
                reference.tag_or_digest().to_string(),
            ))
            .cloned()
            .ok_or_else(|| PackError::NotFound(format!("manifest {}", reference)))?;
        let manifest: ImageManifest = serde_json::from_slice(&body)?;
        let config_bytes = self
            .blob(&reference.repository, &manifest.config.digest)
            .ok_or_else(|| PackError::NotFound(format!("blob {}", manifest.config.digest)))?;
        Ok(RemoteImage {
            manifest_digest: sha256_digest(&body),
            config: ImageConfig::from_slice(&config_bytes)?,
            manifest,
        })
    }

    async fn put_manifest(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        manifest: &ImageManifest,
    ) -> Result<String> {
        ctx.check("PUT manifest")?;
        self.enter(
            "put_manifest",
            &reference.repository,
            reference.tag_or_digest(),
        )?;
        let missing: Vec<&str> = std::iter::once(&manifest.config)
            .chain(&manifest.layers)
            .map(|d| d.digest.as_str())
            .filter(|d| !self.has_blob(&reference.repository, d))
            .collect();
        if !missing.is_empty() {
            return Err(PackError::TransportFailure {
                registry: "memory".to_string(),
                message: format!("MANIFEST_BLOB_UNKNOWN: {}", missing.join(", ")),
            });
        }
        Ok(self.seed_manifest(reference, manifest))
    }

    async fn catalog(&self, ctx: &OperationContext, _registry: &str) -> Result<Vec<String>> {
        ctx.check("GET catalog")?;
        let state = self.state.lock();
        let repositories: BTreeSet<String> =
            state.manifests.keys().map(|(repo, _)| repo.clone()).collect();
        Ok(repositories.into_iter().collect())
    }
}
