//! OCI Distribution registry client.
//!
//! Implements the subset of the distribution API the assembler and rebaser
//! need: manifest GET/PUT, blob HEAD/GET/PUT (monolithic and chunked),
//! cross-repository mounts and the catalog. Authentication is driven by the
//! `Www-Authenticate` challenge of the first 401.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use pack_core::context::OperationContext;
use pack_core::error::{PackError, Result};
use rand::Rng;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION,
    WWW_AUTHENTICATE,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use sha2::{Digest, Sha256};

use super::auth::{repository_scope, Challenge, TokenCache, TokenResponse};
use super::credentials::RegistryAuth;
use super::manifest::{
    sha256_digest, ImageConfig, ImageManifest, ManifestDocument, MANIFEST_ACCEPT,
};
use super::reference::ImageReference;
use crate::config::EngineConfig;

/// A manifest together with the config it points at.
#[derive(Debug, Clone)]
pub struct RemoteImage {
    pub manifest: ImageManifest,
    pub manifest_digest: String,
    pub config: ImageConfig,
}

/// Registry capabilities used by the assembler and rebase engine.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Whether `digest` already exists in the reference's repository.
    async fn head_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<bool>;

    /// Blob contents, verified against `digest`.
    async fn get_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Bytes>;

    /// Upload a blob and return its digest.
    async fn put_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        data: Bytes,
    ) -> Result<String>;

    /// Mount `digest` from `from_repository` on the same registry.
    ///
    /// `Ok(false)` means the registry did not mount and the caller must copy.
    async fn mount_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        digest: &str,
        from_repository: &str,
    ) -> Result<bool>;

    /// Manifest and config for the reference, resolving indexes to the host platform.
    async fn get_manifest(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
    ) -> Result<RemoteImage>;

    /// Publish a manifest; every referenced blob must already be present.
    async fn put_manifest(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        manifest: &ImageManifest,
    ) -> Result<String>;

    /// Repositories hosted on `registry`.
    async fn catalog(&self, ctx: &OperationContext, registry: &str) -> Result<Vec<String>>;
}

/// Make `descriptor`'s blob from `source` present in `target`'s repository:
/// nothing when it is already there, a mount on the same registry, else a copy.
pub async fn transfer_blob(
    registry: &dyn ImageRegistry,
    ctx: &OperationContext,
    target: &ImageReference,
    source: &ImageReference,
    digest: &str,
) -> Result<()> {
    if registry.head_blob(ctx, target, digest).await? {
        return Ok(());
    }
    if source.registry == target.registry
        && registry
            .mount_blob(ctx, target, digest, &source.repository)
            .await?
    {
        tracing::debug!(%digest, from = %source.repository, "Mounted blob");
        return Ok(());
    }
    let data = registry.get_blob(ctx, source, digest).await?;
    registry.put_blob(ctx, target, data).await?;
    tracing::debug!(%digest, from = %source, "Copied blob");
    Ok(())
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = if registry.starts_with('[') {
        registry
            .trim_start_matches('[')
            .split(']')
            .next()
            .unwrap_or(registry)
    } else {
        registry.split(':').next().unwrap_or(registry)
    };
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

/// OS/architecture pair used to pick from image indexes.
fn host_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    };
    ("linux", arch)
}

/// What a request needs to be authorized for.
struct Access<'a> {
    host: &'a str,
    repository: &'a str,
    scopes: Vec<String>,
}

impl Access<'_> {
    fn cache_scope(&self) -> String {
        self.scopes.join(" ")
    }
}

/// Outcome of one chunked/monolithic upload attempt.
enum UploadError {
    /// The upload session expired or was forgotten by the registry.
    SessionLost,
    Failed(PackError),
}

impl From<PackError> for UploadError {
    fn from(e: PackError) -> Self {
        UploadError::Failed(e)
    }
}

/// HTTP registry client.
pub struct RegistryClient {
    client: reqwest::Client,
    config: EngineConfig,
    tokens: TokenCache,
    basic_hosts: DashSet<String>,
    credentials: DashMap<String, RegistryAuth>,
    auth_override: Option<RegistryAuth>,
}

impl RegistryClient {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("pack/{}", crate::VERSION))
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| PackError::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            tokens: TokenCache::new(),
            basic_hosts: DashSet::new(),
            credentials: DashMap::new(),
            auth_override: None,
        })
    }

    /// Use `auth` for every registry instead of resolving per host.
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth_override = Some(auth);
        self
    }

    fn auth_for(&self, host: &str) -> RegistryAuth {
        if let Some(auth) = &self.auth_override {
            return auth.clone();
        }
        self.credentials
            .entry(host.to_string())
            .or_insert_with(|| RegistryAuth::resolve(host))
            .clone()
    }

    fn base_url(host: &str) -> String {
        format!("{}://{}", registry_scheme(host), host)
    }

    fn repo_url(reference: &ImageReference, host: &str, path: &str) -> String {
        format!(
            "{}/v2/{}/{}",
            Self::base_url(host),
            reference.repository,
            path
        )
    }

    /// Resolve a `Location` header against the registry base URL.
    fn absolute_location(host: &str, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else if location.starts_with('/') {
            format!("{}{}", Self::base_url(host), location)
        } else {
            format!("{}/{}", Self::base_url(host), location)
        }
    }

    fn remote(reference: &ImageReference) -> (ImageReference, String) {
        let remote = reference.for_pull();
        let host = remote.registry.host().unwrap_or_default().to_string();
        (remote, host)
    }

    fn transport(host: &str, message: impl Into<String>) -> PackError {
        PackError::TransportFailure {
            registry: host.to_string(),
            message: message.into(),
        }
    }

    async fn backoff(&self, ctx: &OperationContext, attempt: u32) -> Result<()> {
        let base = self.config.retry_base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(6));
        let jitter = rand::thread_rng().gen_range(0..=base.max(1));
        let delay = Duration::from_millis(exp + jitter);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying registry request");
        ctx.run("registry backoff", async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Send a request with auth and retries.
    ///
    /// Connection failures and 5xx responses are retried with jittered
    /// backoff. A 401 triggers one challenge round; a second 401 is surfaced.
    async fn send<F>(
        &self,
        ctx: &OperationContext,
        what: &str,
        access: &Access<'_>,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let scope = access.cache_scope();
        let mut attempt = 0;
        let mut challenged = false;

        loop {
            let mut request = build(&self.client);
            if let Some(token) = self.tokens.get(access.host, access.repository, &scope) {
                request = request.header(AUTHORIZATION, format!("Bearer {}", token));
            } else if self.basic_hosts.contains(access.host) {
                if let Some(basic) = self.auth_for(access.host).basic_header() {
                    request = request.header(AUTHORIZATION, basic);
                }
            }

            let sent = ctx
                .run(what, async {
                    request
                        .send()
                        .await
                        .map_err(|e| Self::transport(access.host, format!("{}: {}", what, e)))
                })
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    tracing::warn!(registry = %access.host, error = %e, "Registry request failed");
                    self.backoff(ctx, attempt).await?;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                let header = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if challenged {
                    self.tokens.invalidate(access.host, access.repository, &scope);
                    return Err(PackError::Unauthorized {
                        registry: access.host.to_string(),
                        message: format!("{} rejected credentials", what),
                    });
                }
                challenged = true;
                self.answer_challenge(ctx, access, &header).await?;
                continue;
            }

            if status.is_server_error() && attempt < self.config.max_retries {
                tracing::warn!(registry = %access.host, %status, "Registry server error");
                self.backoff(ctx, attempt).await?;
                attempt += 1;
                continue;
            }

            return Ok(response);
        }
    }

    /// Obtain whatever the challenge asks for and remember it.
    async fn answer_challenge(
        &self,
        ctx: &OperationContext,
        access: &Access<'_>,
        header: &str,
    ) -> Result<()> {
        let auth = self.auth_for(access.host);
        match Challenge::parse(header) {
            Some(Challenge::Basic) => {
                if auth.is_anonymous() {
                    return Err(PackError::Unauthorized {
                        registry: access.host.to_string(),
                        message: "registry requires credentials".to_string(),
                    });
                }
                self.basic_hosts.insert(access.host.to_string());
                Ok(())
            }
            Some(Challenge::Bearer { realm, service, .. }) => {
                let mut query: Vec<(&str, String)> = Vec::new();
                if let Some(service) = service {
                    query.push(("service", service));
                }
                for scope in &access.scopes {
                    query.push(("scope", scope.clone()));
                }

                tracing::debug!(%realm, registry = %access.host, "Fetching bearer token");
                let mut request = self.client.get(&realm).query(&query);
                if let Some(basic) = auth.basic_header() {
                    request = request.header(AUTHORIZATION, basic);
                }
                let response = ctx
                    .run("token request", async {
                        request.send().await.map_err(|e| {
                            Self::transport(access.host, format!("token endpoint: {}", e))
                        })
                    })
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(PackError::Unauthorized {
                        registry: access.host.to_string(),
                        message: format!("token endpoint returned {}: {}", status, body),
                    });
                }
                let body: TokenResponse = response.json().await.map_err(|e| {
                    Self::transport(access.host, format!("invalid token response: {}", e))
                })?;
                let (token, expires_in) = body.into_token().ok_or_else(|| {
                    PackError::Unauthorized {
                        registry: access.host.to_string(),
                        message: "token response missing token field".to_string(),
                    }
                })?;
                self.tokens.insert(
                    access.host,
                    access.repository,
                    &access.cache_scope(),
                    token,
                    expires_in,
                );
                Ok(())
            }
            None => Err(PackError::Unauthorized {
                registry: access.host.to_string(),
                message: format!("unsupported auth challenge '{}'", header),
            }),
        }
    }

    /// Map a non-success response onto our error kinds.
    async fn check(response: Response, host: &str, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => PackError::NotFound(what.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PackError::Unauthorized {
                registry: host.to_string(),
                message: format!("{} returned {}: {}", what, status, body),
            },
            _ => Self::transport(host, format!("{} returned {}: {}", what, status, body)),
        })
    }

    /// Fetch a manifest document and its digest.
    async fn fetch_manifest(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        host: &str,
        tag_or_digest: &str,
    ) -> Result<(ManifestDocument, String)> {
        let url = Self::repo_url(reference, host, &format!("manifests/{}", tag_or_digest));
        let access = Access {
            host,
            repository: &reference.repository,
            scopes: vec![repository_scope(&reference.repository, false)],
        };
        let accept = MANIFEST_ACCEPT.join(", ");
        let response = self
            .send(ctx, "GET manifest", &access, |c| {
                c.get(&url).header(ACCEPT, accept.as_str())
            })
            .await?;
        let what = format!("manifest {}@{}", reference.name(), tag_or_digest);
        let response = Self::check(response, host, &what).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = ctx
            .run("read manifest", async {
                response
                    .bytes()
                    .await
                    .map_err(|e| Self::transport(host, format!("read manifest: {}", e)))
            })
            .await?;

        let digest = sha256_digest(&body);
        if tag_or_digest.starts_with("sha256:") && digest != tag_or_digest {
            return Err(Self::transport(
                host,
                format!("manifest digest mismatch: expected {}, got {}", tag_or_digest, digest),
            ));
        }
        let document = ManifestDocument::parse(content_type.as_deref(), &body)?;
        Ok((document, digest))
    }

    /// Start an upload session, returning its absolute URL.
    async fn initiate_upload(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        host: &str,
        access: &Access<'_>,
    ) -> Result<String> {
        let url = Self::repo_url(reference, host, "blobs/uploads/");
        let response = self
            .send(ctx, "POST upload", access, |c| {
                c.post(&url).header(CONTENT_LENGTH, 0)
            })
            .await?;
        let response = Self::check(response, host, "initiate upload").await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Self::transport(host, "upload response missing Location"))?;
        Ok(Self::absolute_location(host, location))
    }

    /// Whether a failed upload response means the session is gone.
    async fn upload_failure(response: Response, host: &str, what: &str) -> UploadError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND
            || body.contains("BLOB_UPLOAD_UNKNOWN")
            || body.contains("BLOB_UPLOAD_INVALID")
        {
            return UploadError::SessionLost;
        }
        let err = if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            PackError::Unauthorized {
                registry: host.to_string(),
                message: format!("{} returned {}: {}", what, status, body),
            }
        } else {
            Self::transport(host, format!("{} returned {}: {}", what, status, body))
        };
        UploadError::Failed(err)
    }

    fn with_digest_param(location: &str, digest: &str) -> String {
        let sep = if location.contains('?') { '&' } else { '?' };
        format!("{}{}digest={}", location, sep, digest)
    }

    /// Push the bytes through an open session and commit them.
    async fn upload(
        &self,
        ctx: &OperationContext,
        host: &str,
        access: &Access<'_>,
        mut location: String,
        data: &Bytes,
        digest: &str,
    ) -> std::result::Result<(), UploadError> {
        if data.len() < self.config.monolithic_threshold {
            let url = Self::with_digest_param(&location, digest);
            let response = self
                .send(ctx, "PUT blob", access, |c| {
                    c.put(&url)
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .header(CONTENT_LENGTH, data.len())
                        .body(data.clone())
                })
                .await?;
            if !response.status().is_success() {
                return Err(Self::upload_failure(response, host, "PUT blob").await);
            }
            return Ok(());
        }

        let chunk_size = self.config.chunk_size.max(1);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            let chunk = data.slice(offset..end);
            let range = format!("{}-{}", offset, end - 1);
            let url = location.clone();
            let response = self
                .send(ctx, "PATCH blob", access, |c| {
                    c.request(Method::PATCH, &url)
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .header(CONTENT_RANGE, range.as_str())
                        .header(CONTENT_LENGTH, chunk.len())
                        .body(chunk.clone())
                })
                .await?;
            if !response.status().is_success() {
                return Err(Self::upload_failure(response, host, "PATCH blob").await);
            }
            if let Some(next) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
            {
                location = Self::absolute_location(host, next);
            }
            tracing::debug!(digest, offset = end, total = data.len(), "Uploaded chunk");
            offset = end;
        }

        let url = Self::with_digest_param(&location, digest);
        let response = self
            .send(ctx, "PUT blob", access, |c| {
                c.put(&url).header(CONTENT_LENGTH, 0)
            })
            .await?;
        if !response.status().is_success() {
            return Err(Self::upload_failure(response, host, "PUT blob").await);
        }
        Ok(())
    }
}

#[async_trait]
impl ImageRegistry for RegistryClient {
    async fn head_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<bool> {
        let (reference, host) = Self::remote(reference);
        let url = Self::repo_url(&reference, &host, &format!("blobs/{}", digest));
        let access = Access {
            host: &host,
            repository: &reference.repository,
            scopes: vec![repository_scope(&reference.repository, false)],
        };
        let response = self.send(ctx, "HEAD blob", &access, |c| c.head(&url)).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Self::check(response, &host, &format!("blob {}", digest))
                .await
                .map(|_| false),
        }
    }

    async fn get_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Bytes> {
        let (reference, host) = Self::remote(reference);
        let url = Self::repo_url(&reference, &host, &format!("blobs/{}", digest));
        let access = Access {
            host: &host,
            repository: &reference.repository,
            scopes: vec![repository_scope(&reference.repository, false)],
        };
        let response = self.send(ctx, "GET blob", &access, |c| c.get(&url)).await?;
        let response = Self::check(response, &host, &format!("blob {}", digest)).await?;

        let mut hasher = Sha256::new();
        let mut data = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = ctx
            .run("read blob", async { Ok(stream.next().await) })
            .await?
        {
            let chunk = chunk.map_err(|e| Self::transport(&host, format!("read blob: {}", e)))?;
            hasher.update(&chunk);
            data.extend_from_slice(&chunk);
        }

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != digest {
            return Err(Self::transport(
                &host,
                format!("blob digest mismatch: expected {}, got {}", digest, actual),
            ));
        }
        Ok(Bytes::from(data))
    }

    async fn put_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        data: Bytes,
    ) -> Result<String> {
        let (reference, host) = Self::remote(reference);
        let digest = sha256_digest(&data);
        let access = Access {
            host: &host,
            repository: &reference.repository,
            scopes: vec![repository_scope(&reference.repository, true)],
        };

        let mut restarted = false;
        loop {
            let location = self.initiate_upload(ctx, &reference, &host, &access).await?;
            match self
                .upload(ctx, &host, &access, location, &data, &digest)
                .await
            {
                Ok(()) => break,
                Err(UploadError::SessionLost) if !restarted => {
                    tracing::warn!(%digest, registry = %host, "Upload session expired, restarting");
                    restarted = true;
                }
                Err(UploadError::SessionLost) => {
                    return Err(Self::transport(
                        &host,
                        format!("upload session for {} lost twice", digest),
                    ));
                }
                Err(UploadError::Failed(e)) => return Err(e),
            }
        }

        tracing::debug!(
            %digest,
            size = data.len(),
            repository = %reference.repository,
            "Uploaded blob"
        );
        Ok(digest)
    }

    async fn mount_blob(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        digest: &str,
        from_repository: &str,
    ) -> Result<bool> {
        let (reference, host) = Self::remote(reference);
        let url = Self::repo_url(&reference, &host, "blobs/uploads/");
        let access = Access {
            host: &host,
            repository: &reference.repository,
            scopes: vec![
                repository_scope(&reference.repository, true),
                repository_scope(from_repository, false),
            ],
        };
        let query = [("mount", digest), ("from", from_repository)];
        let response = match self
            .send(ctx, "mount blob", &access, |c| {
                c.post(&url).query(&query).header(CONTENT_LENGTH, 0)
            })
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                tracing::debug!(%digest, error = %e, "Blob mount failed");
                return Ok(false);
            }
        };
        let mounted = response.status() == StatusCode::CREATED;
        tracing::debug!(%digest, from = %from_repository, mounted, "Blob mount attempted");
        Ok(mounted)
    }

    async fn get_manifest(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
    ) -> Result<RemoteImage> {
        let (reference, host) = Self::remote(reference);
        let (document, mut manifest_digest) = self
            .fetch_manifest(ctx, &reference, &host, reference.tag_or_digest())
            .await?;

        let manifest = match document {
            ManifestDocument::Image(manifest) => manifest,
            ManifestDocument::Index(index) => {
                let (os, arch) = host_platform();
                let entry = index.select(os, arch).ok_or_else(|| {
                    PackError::NotFound(format!(
                        "{} has no {}/{} manifest",
                        reference, os, arch
                    ))
                })?;
                tracing::info!(digest = %entry.digest, "Resolved platform {}/{}", os, arch);
                let digest = entry.digest.clone();
                let (document, digest) = self
                    .fetch_manifest(ctx, &reference, &host, &digest)
                    .await?;
                manifest_digest = digest;
                match document {
                    ManifestDocument::Image(manifest) => manifest,
                    ManifestDocument::Index(_) => {
                        return Err(Self::transport(&host, "nested image index"));
                    }
                }
            }
        };

        let config_bytes = self
            .get_blob(ctx, &reference, &manifest.config.digest)
            .await?;
        let config = ImageConfig::from_slice(&config_bytes)?;
        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(PackError::Other(format!(
                "{}: config lists {} diff-ids for {} layers",
                reference,
                config.rootfs.diff_ids.len(),
                manifest.layers.len()
            )));
        }

        Ok(RemoteImage {
            manifest,
            manifest_digest,
            config,
        })
    }

    async fn put_manifest(
        &self,
        ctx: &OperationContext,
        reference: &ImageReference,
        manifest: &ImageManifest,
    ) -> Result<String> {
        let (reference, host) = Self::remote(reference);
        let body = Bytes::from(manifest.to_bytes()?);
        let digest = sha256_digest(&body);
        let url = Self::repo_url(
            &reference,
            &host,
            &format!("manifests/{}", reference.tag_or_digest()),
        );
        let access = Access {
            host: &host,
            repository: &reference.repository,
            scopes: vec![repository_scope(&reference.repository, true)],
        };
        let content_type = manifest.content_type().to_string();
        let response = self
            .send(ctx, "PUT manifest", &access, |c| {
                c.put(&url)
                    .header(CONTENT_TYPE, content_type.as_str())
                    .body(body.clone())
            })
            .await?;
        Self::check(response, &host, &format!("manifest {}", reference)).await?;

        tracing::info!(reference = %reference, %digest, "Published manifest");
        Ok(digest)
    }

    async fn catalog(&self, ctx: &OperationContext, registry: &str) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Catalog {
            #[serde(default)]
            repositories: Vec<String>,
        }

        let url = format!("{}/v2/_catalog", Self::base_url(registry));
        let access = Access {
            host: registry,
            repository: "",
            scopes: vec!["registry:catalog:*".to_string()],
        };
        let response = self.send(ctx, "GET catalog", &access, |c| c.get(&url)).await?;
        let response = Self::check(response, registry, "catalog").await?;
        let catalog: Catalog = response
            .json()
            .await
            .map_err(|e| Self::transport(registry, format!("invalid catalog: {}", e)))?;
        Ok(catalog.repositories)
    }
}
