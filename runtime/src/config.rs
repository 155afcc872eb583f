//! Engine tunables.

use std::time::Duration;

/// Default per-request HTTP timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries on transport failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default number of parallel blob uploads per image.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;

/// Default wait for a busy cache volume.
pub const DEFAULT_CACHE_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default chunk size for chunked blob uploads: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Tunables shared by the registry client, cache manager and orchestrator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout applied to every HTTP request
    pub http_timeout: Duration,
    /// Retries after the first attempt on connection failure or 5xx
    pub max_retries: u32,
    /// Base delay for jittered exponential backoff
    pub retry_base_delay: Duration,
    /// Parallel blob uploads when publishing
    pub upload_concurrency: usize,
    /// How long a build waits for a cache volume held by another build
    pub cache_lock_timeout: Duration,
    /// Bytes per PATCH request in chunked uploads
    pub chunk_size: usize,
    /// Blobs at or above this size are uploaded in chunks
    pub monolithic_threshold: usize,
    /// Container user id that owns `/workspace` and `/layers`
    pub user_id: u32,
    /// Container group id that owns `/workspace` and `/layers`
    pub group_id: u32,
    /// Suppress phase output on stdout
    pub quiet: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(200),
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            cache_lock_timeout: DEFAULT_CACHE_LOCK_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            monolithic_threshold: DEFAULT_CHUNK_SIZE,
            user_id: 1000,
            group_id: 1000,
            quiet: false,
        }
    }
}

impl EngineConfig {
    /// Defaults, with `PACK_USER_ID` / `PACK_GROUP_ID` honoured when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(uid) = env_u32("PACK_USER_ID") {
            config.user_id = uid;
        }
        if let Some(gid) = env_u32("PACK_GROUP_ID") {
            config.group_id = gid;
        }
        config
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

fn env_u32(key: &str) -> Option<u32> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "Ignoring non-numeric id");
            None
        }
    }
}
