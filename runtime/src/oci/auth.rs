//! `Www-Authenticate` challenge parsing and the bearer token cache.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;

/// Tokens are refreshed this long before their advertised expiry.
const EXPIRY_SLACK: Duration = Duration::from_secs(10);

/// A parsed `Www-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl Challenge {
    /// Parse `Bearer realm="…",service="…",scope="…"` or `Basic realm="…"`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let realm = extract_param(params, "realm")?;
        if realm.is_empty() {
            return None;
        }
        Some(Challenge::Bearer {
            realm,
            service: extract_param(params, "service"),
            scope: extract_param(params, "scope"),
        })
    }
}

/// `repository:<name>:<actions>` scope string.
pub fn repository_scope(repository: &str, push: bool) -> String {
    if push {
        format!("repository:{}:pull,push", repository)
    } else {
        format!("repository:{}:pull", repository)
    }
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    let mut offset = 0;
    while let Some(found) = header[offset..].find(&search) {
        let start = offset + found;
        // Only match whole parameter names
        let boundary = start == 0 || matches!(header.as_bytes()[start - 1], b',' | b' ');
        let value_start = start + search.len();
        if boundary {
            let end = header[value_start..].find('"')?;
            return Some(header[value_start..value_start + end].to_string());
        }
        offset = value_start;
    }
    None
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    pub fn into_token(self) -> Option<(String, Option<u64>)> {
        let expires_in = self.expires_in;
        self.token
            .or(self.access_token)
            .filter(|t| !t.is_empty())
            .map(|t| (t, expires_in))
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Option<Instant>,
}

/// Bearer tokens keyed by (registry, repository, scope).
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: DashMap<(String, String, String), CachedToken>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, registry: &str, repository: &str, scope: &str) -> Option<String> {
        let key = (registry.to_string(), repository.to_string(), scope.to_string());
        let entry = self.tokens.get(&key)?;
        match entry.expires_at {
            Some(at) if Instant::now() >= at => {
                drop(entry);
                self.tokens.remove(&key);
                None
            }
            _ => Some(entry.token.clone()),
        }
    }

    pub fn insert(
        &self,
        registry: &str,
        repository: &str,
        scope: &str,
        token: String,
        expires_in: Option<u64>,
    ) {
        let expires_at = expires_in.map(|secs| {
            Instant::now() + Duration::from_secs(secs).saturating_sub(EXPIRY_SLACK)
        });
        self.tokens.insert(
            (registry.to_string(), repository.to_string(), scope.to_string()),
            CachedToken { token, expires_at },
        );
    }

    /// Drop a token the registry rejected.
    pub fn invalidate(&self, registry: &str, repository: &str, scope: &str) {
        self.tokens.remove(&(
            registry.to_string(),
            repository.to_string(),
            scope.to_string(),
        ));
    }
}
