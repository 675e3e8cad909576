//! Bearer tokens for the cloud REST APIs.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Deserialize;
use strongbox_core::ServiceError;
use tokio::sync::Mutex;
use tracing::debug;

use crate::http::transport_err;

const GCP_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const AZURE_METADATA_TOKEN_URL: &str =
    "http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01";
/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Source of OAuth bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, ServiceError>;
}

/// Pre-issued token handed in through the environment.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, ServiceError> {
        Ok(self.0.clone())
    }
}

/// Token read from a file on every use, so projected service-account tokens
/// that the kubelet rotates are picked up.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenSource for TokenFile {
    async fn token(&self) -> Result<String, ServiceError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ServiceError::unavailable(format!("reading token {}: {e}", self.path.display()))
        })?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(ServiceError::unavailable(format!(
                "token file {} is empty",
                self.path.display()
            )));
        }
        Ok(token.to_string())
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Token fetched from an instance metadata endpoint and cached until shortly
/// before it expires.
pub struct MetadataTokenSource {
    client: reqwest::Client,
    url: String,
    header: (&'static str, &'static str),
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl MetadataTokenSource {
    pub fn new(url: impl Into<String>, header: (&'static str, &'static str)) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            header,
            cached: Mutex::new(None),
        }
    }

    /// GCE / GKE metadata server, default service account.
    pub fn gcp() -> Self {
        Self::new(GCP_METADATA_TOKEN_URL, ("Metadata-Flavor", "Google"))
    }

    /// Azure managed identity for the given resource audience.
    pub fn azure(resource: &str) -> Self {
        Self::new(
            format!(
                "{AZURE_METADATA_TOKEN_URL}&resource={}",
                urlencoding::encode(resource)
            ),
            ("Metadata", "true"),
        )
    }

    async fn fetch(&self) -> Result<CachedToken, ServiceError> {
        let resp = self
            .client
            .get(&self.url)
            .header(self.header.0, self.header.1)
            .send()
            .await
            .map_err(transport_err)?;
        if !resp.status().is_success() {
            return Err(ServiceError::unavailable(format!(
                "metadata token request returned {}",
                resp.status()
            )));
        }
        let body: TokenResponse = resp.json().await.map_err(transport_err)?;

        // Azure reports `expires_in` as a string, GCP as a number.
        let lifetime = match body.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .unwrap_or(300);
        debug!(lifetime, "fetched metadata token");

        Ok(CachedToken {
            value: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        })
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn token(&self) -> Result<String, ServiceError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + EXPIRY_MARGIN {
                return Ok(token.value.clone());
            }
        }
        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

/// `GOOGLE_OAUTH_ACCESS_TOKEN` when set, the metadata server otherwise.
pub fn google_token_source() -> Arc<dyn TokenSource> {
    match non_empty_env("GOOGLE_OAUTH_ACCESS_TOKEN") {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(MetadataTokenSource::gcp()),
    }
}

/// `AZURE_ACCESS_TOKEN` when set, managed identity otherwise.
pub fn azure_token_source(resource: &str) -> Arc<dyn TokenSource> {
    match non_empty_env("AZURE_ACCESS_TOKEN") {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(MetadataTokenSource::azure(resource)),
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
