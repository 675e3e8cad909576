use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use strongbox_core::{Service, ServiceError};
use tracing::{debug, instrument, warn};

use crate::{
    auth::{azure_token_source, TokenSource},
    http::{delete_response, storage_response, transport_err},
};

const API_VERSION: &str = "7.4";
const VAULT_RESOURCE: &str = "https://vault.azure.net";
/// Soft-delete, purge and recovery complete asynchronously; conflicting calls
/// are retried this many times.
const CONFLICT_ATTEMPTS: u32 = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(200);

/// Azure Key Vault secrets. The vault encrypts at rest, so values are stored
/// directly (base64-encoded, as secret values are text).
///
/// Vaults keep deleted secrets recoverable, and a recoverable name cannot be
/// written. `delete` therefore purges after deleting, and `set` recovers a
/// soft-deleted name it could not purge before writing the new version.
pub struct AzureKeyVaultService {
    client: reqwest::Client,
    vault_url: String,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Debug, Deserialize)]
struct SecretBundle {
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretList {
    #[serde(default)]
    value: Vec<SecretItem>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretItem {
    id: String,
}

impl AzureKeyVaultService {
    pub fn new(vault_name: &str) -> Result<Self, ServiceError> {
        let vault_name = vault_name.trim();
        if vault_name.is_empty() {
            return Err(ServiceError::configuration(
                "Azure Key Vault name should be specified",
            ));
        }
        debug!(vault = vault_name, "initializing Azure Key Vault store");
        Ok(Self {
            client: reqwest::Client::new(),
            vault_url: format!("https://{vault_name}.vault.azure.net"),
            tokens: azure_token_source(VAULT_RESOURCE),
        })
    }

    pub fn with_endpoint(mut self, vault_url: impl Into<String>) -> Self {
        self.vault_url = vault_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    fn secret_url(&self, key: &str) -> String {
        format!("{}/secrets/{}", self.vault_url, secret_name(key))
    }

    fn deleted_url(&self, key: &str) -> String {
        format!("{}/deletedsecrets/{}", self.vault_url, secret_name(key))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<reqwest::Response, ServiceError> {
        self.client
            .put(self.secret_url(key))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(self.tokens.token().await?)
            .json(&json!({ "value": STANDARD.encode(value) }))
            .send()
            .await
            .map_err(transport_err)
    }

    /// Permanently remove a soft-deleted secret. Vaults with purge protection
    /// refuse with 403; the name then stays recoverable and `set` recovers it.
    async fn purge(&self, key: &str) -> Result<(), ServiceError> {
        for attempt in 1..=CONFLICT_ATTEMPTS {
            let resp = self
                .client
                .delete(self.deleted_url(key))
                .query(&[("api-version", API_VERSION)])
                .bearer_auth(self.tokens.token().await?)
                .send()
                .await
                .map_err(transport_err)?;
            match resp.status() {
                StatusCode::CONFLICT => {
                    debug!(attempt, "deletion still in progress");
                    tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
                }
                StatusCode::FORBIDDEN => {
                    warn!(secret = %secret_name(key), "purge refused; secret stays recoverable");
                    return Ok(());
                }
                _ => return delete_response(resp).await,
            }
        }
        Err(ServiceError::unavailable(format!(
            "secret {} is still being deleted",
            secret_name(key)
        )))
    }

    async fn recover(&self, key: &str) -> Result<(), ServiceError> {
        let resp = self
            .client
            .post(format!("{}/recover", self.deleted_url(key)))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .map_err(transport_err)?;
        match resp.status() {
            // Not deleted (the conflict had another cause) or already recovering.
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(()),
            _ => storage_response(resp, key).await.map(|_| ()),
        }
    }
}

/// Secret names may only hold ASCII letters, digits and dashes.
fn secret_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

#[async_trait]
impl Service for AzureKeyVaultService {
    fn name(&self) -> &'static str {
        "azure-kv"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let resp = self
            .client
            .get(self.secret_url(key))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .map_err(transport_err)?;
        let bundle: SecretBundle = storage_response(resp, key)
            .await?
            .json()
            .await
            .map_err(transport_err)?;
        STANDARD
            .decode(bundle.value)
            .map_err(|e| ServiceError::corrupt(key, format!("secret value is not base64: {e}")))
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        for attempt in 1..=CONFLICT_ATTEMPTS {
            let resp = self.put(key, value).await?;
            if resp.status() != StatusCode::CONFLICT {
                storage_response(resp, key).await?;
                return Ok(());
            }
            if attempt == 1 {
                debug!("name is held by a deleted secret; recovering it");
                self.recover(key).await?;
            }
            tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
        }
        Err(ServiceError::unavailable(format!(
            "secret {} is still held by a deleted secret",
            secret_name(key)
        )))
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        let resp = self
            .client
            .delete(self.secret_url(key))
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .map_err(transport_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            // Nothing live; an earlier delete may have left it soft-deleted.
            return self.purge(key).await;
        }
        delete_response(resp).await?;
        self.purge(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let mut keys = Vec::new();
        let mut next = Some(format!(
            "{}/secrets?api-version={API_VERSION}",
            self.vault_url
        ));

        while let Some(url) = next.take() {
            let resp = self
                .client
                .get(url)
                .bearer_auth(self.tokens.token().await?)
                .send()
                .await
                .map_err(transport_err)?;
            let page: SecretList = storage_response(resp, prefix)
                .await?
                .json()
                .await
                .map_err(transport_err)?;

            keys.extend(
                page.value
                    .iter()
                    .filter_map(|item| item.id.rsplit('/').next())
                    .filter(|name| name.starts_with(prefix))
                    .map(str::to_string),
            );
            next = page.next_link.filter(|link| !link.is_empty());
        }

        keys.sort();
        Ok(keys)
    }
}
