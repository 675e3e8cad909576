use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use strongbox_core::{Service, ServiceError};
use tracing::{debug, info, instrument};

use crate::http::{delete_response, encode_object_path, storage_response, transport_err};

const TOKEN_HEADER: &str = "X-Vault-Token";

/// How to obtain a Vault token.
#[derive(Clone)]
pub enum VaultAuth {
    Token(String),
    /// Log in through the Kubernetes auth method with the pod's service-account JWT.
    Kubernetes {
        role: String,
        auth_path: String,
        jwt_path: PathBuf,
    },
}

impl std::fmt::Debug for VaultAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultAuth::Token(_) => f.write_str("Token(<redacted>)"),
            VaultAuth::Kubernetes {
                role,
                auth_path,
                jwt_path,
            } => f
                .debug_struct("Kubernetes")
                .field("role", role)
                .field("auth_path", auth_path)
                .field("jwt_path", jwt_path)
                .finish(),
        }
    }
}

/// Secrets kept in another Vault's KV v2 engine, one secret per key under
/// `path` (e.g. `secret/data/unseal`).
pub struct VaultKvService {
    client: reqwest::Client,
    address: String,
    path: String,
    token: String,
}

impl std::fmt::Debug for VaultKvService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKvService")
            .field("address", &self.address)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Debug, Deserialize)]
struct ReadData {
    data: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    keys: Vec<String>,
}

impl VaultKvService {
    /// Resolve credentials (logging in when needed) and return a ready store.
    pub async fn connect(
        address: &str,
        path: &str,
        auth: VaultAuth,
    ) -> Result<Self, ServiceError> {
        let address = address.trim().trim_end_matches('/').to_string();
        let path = path.trim().trim_matches('/').to_string();
        if address.is_empty() || path.is_empty() {
            return Err(ServiceError::configuration(
                "Vault address and unseal keys path must not be empty",
            ));
        }
        let client = reqwest::Client::new();

        let token = match auth {
            VaultAuth::Token(token) if token.trim().is_empty() => {
                return Err(ServiceError::configuration("Vault token must not be empty"));
            }
            VaultAuth::Token(token) => token,
            VaultAuth::Kubernetes {
                role,
                auth_path,
                jwt_path,
            } => kubernetes_login(&client, &address, &role, &auth_path, &jwt_path).await?,
        };

        debug!(%address, %path, "initializing Vault KV store");
        Ok(Self {
            client,
            address,
            path,
            token,
        })
    }

    fn secret_url(&self, key: &str) -> String {
        format!(
            "{}/v1/{}/{}",
            self.address,
            self.path,
            encode_object_path(key)
        )
    }

    /// KV v2 lists and destroys through `metadata/` where reads and writes
    /// use `data/`.
    fn metadata_url(&self) -> String {
        let mut segments: Vec<&str> = self.path.split('/').collect();
        if let Some(data) = segments.iter().skip(1).position(|s| *s == "data") {
            segments[data + 1] = "metadata";
        }
        format!("{}/v1/{}", self.address, segments.join("/"))
    }
}

async fn kubernetes_login(
    client: &reqwest::Client,
    address: &str,
    role: &str,
    auth_path: &str,
    jwt_path: &Path,
) -> Result<String, ServiceError> {
    if role.trim().is_empty() {
        return Err(ServiceError::configuration(
            "Vault role is required for Kubernetes auth",
        ));
    }
    let jwt = tokio::fs::read_to_string(jwt_path).await.map_err(|e| {
        ServiceError::configuration(format!(
            "reading service account token {}: {e}",
            jwt_path.display()
        ))
    })?;

    let url = format!(
        "{address}/v1/auth/{}/login",
        auth_path.trim_matches('/')
    );
    let resp = client
        .post(url)
        .json(&json!({ "role": role, "jwt": jwt.trim() }))
        .send()
        .await
        .map_err(transport_err)?;
    if !resp.status().is_success() {
        return Err(ServiceError::configuration(format!(
            "Vault Kubernetes login as role {role} failed with {}",
            resp.status()
        )));
    }
    let login: LoginResponse = resp.json().await.map_err(transport_err)?;
    info!(%role, "logged in to Vault");
    Ok(login.auth.client_token)
}

#[async_trait]
impl Service for VaultKvService {
    fn name(&self) -> &'static str {
        "vault"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let resp = self
            .client
            .get(self.secret_url(key))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(transport_err)?;
        let body: ReadResponse = storage_response(resp, key)
            .await?
            .json()
            .await
            .map_err(transport_err)?;

        // A soft-deleted latest version reads back with null data.
        let encoded = body
            .data
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(|value| value.as_str())
            .ok_or_else(|| ServiceError::not_found(key))?;
        STANDARD
            .decode(encoded)
            .map_err(|e| ServiceError::corrupt(key, format!("Vault entry is not base64: {e}")))
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        let resp = self
            .client
            .post(self.secret_url(key))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "data": { key: STANDARD.encode(value) } }))
            .send()
            .await
            .map_err(transport_err)?;
        storage_response(resp, key).await?;
        Ok(())
    }

    /// Removes every version and the metadata, so the key also leaves `list`.
    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        let url = format!("{}/{}", self.metadata_url(), encode_object_path(key));
        let resp = self
            .client
            .delete(url)
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(transport_err)?;
        delete_response(resp).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let resp = self
            .client
            .get(self.metadata_url())
            .query(&[("list", "true")])
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(transport_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: ListResponse = storage_response(resp, prefix)
            .await?
            .json()
            .await
            .map_err(transport_err)?;

        let mut keys: Vec<String> = body
            .data
            .keys
            .into_iter()
            .filter(|k| !k.ends_with('/') && k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
