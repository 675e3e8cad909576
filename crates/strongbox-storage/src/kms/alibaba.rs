use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::Deserialize;
use strongbox_core::{KeyManagement, KeyManagementError, ServiceError};
use tracing::{debug, instrument};

use crate::{
    alibaba::{canonical_query, percent_encode, AlibabaCredentials},
    http::{kms_response, kms_transport_err},
    kms::CONTEXT_KEY,
};

const API_VERSION: &str = "2016-01-20";

/// Alibaba Cloud KMS key, called through the RPC-style API.
pub struct AlibabaKms {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    credentials: AlibabaCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EncryptResponse {
    ciphertext_blob: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DecryptResponse {
    plaintext: String,
}

impl AlibabaKms {
    pub fn new(
        region: &str,
        key_id: impl Into<String>,
        credentials: AlibabaCredentials,
    ) -> Result<Self, ServiceError> {
        let key_id = key_id.into();
        if region.trim().is_empty() || key_id.trim().is_empty() {
            return Err(ServiceError::configuration(
                "Alibaba KMS region and key id must not be empty",
            ));
        }
        debug!(%region, %key_id, "initializing Alibaba KMS provider");
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: format!("https://kms.{}.aliyuncs.com", region.trim()),
            key_id,
            credentials,
        })
    }

    pub fn with_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sign `params` plus the common parameters and return the request URL.
    fn signed_url(&self, mut params: BTreeMap<String, String>) -> Result<String, KeyManagementError> {
        let common = [
            ("Format", "JSON".to_string()),
            ("Version", API_VERSION.to_string()),
            ("AccessKeyId", self.credentials.access_key_id().to_string()),
            ("SignatureMethod", "HMAC-SHA1".to_string()),
            ("SignatureVersion", "1.0".to_string()),
            ("SignatureNonce", uuid::Uuid::new_v4().to_string()),
            (
                "Timestamp",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
        ];
        params.extend(common.into_iter().map(|(k, v)| (k.to_string(), v)));

        let signature = self
            .credentials
            .rpc_signature("GET", &params)
            .map_err(KeyManagementError::rejected)?;
        Ok(format!(
            "{}/?{}&Signature={}",
            self.base_url,
            canonical_query(&params),
            percent_encode(&signature)
        ))
    }

    fn action(action: &str, key: &str) -> BTreeMap<String, String> {
        let context = serde_json::json!({ CONTEXT_KEY: key }).to_string();
        BTreeMap::from([
            ("Action".to_string(), action.to_string()),
            ("EncryptionContext".to_string(), context),
        ])
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        params: BTreeMap<String, String>,
    ) -> Result<T, KeyManagementError> {
        let resp = self
            .client
            .get(self.signed_url(params)?)
            .send()
            .await
            .map_err(kms_transport_err)?;
        kms_response(resp)
            .await?
            .json()
            .await
            .map_err(kms_transport_err)
    }
}

#[async_trait]
impl KeyManagement for AlibabaKms {
    fn name(&self) -> &'static str {
        "alibaba-kms"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let mut params = Self::action("Encrypt", key);
        params.insert("KeyId".to_string(), self.key_id.clone());
        params.insert("Plaintext".to_string(), STANDARD.encode(plaintext));

        let body: EncryptResponse = self.call(params).await?;
        Ok(body.ciphertext_blob.into_bytes())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn decrypt(&self, key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let blob = std::str::from_utf8(ciphertext)
            .map_err(|_| KeyManagementError::rejected("ciphertext blob is not text"))?;
        let mut params = Self::action("Decrypt", key);
        params.insert("CiphertextBlob".to_string(), blob.to_string());

        let body: DecryptResponse = self.call(params).await?;
        STANDARD
            .decode(body.plaintext)
            .map_err(|e| KeyManagementError::rejected(format!("plaintext is not base64: {e}")))
    }
}
