use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use strongbox_core::{KeyManagement, KeyManagementError, ServiceError};
use tracing::{debug, instrument};

use crate::{
    auth::{google_token_source, TokenSource},
    http::{kms_response, kms_transport_err},
};

const CLOUD_KMS_URL: &str = "https://cloudkms.googleapis.com";

/// Google Cloud KMS symmetric crypto key.
pub struct GoogleCloudKms {
    client: reqwest::Client,
    base_url: String,
    key_name: String,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EncryptRequest {
    plaintext: String,
    additional_authenticated_data: String,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest {
    ciphertext: String,
    additional_authenticated_data: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    #[serde(default)]
    plaintext: String,
}

impl GoogleCloudKms {
    pub fn new(
        project: &str,
        location: &str,
        key_ring: &str,
        crypto_key: &str,
    ) -> Result<Self, ServiceError> {
        let parts = [project, location, key_ring, crypto_key];
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(ServiceError::configuration(
                "Google Cloud KMS project, location, key ring and crypto key must all be set",
            ));
        }
        let key_name = format!(
            "projects/{project}/locations/{location}/keyRings/{key_ring}/cryptoKeys/{crypto_key}"
        );
        debug!(key = %key_name, "initializing Google Cloud KMS provider");
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: CLOUD_KMS_URL.to_string(),
            key_name,
            tokens: google_token_source(),
        })
    }

    pub fn with_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/v1/{}:{action}", self.base_url, self.key_name)
    }

    async fn bearer(&self) -> Result<String, KeyManagementError> {
        self.tokens
            .token()
            .await
            .map_err(|e| KeyManagementError::unreachable(e.to_string()))
    }
}

fn decode_field(field: &str, value: &str) -> Result<Vec<u8>, KeyManagementError> {
    STANDARD
        .decode(value)
        .map_err(|e| KeyManagementError::rejected(format!("{field} is not base64: {e}")))
}

#[async_trait]
impl KeyManagement for GoogleCloudKms {
    fn name(&self) -> &'static str {
        "gcp-kms"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let request = EncryptRequest {
            plaintext: STANDARD.encode(plaintext),
            additional_authenticated_data: STANDARD.encode(key),
        };
        let resp = self
            .client
            .post(self.action_url("encrypt"))
            .bearer_auth(self.bearer().await?)
            .json(&request)
            .send()
            .await
            .map_err(kms_transport_err)?;
        let body: EncryptResponse = kms_response(resp)
            .await?
            .json()
            .await
            .map_err(kms_transport_err)?;
        decode_field("ciphertext", &body.ciphertext)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn decrypt(&self, key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let request = DecryptRequest {
            ciphertext: STANDARD.encode(ciphertext),
            additional_authenticated_data: STANDARD.encode(key),
        };
        let resp = self
            .client
            .post(self.action_url("decrypt"))
            .bearer_auth(self.bearer().await?)
            .json(&request)
            .send()
            .await
            .map_err(kms_transport_err)?;
        let body: DecryptResponse = kms_response(resp)
            .await?
            .json()
            .await
            .map_err(kms_transport_err)?;
        // Empty plaintexts come back with the field omitted.
        decode_field("plaintext", &body.plaintext)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::auth::StaticToken;

    const KEY_PATH: &str =
        "/v1/projects/ops/locations/global/keyRings/unseal/cryptoKeys/vault";

    fn kms(server: &MockServer) -> GoogleCloudKms {
        GoogleCloudKms::new("ops", "global", "unseal", "vault")
            .expect("kms")
            .with_endpoint(server.uri())
            .with_token_source(Arc::new(StaticToken::new("ya29.kms")))
    }

    #[tokio::test]
    async fn encrypt_sends_key_as_authenticated_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{KEY_PATH}:encrypt")))
            .and(header("authorization", "Bearer ya29.kms"))
            .and(body_json(json!({
                "plaintext": STANDARD.encode("s.root"),
                "additionalAuthenticatedData": STANDARD.encode("vault-root")
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/ops/locations/global/keyRings/unseal/cryptoKeys/vault/cryptoKeyVersions/1",
                "ciphertext": STANDARD.encode("CiQA")
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sealed = kms(&server).encrypt("vault-root", b"s.root").await.expect("encrypt");
        assert_eq!(sealed, b"CiQA");
    }

    #[tokio::test]
    async fn decrypt_returns_plaintext() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{KEY_PATH}:decrypt")))
            .and(body_json(json!({
                "ciphertext": STANDARD.encode("CiQA"),
                "additionalAuthenticatedData": STANDARD.encode("vault-root")
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "plaintext": STANDARD.encode("s.root")
            })))
            .mount(&server)
            .await;

        let plain = kms(&server).decrypt("vault-root", b"CiQA").await.expect("decrypt");
        assert_eq!(plain, b"s.root");
    }

    #[tokio::test]
    async fn refusals_and_outages_are_distinguished() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{KEY_PATH}:decrypt")))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": 400, "message": "Decryption failed" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{KEY_PATH}:encrypt")))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let kms = kms(&server);
        assert!(matches!(
            kms.decrypt("k", b"x").await,
            Err(KeyManagementError::Rejected { .. })
        ));
        assert!(matches!(
            kms.encrypt("k", b"x").await,
            Err(KeyManagementError::Unreachable { .. })
        ));
    }

    #[test]
    fn incomplete_key_path_is_rejected() {
        assert!(GoogleCloudKms::new("ops", "", "unseal", "vault").is_err());
    }
}
