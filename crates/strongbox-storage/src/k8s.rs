use std::{collections::BTreeMap, path::Path, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use strongbox_core::{Service, ServiceError};
use tracing::{debug, instrument};

use crate::{
    auth::{TokenFile, TokenSource},
    http::{delete_response, encode_segment, storage_response, transport_err},
};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const MERGE_PATCH: &str = "application/merge-patch+json";

/// One Kubernetes `Secret`; each stored key is an entry of its `data` map.
pub struct K8sSecretService {
    client: reqwest::Client,
    api_url: String,
    namespace: String,
    secret: String,
    labels: BTreeMap<String, String>,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Debug, Default, Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl K8sSecretService {
    /// Talk to the API server of the cluster this process runs in, using the
    /// mounted service-account token and CA bundle.
    pub fn in_cluster(
        namespace: impl Into<String>,
        secret: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> Result<Self, ServiceError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            ServiceError::configuration("KUBERNETES_SERVICE_HOST is not set; not running in a cluster")
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let sa_dir = Path::new(SERVICE_ACCOUNT_DIR);
        let ca_path = sa_dir.join("ca.crt");
        let ca = std::fs::read(&ca_path).map_err(|e| {
            ServiceError::configuration(format!("reading {}: {e}", ca_path.display()))
        })?;
        let ca = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| ServiceError::configuration(format!("invalid cluster CA: {e}")))?;
        let client = reqwest::Client::builder()
            .add_root_certificate(ca)
            .build()
            .map_err(|e| ServiceError::configuration(format!("building HTTP client: {e}")))?;

        Self::new(
            client,
            format!("https://{host}:{port}"),
            Arc::new(TokenFile::new(sa_dir.join("token"))),
            namespace,
            secret,
            labels,
        )
    }

    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        namespace: impl Into<String>,
        secret: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> Result<Self, ServiceError> {
        let namespace = namespace.into();
        let secret = secret.into();
        if namespace.trim().is_empty() || secret.trim().is_empty() {
            return Err(ServiceError::configuration(
                "Kubernetes secret namespace and name must not be empty",
            ));
        }
        debug!(%namespace, %secret, "initializing Kubernetes secret store");
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            namespace,
            secret,
            labels,
            tokens,
        })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/secrets",
            self.api_url,
            encode_segment(&self.namespace)
        )
    }

    fn secret_url(&self) -> String {
        format!("{}/{}", self.collection_url(), encode_segment(&self.secret))
    }

    /// The whole secret, or `None` if it has not been created yet.
    async fn fetch(&self) -> Result<Option<SecretObject>, ServiceError> {
        let resp = self
            .client
            .get(self.secret_url())
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .map_err(transport_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let object = storage_response(resp, &self.secret)
            .await?
            .json()
            .await
            .map_err(transport_err)?;
        Ok(Some(object))
    }

    async fn patch(&self, data: Value) -> Result<reqwest::Response, ServiceError> {
        self.client
            .patch(self.secret_url())
            .bearer_auth(self.tokens.token().await?)
            .header(header::CONTENT_TYPE, MERGE_PATCH)
            .body(json!({ "data": data }).to_string())
            .send()
            .await
            .map_err(transport_err)
    }

    async fn create(&self, data: Value) -> Result<reqwest::Response, ServiceError> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "Opaque",
            "metadata": {
                "name": self.secret,
                "namespace": self.namespace,
                "labels": self.labels,
            },
            "data": data,
        });
        self.client
            .post(self.collection_url())
            .bearer_auth(self.tokens.token().await?)
            .json(&body)
            .send()
            .await
            .map_err(transport_err)
    }
}

#[async_trait]
impl Service for K8sSecretService {
    fn name(&self) -> &'static str {
        "k8s"
    }

    #[instrument(skip_all, fields(key = %key, secret = %self.secret))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let object = self
            .fetch()
            .await?
            .ok_or_else(|| ServiceError::not_found(key))?;
        let encoded = object
            .data
            .get(key)
            .ok_or_else(|| ServiceError::not_found(key))?;
        STANDARD
            .decode(encoded)
            .map_err(|e| ServiceError::corrupt(key, format!("secret entry is not base64: {e}")))
    }

    #[instrument(skip_all, fields(key = %key, secret = %self.secret))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        let data = json!({ key: STANDARD.encode(value) });

        let resp = self.patch(data.clone()).await?;
        if resp.status() != StatusCode::NOT_FOUND {
            storage_response(resp, key).await?;
            return Ok(());
        }

        debug!(namespace = %self.namespace, "secret does not exist yet, creating it");
        let resp = self.create(data.clone()).await?;
        if resp.status() == StatusCode::CONFLICT {
            // Created concurrently by someone else; merge into theirs.
            let resp = self.patch(data).await?;
            storage_response(resp, key).await?;
            return Ok(());
        }
        storage_response(resp, key).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key, secret = %self.secret))]
    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        // A null value removes the entry under merge-patch semantics.
        let resp = self.patch(json!({ key: Value::Null })).await?;
        delete_response(resp).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let object = self.fetch().await?.unwrap_or_default();
        Ok(object
            .data
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::auth::StaticToken;

    const SECRET_PATH: &str = "/api/v1/namespaces/default/secrets/strongbox";

    fn store(server: &MockServer) -> K8sSecretService {
        K8sSecretService::new(
            reqwest::Client::new(),
            server.uri(),
            Arc::new(StaticToken::new("sa-token")),
            "default",
            "strongbox",
            BTreeMap::from([("app.kubernetes.io/managed-by".to_string(), "strongbox".to_string())]),
        )
        .expect("store")
    }

    #[tokio::test]
    async fn reads_base64_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SECRET_PATH))
            .and(header("authorization", "Bearer sa-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": { "name": "strongbox" },
                "data": { "vault-root": STANDARD.encode("s.root") }
            })))
            .mount(&server)
            .await;

        let store = store(&server);
        assert_eq!(store.get("vault-root").await.expect("get"), b"s.root");
        assert!(store.get("vault-unseal-0").await.expect_err("absent").is_not_found());
    }

    #[tokio::test]
    async fn undecodable_entry_is_corrupt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SECRET_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": { "name": "strongbox" },
                "data": { "vault-root": "!!not base64!!" }
            })))
            .mount(&server)
            .await;

        let err = store(&server).get("vault-root").await.expect_err("corrupt");
        assert!(matches!(err, ServiceError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn missing_secret_means_missing_key_and_empty_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SECRET_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store(&server);
        assert!(store.get("vault-root").await.expect_err("absent").is_not_found());
        assert!(store.list("").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn first_write_creates_the_secret_with_labels() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(SECRET_PATH))
            .and(header("content-type", MERGE_PATCH))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/secrets"))
            .and(body_json(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "type": "Opaque",
                "metadata": {
                    "name": "strongbox",
                    "namespace": "default",
                    "labels": { "app.kubernetes.io/managed-by": "strongbox" }
                },
                "data": { "vault-unseal-0": STANDARD.encode("share") }
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .set("vault-unseal-0", b"share")
            .await
            .expect("set");
    }

    #[tokio::test]
    async fn delete_patches_the_entry_to_null() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(SECRET_PATH))
            .and(body_json(json!({ "data": { "vault-root": null } })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).delete("vault-root").await.expect("delete");
    }

    #[tokio::test]
    async fn list_filters_entries_by_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SECRET_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "vault-root": "eA==",
                    "vault-unseal-1": "eA==",
                    "vault-unseal-0": "eA=="
                }
            })))
            .mount(&server)
            .await;

        assert_eq!(
            store(&server).list("vault-unseal-").await.expect("list"),
            vec!["vault-unseal-0", "vault-unseal-1"]
        );
    }

    #[test]
    fn empty_secret_name_is_rejected() {
        let err = K8sSecretService::new(
            reqwest::Client::new(),
            "http://localhost",
            Arc::new(StaticToken::new("t")),
            "default",
            "",
            BTreeMap::new(),
        )
        .err();
        assert!(matches!(err, Some(ServiceError::Configuration { .. })));
    }
}
