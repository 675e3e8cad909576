use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use strongbox_core::{Service, ServiceError};
use tracing::{debug, instrument};

use crate::{
    auth::{google_token_source, TokenSource},
    http::{delete_response, encode_segment, storage_response, transport_err},
};

const GCS_BASE_URL: &str = "https://storage.googleapis.com";

/// Google Cloud Storage bucket accessed through the JSON API.
pub struct GcsService {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    prefix: String,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsService {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Result<Self, ServiceError> {
        let bucket = bucket.into();
        if bucket.trim().is_empty() {
            return Err(ServiceError::configuration(
                "Google Cloud Storage bucket should be specified",
            ));
        }
        let prefix = prefix.into();
        debug!(%bucket, %prefix, "initializing GCS store");
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: GCS_BASE_URL.to_string(),
            bucket,
            prefix,
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

    fn object_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            self.bucket,
            encode_segment(&self.object_name(key))
        )
    }
}

#[async_trait]
impl Service for GcsService {
    fn name(&self) -> &'static str {
        "gcs"
    }

    #[instrument(skip_all, fields(key = %key, bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let resp = self
            .client
            .get(self.object_url(key))
            .query(&[("alt", "media")])
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .map_err(transport_err)?;
        let resp = storage_response(resp, key).await?;
        Ok(resp.bytes().await.map_err(transport_err)?.to_vec())
    }

    #[instrument(skip_all, fields(key = %key, bucket = %self.bucket))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        let url = format!("{}/upload/storage/v1/b/{}/o", self.base_url, self.bucket);
        let resp = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", &self.object_name(key))])
            .bearer_auth(self.tokens.token().await?)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(value.to_vec())
            .send()
            .await
            .map_err(transport_err)?;
        storage_response(resp, key).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key, bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        let resp = self
            .client
            .delete(self.object_url(key))
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .map_err(transport_err)?;
        delete_response(resp).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let url = format!("{}/storage/v1/b/{}/o", self.base_url, self.bucket);
        let full_prefix = self.object_name(prefix);
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(&url)
                .query(&[("prefix", full_prefix.as_str())])
                .bearer_auth(self.tokens.token().await?);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let resp = request.send().await.map_err(transport_err)?;
            let page: ObjectList = storage_response(resp, prefix)
                .await?
                .json()
                .await
                .map_err(transport_err)?;

            keys.extend(
                page.items
                    .into_iter()
                    .filter_map(|item| item.name.strip_prefix(&self.prefix).map(str::to_string)),
            );
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_bytes, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::auth::StaticToken;

    async fn store(server: &MockServer) -> GcsService {
        GcsService::new("unseal-bucket", "strongbox-")
            .expect("store")
            .with_endpoint(server.uri())
            .with_token_source(Arc::new(StaticToken::new("ya29.test")))
    }

    #[tokio::test]
    async fn uploads_and_downloads_prefixed_objects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/unseal-bucket/o"))
            .and(query_param("uploadType", "media"))
            .and(query_param("name", "strongbox-vault-root"))
            .and(header("authorization", "Bearer ya29.test"))
            .and(body_bytes(b"ciphertext".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/unseal-bucket/o/strongbox-vault-root"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ciphertext".to_vec()))
            .mount(&server)
            .await;

        let store = store(&server).await;
        store.set("vault-root", b"ciphertext").await.expect("set");
        assert_eq!(store.get("vault-root").await.expect("get"), b"ciphertext");
    }

    #[tokio::test]
    async fn missing_object_is_not_found_and_outage_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/unseal-bucket/o/strongbox-absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/unseal-bucket/o/strongbox-flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = store(&server).await;
        assert!(store.get("absent").await.expect_err("absent").is_not_found());
        assert!(matches!(
            store.get("flaky").await.expect_err("flaky"),
            ServiceError::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn delete_of_missing_object_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/b/unseal-bucket/o/strongbox-vault-unseal-0"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        store(&server)
            .await
            .delete("vault-unseal-0")
            .await
            .expect("delete");
    }

    #[tokio::test]
    async fn list_follows_pages_and_strips_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/unseal-bucket/o"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "strongbox-vault-unseal-0" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/unseal-bucket/o"))
            .and(query_param("prefix", "strongbox-vault-unseal-"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "strongbox-vault-unseal-1" }],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;

        let keys = store(&server)
            .await
            .list("vault-unseal-")
            .await
            .expect("list");
        assert_eq!(keys, vec!["vault-unseal-0", "vault-unseal-1"]);
    }

    #[test]
    fn empty_bucket_is_rejected() {
        assert!(matches!(
            GcsService::new(" ", "p").err(),
            Some(ServiceError::Configuration { .. })
        ));
    }
}
