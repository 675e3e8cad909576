use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Method, RequestBuilder};
use serde::Deserialize;
use strongbox_core::{Service, ServiceError};
use tracing::{debug, instrument};

use crate::{
    alibaba::AlibabaCredentials,
    http::{delete_response, encode_object_path, storage_response, transport_err},
};

const OCTET_STREAM: &str = "application/octet-stream";

/// One page of a `GetBucket` (ListObjects) response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ListBucketResult {
    is_truncated: bool,
    next_marker: String,
    contents: Vec<ObjectSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectSummary {
    key: String,
}

fn parse_listing(body: &str) -> Result<ListBucketResult, ServiceError> {
    quick_xml::de::from_str(body)
        .map_err(|e| ServiceError::unavailable(format!("malformed OSS listing: {e}")))
}

/// Alibaba Cloud Object Storage Service bucket.
pub struct OssService {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    prefix: String,
    credentials: AlibabaCredentials,
}

impl std::fmt::Debug for OssService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OssService")
            .field("base_url", &self.base_url)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl OssService {
    /// `endpoint` is the regional host, e.g. `oss-eu-central-1.aliyuncs.com`.
    pub fn new(
        endpoint: &str,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        credentials: AlibabaCredentials,
    ) -> Result<Self, ServiceError> {
        let bucket = bucket.into();
        if bucket.trim().is_empty() {
            return Err(ServiceError::configuration(
                "Alibaba OSS bucket should be specified",
            ));
        }
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(ServiceError::configuration(
                "Alibaba OSS endpoint should be specified",
            ));
        }
        let prefix = prefix.into();
        let host = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        debug!(%bucket, %prefix, endpoint = host, "initializing OSS store");
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: format!("https://{bucket}.{host}"),
            bucket,
            prefix,
            credentials,
        })
    }

    /// Point at a path-less base URL that already addresses the bucket.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn object_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Signed request for `object`; an empty object addresses the bucket itself.
    fn request(
        &self,
        method: Method,
        object: &str,
        content_type: &str,
    ) -> Result<RequestBuilder, ServiceError> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let resource = format!("/{}/{}", self.bucket, object);
        let authorization = self
            .credentials
            .oss_authorization(method.as_str(), content_type, &date, &resource)
            .map_err(ServiceError::configuration)?;

        let url = format!("{}/{}", self.base_url, encode_object_path(object));
        let mut request = self
            .client
            .request(method, url)
            .header(header::DATE, date)
            .header(header::AUTHORIZATION, authorization);
        if !content_type.is_empty() {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        Ok(request)
    }
}

#[async_trait]
impl Service for OssService {
    fn name(&self) -> &'static str {
        "oss"
    }

    #[instrument(skip_all, fields(key = %key, bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let resp = self
            .request(Method::GET, &self.object_name(key), "")?
            .send()
            .await
            .map_err(transport_err)?;
        let resp = storage_response(resp, key).await?;
        Ok(resp.bytes().await.map_err(transport_err)?.to_vec())
    }

    #[instrument(skip_all, fields(key = %key, bucket = %self.bucket))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        let resp = self
            .request(Method::PUT, &self.object_name(key), OCTET_STREAM)?
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
            .request(Method::DELETE, &self.object_name(key), "")?
            .send()
            .await
            .map_err(transport_err)?;
        delete_response(resp).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let full_prefix = self.object_name(prefix);
        let mut keys = Vec::new();
        let mut marker = String::new();

        loop {
            let resp = self
                .request(Method::GET, "", "")?
                .query(&[("prefix", full_prefix.as_str()), ("marker", marker.as_str())])
                .send()
                .await
                .map_err(transport_err)?;
            let body = storage_response(resp, prefix)
                .await?
                .text()
                .await
                .map_err(transport_err)?;

            let page = parse_listing(&body)?;
            keys.extend(
                page.contents
                    .iter()
                    .filter_map(|object| object.key.strip_prefix(&self.prefix))
                    .map(str::to_string),
            );

            if !page.is_truncated || page.next_marker.is_empty() {
                break;
            }
            marker = page.next_marker;
        }

        keys.sort();
        Ok(keys)
    }
}
