use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    Client,
};
use strongbox_core::{Service, ServiceError};
use tracing::{debug, instrument};

/// Amazon S3 bucket in one region.
#[derive(Debug, Clone)]
pub struct S3Service {
    client: Client,
    region: String,
    bucket: String,
    prefix: String,
}

impl S3Service {
    /// Build a client from the default credential chain pinned to `region`.
    pub async fn new(
        region: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let region = region.into();
        let bucket = bucket.into();
        if region.trim().is_empty() || bucket.trim().is_empty() {
            return Err(ServiceError::configuration(
                "AWS S3 region and bucket must not be empty",
            ));
        }
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .load()
            .await;
        Ok(Self::from_client(Client::new(&sdk_config), region, bucket, prefix))
    }

    pub fn from_client(
        client: Client,
        region: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        let (region, bucket, prefix) = (region.into(), bucket.into(), prefix.into());
        debug!(%region, %bucket, %prefix, "initializing S3 store");
        Self {
            client,
            region,
            bucket,
            prefix,
        }
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn sdk_err<E, R>(err: SdkError<E, R>) -> ServiceError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    ServiceError::unavailable(DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl Service for S3Service {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip_all, fields(key = %key, region = %self.region, bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|err| {
                let missing = err
                    .as_service_error()
                    .is_some_and(|service_err| service_err.is_no_such_key());
                if missing {
                    ServiceError::not_found(key)
                } else {
                    sdk_err(err)
                }
            })?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ServiceError::unavailable(format!("reading S3 object body: {e}")))?;
        Ok(body.into_bytes().to_vec())
    }

    #[instrument(skip_all, fields(key = %key, region = %self.region, bucket = %self.bucket))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(ByteStream::from(value.to_vec()))
            .send()
            .await
            .map_err(sdk_err)?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key, region = %self.region, bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        // S3 reports success for keys that do not exist.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(sdk_err)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.object_key(prefix))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(sdk_err)?;

            keys.extend(page.contents().iter().filter_map(|object| {
                object
                    .key()
                    .and_then(|k| k.strip_prefix(self.prefix.as_str()))
                    .map(str::to_string)
            }));

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};

    use super::*;

    fn offline_client() -> Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("eu-west-1"))
            .credentials_provider(Credentials::new("AKID", "SECRET", None, None, "test"))
            .build();
        Client::from_conf(config)
    }

    #[test]
    fn object_keys_carry_the_prefix() {
        let store = S3Service::from_client(offline_client(), "eu-west-1", "bucket", "vault/");
        assert_eq!(store.object_key("vault-root"), "vault/vault-root");
        assert_eq!(store.name(), "s3");
    }

    #[tokio::test]
    async fn empty_bucket_is_rejected_before_loading_credentials() {
        let err = S3Service::new("eu-west-1", "", "")
            .await
            .expect_err("must fail");
        assert!(matches!(err, ServiceError::Configuration { .. }));
    }
}
