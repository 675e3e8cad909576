use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_kms::{
    config::http::HttpResponse,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::Blob,
    Client,
};
use strongbox_core::{KeyManagement, KeyManagementError, ServiceError};
use tracing::{debug, instrument};

use super::CONTEXT_KEY;

/// AWS KMS symmetric key in one region.
#[derive(Debug, Clone)]
pub struct AwsKms {
    client: Client,
    region: String,
    key_id: String,
}

impl AwsKms {
    pub async fn new(region: impl Into<String>, key_id: impl Into<String>) -> Result<Self, ServiceError> {
        let region = region.into();
        let key_id = key_id.into();
        if region.trim().is_empty() || key_id.trim().is_empty() {
            return Err(ServiceError::configuration(
                "AWS KMS region and key id must not be empty",
            ));
        }
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .load()
            .await;
        Ok(Self::from_client(Client::new(&sdk_config), region, key_id))
    }

    pub fn from_client(client: Client, region: impl Into<String>, key_id: impl Into<String>) -> Self {
        let (region, key_id) = (region.into(), key_id.into());
        debug!(%region, %key_id, "initializing AWS KMS provider");
        Self {
            client,
            region,
            key_id,
        }
    }
}

/// KMS error codes for conditions that clear without operator action.
const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "LimitExceededException",
    "KMSInternalException",
    "DependencyTimeoutException",
    "KeyUnavailableException",
];

fn is_transient(code: Option<&str>, status: u16) -> bool {
    status >= 500
        || status == 429
        || status == 408
        || code.is_some_and(|code| TRANSIENT_CODES.contains(&code))
}

/// A service answer is a refusal unless it reports throttling or an internal
/// fault; a call that never got an answer is unreachable.
fn sdk_err<E>(err: SdkError<E, HttpResponse>) -> KeyManagementError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let reason = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ServiceError(context)
            if !is_transient(context.err().code(), context.raw().status().as_u16()) =>
        {
            KeyManagementError::rejected(reason)
        }
        _ => KeyManagementError::unreachable(reason),
    }
}

#[async_trait]
impl KeyManagement for AwsKms {
    fn name(&self) -> &'static str {
        "aws-kms"
    }

    #[instrument(skip_all, fields(key = %key, region = %self.region))]
    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let output = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(Blob::new(plaintext))
            .encryption_context(CONTEXT_KEY, key)
            .send()
            .await
            .map_err(sdk_err)?;
        output
            .ciphertext_blob
            .map(Blob::into_inner)
            .ok_or_else(|| KeyManagementError::rejected("AWS KMS returned no ciphertext"))
    }

    #[instrument(skip_all, fields(key = %key, region = %self.region))]
    async fn decrypt(&self, key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let output = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(Blob::new(ciphertext))
            .encryption_context(CONTEXT_KEY, key)
            .send()
            .await
            .map_err(sdk_err)?;
        output
            .plaintext
            .map(Blob::into_inner)
            .ok_or_else(|| KeyManagementError::rejected("AWS KMS returned no plaintext"))
    }
}
