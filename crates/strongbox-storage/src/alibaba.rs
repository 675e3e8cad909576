//! Alibaba Cloud credentials and request signing (OSS header signatures and
//! the RPC-style signature used by KMS).

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use strongbox_core::ServiceError;

type HmacSha1 = Hmac<Sha1>;

/// Access key pair shared by OSS and KMS.
#[derive(Clone, PartialEq, Eq)]
pub struct AlibabaCredentials {
    access_key_id: String,
    access_key_secret: String,
}

impl std::fmt::Debug for AlibabaCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlibabaCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .finish()
    }
}

impl AlibabaCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let access_key_id = access_key_id.into();
        let access_key_secret = access_key_secret.into();
        if access_key_id.trim().is_empty() || access_key_secret.trim().is_empty() {
            return Err(ServiceError::configuration(
                "Alibaba access key id or access key secret can't be empty",
            ));
        }
        Ok(Self {
            access_key_id,
            access_key_secret,
        })
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// `Authorization` header value for an OSS request.
    pub(crate) fn oss_authorization(
        &self,
        verb: &str,
        content_type: &str,
        date: &str,
        resource: &str,
    ) -> Result<String, String> {
        // No Content-MD5 and no x-oss-* headers are sent.
        let string_to_sign = format!("{verb}\n\n{content_type}\n{date}\n{resource}");
        let signature = hmac_sha1_base64(self.access_key_secret.as_bytes(), &string_to_sign)?;
        Ok(format!("OSS {}:{signature}", self.access_key_id))
    }

    /// Signature for an RPC-style request over the given (unsigned) parameters.
    pub(crate) fn rpc_signature(
        &self,
        method: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, String> {
        let string_to_sign = format!(
            "{method}&{}&{}",
            percent_encode("/"),
            percent_encode(&canonical_query(params))
        );
        let key = format!("{}&", self.access_key_secret);
        hmac_sha1_base64(key.as_bytes(), &string_to_sign)
    }
}

/// RFC 3986 encoding: everything but `A-Z a-z 0-9 - _ . ~` is escaped.
pub(crate) fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Sorted `k=v` pairs joined with `&`, both sides percent-encoded.
pub(crate) fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_sha1_base64(key: &[u8], message: &str) -> Result<String, String> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|e| format!("hmac key: {e}"))?;
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}
