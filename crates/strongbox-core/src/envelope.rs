use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::service::{Service, ServiceError};

/// Failures reported by a key-management provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyManagementError {
    /// The provider answered and refused (invalid key state, revoked access,
    /// tampered or foreign ciphertext).
    #[error("{reason}")]
    Rejected { reason: String },
    /// The provider could not be reached.
    #[error("{reason}")]
    Unreachable { reason: String },
}

impl KeyManagementError {
    pub fn rejected(reason: impl ToString) -> Self {
        KeyManagementError::Rejected {
            reason: reason.to_string(),
        }
    }

    pub fn unreachable(reason: impl ToString) -> Self {
        KeyManagementError::Unreachable {
            reason: reason.to_string(),
        }
    }
}

/// External encrypt/decrypt boundary (cloud KMS, HSM, local key).
///
/// `key` is the storage key the payload belongs to; providers bind it to the
/// ciphertext as authenticated context where the provider supports that.
#[async_trait]
pub trait KeyManagement: Send + Sync {
    fn name(&self) -> &'static str;

    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyManagementError>;

    async fn decrypt(&self, key: &str, ciphertext: &[u8])
        -> Result<Vec<u8>, KeyManagementError>;
}

#[async_trait]
impl<T> KeyManagement for Arc<T>
where
    T: KeyManagement + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        (**self).encrypt(key, plaintext).await
    }

    async fn decrypt(
        &self,
        key: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeyManagementError> {
        (**self).decrypt(key, ciphertext).await
    }
}

/// Format byte put in front of every value before it is encrypted. Providers
/// therefore never receive an empty plaintext, which several cloud KMS APIs
/// refuse.
const FRAME_V1: u8 = 1;

/// Envelope-encryption layer: ciphertext produced by `K` is persisted in `S`.
///
/// Plaintext never reaches the inner store and no key material is kept here.
/// `set` is ciphertext-or-nothing: when the provider refuses, the inner store
/// is not touched.
pub struct EnvelopeService<K, S> {
    kms: K,
    inner: S,
}

impl<K: KeyManagement, S: Service> EnvelopeService<K, S> {
    pub fn new(kms: K, inner: S) -> Self {
        debug!(kms = kms.name(), store = inner.name(), "composing envelope store");
        Self { kms, inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<K: KeyManagement, S: Service> Service for EnvelopeService<K, S> {
    fn name(&self) -> &'static str {
        self.kms.name()
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let ciphertext = self.inner.get(key).await?;
        let framed = self
            .kms
            .decrypt(key, &ciphertext)
            .await
            .map_err(|err| match err {
                KeyManagementError::Rejected { reason } => {
                    ServiceError::DecryptionFailed { reason }
                }
                KeyManagementError::Unreachable { reason } => ServiceError::Unavailable { reason },
            })?;
        match framed.split_first() {
            Some((&FRAME_V1, value)) => Ok(value.to_vec()),
            _ => Err(ServiceError::DecryptionFailed {
                reason: "unrecognized envelope payload format".to_string(),
            }),
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        let mut framed = Vec::with_capacity(value.len() + 1);
        framed.push(FRAME_V1);
        framed.extend_from_slice(value);

        let ciphertext = self
            .kms
            .encrypt(key, &framed)
            .await
            .map_err(|err| match err {
                KeyManagementError::Rejected { reason } => {
                    ServiceError::EncryptionFailed { reason }
                }
                KeyManagementError::Unreachable { reason } => ServiceError::Unavailable { reason },
            })?;
        self.inner.set(key, &ciphertext).await
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        self.inner.list(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::memory::MemoryService;

    const TAG: &[u8] = b"sealed:";

    /// Reversible stand-in for a KMS: tags and masks the payload with the key name.
    #[derive(Default)]
    struct TaggingKms {
        refuse: AtomicBool,
        offline: AtomicBool,
    }

    fn mask(key: &str, data: &[u8]) -> Vec<u8> {
        let pad = key.as_bytes();
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ pad[i % pad.len()] ^ 0x5A)
            .collect()
    }

    #[async_trait]
    impl KeyManagement for TaggingKms {
        fn name(&self) -> &'static str {
            "tagging"
        }

        async fn encrypt(
            &self,
            key: &str,
            plaintext: &[u8],
        ) -> Result<Vec<u8>, KeyManagementError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(KeyManagementError::unreachable("connection refused"));
            }
            if self.refuse.load(Ordering::SeqCst) {
                return Err(KeyManagementError::rejected("key disabled"));
            }
            if plaintext.is_empty() {
                return Err(KeyManagementError::rejected("plaintext must not be empty"));
            }
            let mut out = TAG.to_vec();
            out.extend(mask(key, plaintext));
            Ok(out)
        }

        async fn decrypt(
            &self,
            key: &str,
            ciphertext: &[u8],
        ) -> Result<Vec<u8>, KeyManagementError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(KeyManagementError::unreachable("connection refused"));
            }
            let body = ciphertext
                .strip_prefix(TAG)
                .ok_or_else(|| KeyManagementError::rejected("not a sealed payload"))?;
            Ok(mask(key, body))
        }
    }

    #[tokio::test]
    async fn round_trip_never_stores_plaintext() {
        let inner = MemoryService::new();
        let store = EnvelopeService::new(TaggingKms::default(), inner.clone());

        store.set("vault-root", b"s.root-token").await.expect("set");
        assert_eq!(store.get("vault-root").await.expect("get"), b"s.root-token");

        let raw = inner.raw("vault-root").expect("raw entry");
        assert_ne!(raw, b"s.root-token".to_vec());
        assert!(raw.starts_with(TAG));
    }

    #[tokio::test]
    async fn empty_and_binary_values_round_trip() {
        let store = EnvelopeService::new(TaggingKms::default(), MemoryService::new());
        let binary: Vec<u8> = vec![0, 255, 128, 0, 0xC3, 0x28, 0xFE, 0xFF];

        store.set("vault-unseal-0", b"").await.expect("set empty");
        store.set("vault-unseal-1", &binary).await.expect("set binary");

        assert!(store.get("vault-unseal-0").await.expect("get empty").is_empty());
        assert_eq!(store.get("vault-unseal-1").await.expect("get binary"), binary);
    }

    #[tokio::test]
    async fn ciphertext_without_format_byte_is_rejected() {
        let inner = MemoryService::new();
        let kms = TaggingKms::default();
        // Sealed directly by the provider, so the payload lacks the format byte.
        let sealed = kms.encrypt("k", &[9, 9]).await.expect("encrypt");
        inner.set("k", &sealed).await.expect("seed");

        let store = EnvelopeService::new(kms, inner);
        let err = store.get("k").await.expect_err("must fail");
        assert!(matches!(err, ServiceError::DecryptionFailed { .. }));
    }

    #[tokio::test]
    async fn refused_encryption_writes_nothing() {
        let inner = MemoryService::new();
        let kms = TaggingKms::default();
        kms.refuse.store(true, Ordering::SeqCst);
        let store = EnvelopeService::new(kms, inner.clone());

        let err = store.set("k", b"v").await.expect_err("must fail");
        assert!(matches!(err, ServiceError::EncryptionFailed { .. }));
        assert!(inner.raw("k").is_none());
    }

    #[tokio::test]
    async fn unreadable_ciphertext_is_not_confused_with_absence() {
        let inner = MemoryService::with_entries([("k", b"garbage".to_vec())]);
        let store = EnvelopeService::new(TaggingKms::default(), inner);

        let err = store.get("k").await.expect_err("must fail");
        assert!(matches!(err, ServiceError::DecryptionFailed { .. }));

        let err = store.get("missing").await.expect_err("must fail");
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unreachable_provider_is_unavailable() {
        let kms = TaggingKms::default();
        kms.offline.store(true, Ordering::SeqCst);
        let store = EnvelopeService::new(kms, MemoryService::new());

        let err = store.set("k", b"v").await.expect_err("must fail");
        assert!(matches!(err, ServiceError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn delete_and_list_pass_through() {
        let store = EnvelopeService::new(TaggingKms::default(), MemoryService::new());
        store.set("vault-unseal-0", b"a").await.expect("set");
        assert_eq!(
            store.list("vault-").await.expect("list"),
            vec!["vault-unseal-0".to_string()]
        );
        store.delete("vault-unseal-0").await.expect("delete");
        store.delete("vault-unseal-0").await.expect("delete again");
        assert!(store.list("").await.expect("list").is_empty());
    }
}
