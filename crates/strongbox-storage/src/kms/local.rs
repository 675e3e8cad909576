use std::{
    fs,
    io::{ErrorKind, Write},
    path::Path,
};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use strongbox_core::{KeyManagement, KeyManagementError, ServiceError};
use tempfile::NamedTempFile;
use tracing::{debug, info};

const NONCE_LEN: usize = 12;

/// AES-256-GCM under a key held by this process. The storage key is bound
/// as associated data.
#[derive(Clone)]
pub struct LocalKeyManagement {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for LocalKeyManagement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalKeyManagement(<key redacted>)")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedBlob {
    nonce: String,
    ciphertext: String,
}

impl LocalKeyManagement {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Fresh random key, lost when the process exits.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    /// Load the base64 key at `path`, generating and saving one when the file
    /// does not exist.
    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(encoded) => {
                debug!(path = %path.display(), "loaded local encryption key");
                Ok(Self::new(decode_key(encoded.trim())?))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);
                write_key(path, &key)?;
                info!(path = %path.display(), "generated local encryption key");
                Ok(Self::new(key))
            }
            Err(err) => Err(ServiceError::configuration(format!(
                "reading key file {}: {err}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl KeyManagement for LocalKeyManagement {
    fn name(&self) -> &'static str {
        "local-aes-gcm"
    }

    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|e| KeyManagementError::rejected(format!("encrypt failed: {e}")))?;

        let blob = SealedBlob {
            nonce: URL_SAFE_NO_PAD.encode(nonce.as_slice()),
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        };
        serde_json::to_vec(&blob).map_err(KeyManagementError::rejected)
    }

    async fn decrypt(&self, key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let blob: SealedBlob = serde_json::from_slice(ciphertext)
            .map_err(|e| KeyManagementError::rejected(format!("not a sealed blob: {e}")))?;
        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(blob.nonce)
            .map_err(|e| KeyManagementError::rejected(format!("nonce decode failed: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(KeyManagementError::rejected(format!(
                "expected {NONCE_LEN}-byte nonce, got {}",
                nonce_bytes.len()
            )));
        }
        let sealed = URL_SAFE_NO_PAD
            .decode(blob.ciphertext)
            .map_err(|e| KeyManagementError::rejected(format!("ciphertext decode failed: {e}")))?;

        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &sealed,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|e| KeyManagementError::rejected(format!("decrypt failed: {e}")))
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], ServiceError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| ServiceError::configuration(format!("key file is not base64: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        ServiceError::configuration(format!("expected 32 key bytes, got {}", bytes.len()))
    })
}

fn write_key(path: &Path, key: &[u8; 32]) -> Result<(), ServiceError> {
    let config_err = |e: std::io::Error| {
        ServiceError::configuration(format!("writing key file {}: {e}", path.display()))
    };
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(config_err)?;

    // NamedTempFile is created 0600 on unix.
    let mut tmp = NamedTempFile::new_in(parent).map_err(config_err)?;
    tmp.write_all(STANDARD.encode(key).as_bytes())
        .map_err(config_err)?;
    tmp.as_file().sync_all().map_err(config_err)?;
    tmp.persist_noclobber(path).map_err(|e| config_err(e.error))?;
    Ok(())
}
