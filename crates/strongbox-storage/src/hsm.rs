//! PKCS#11 hardware security module support.
//!
//! One logged-in read/write session is opened at construction and held until
//! the service is dropped. Every token call runs on the blocking pool with the
//! session mutex held, since PKCS#11 sessions are not reentrant.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as Pkcs11Error, RvError},
    mechanism::Mechanism,
    object::{Attribute, AttributeType, ObjectClass, ObjectHandle},
    session::{Session, UserType},
    types::{AuthPin, Ulong},
};
use sha2::{Digest, Sha256};
use strongbox_core::{EnvelopeService, KeyManagement, KeyManagementError, Service, ServiceError};
use tracing::{debug, info, instrument, warn};

const RSA_MODULUS_BITS: u64 = 2048;
const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];
/// `CKA_APPLICATION` of the data objects this service owns.
const APPLICATION: &[u8] = b"strongbox";
/// Leading bytes of every RSA plaintext: a SHA-256 prefix of the storage key.
/// PKCS#1 v1.5 carries no associated data, so the binding travels inside.
const KEY_BINDING_LEN: usize = 16;

fn key_binding(key: &str) -> [u8; KEY_BINDING_LEN] {
    let digest = Sha256::digest(key.as_bytes());
    let mut binding = [0u8; KEY_BINDING_LEN];
    binding.copy_from_slice(&digest[..KEY_BINDING_LEN]);
    binding
}

fn bind(key: &str, value: &[u8]) -> Vec<u8> {
    let mut bound = Vec::with_capacity(KEY_BINDING_LEN + value.len());
    bound.extend_from_slice(&key_binding(key));
    bound.extend_from_slice(value);
    bound
}

fn unbind(key: &str, bound: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
    match bound.split_at_checked(KEY_BINDING_LEN) {
        Some((binding, value)) if binding == key_binding(key) => Ok(value.to_vec()),
        _ => Err(KeyManagementError::rejected(format!(
            "HSM ciphertext was not sealed for key {key}"
        ))),
    }
}

/// Where to find the token and key.
#[derive(Clone, Default)]
pub struct HsmConfig {
    pub module_path: PathBuf,
    pub slot_id: u64,
    /// When set, the token in the slot must carry this label.
    pub token_label: String,
    pub pin: String,
    pub key_label: String,
}

impl std::fmt::Debug for HsmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmConfig")
            .field("module_path", &self.module_path)
            .field("slot_id", &self.slot_id)
            .field("token_label", &self.token_label)
            .field("pin", &"<redacted>")
            .field("key_label", &self.key_label)
            .finish()
    }
}

struct HsmSession {
    session: Session,
    public_key: ObjectHandle,
    private_key: ObjectHandle,
}

impl Drop for HsmSession {
    fn drop(&mut self) {
        // The session closes and the module finalizes when their handles drop.
        if let Err(err) = self.session.logout() {
            warn!(error = %err, "HSM logout failed");
        }
    }
}

enum HsmFailure {
    /// The token answered with an error.
    Device(cryptoki::error::Error),
    /// The call never completed (worker panicked, lock poisoned).
    Task(String),
}

impl std::fmt::Display for HsmFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HsmFailure::Device(err) => write!(f, "HSM: {err}"),
            HsmFailure::Task(reason) => write!(f, "HSM: {reason}"),
        }
    }
}

/// Lost device, session or login state: the token may answer after a
/// reconnect, so these are outages rather than refusals.
fn is_transient_rv(rv: &RvError) -> bool {
    matches!(
        rv,
        RvError::DeviceRemoved
            | RvError::DeviceError
            | RvError::DeviceMemory
            | RvError::HostMemory
            | RvError::SessionClosed
            | RvError::SessionHandleInvalid
            | RvError::TokenNotPresent
            | RvError::UserNotLoggedIn
            | RvError::CryptokiNotInitialized
    )
}

impl HsmFailure {
    fn is_transient(&self) -> bool {
        match self {
            HsmFailure::Task(_) => true,
            HsmFailure::Device(Pkcs11Error::Pkcs11(rv, ..)) => is_transient_rv(rv),
            HsmFailure::Device(_) => false,
        }
    }
}

impl From<HsmFailure> for KeyManagementError {
    fn from(failure: HsmFailure) -> Self {
        if failure.is_transient() {
            KeyManagementError::unreachable(failure)
        } else {
            KeyManagementError::rejected(failure)
        }
    }
}

impl From<HsmFailure> for ServiceError {
    fn from(failure: HsmFailure) -> Self {
        ServiceError::unavailable(failure)
    }
}

/// RSA key pair on a PKCS#11 token.
///
/// As a [`KeyManagement`] provider it encrypts for any store (see
/// [`HsmService::with_store`]). As a [`Service`] on its own it keeps the
/// RSA-encrypted values as private data objects on the token.
#[derive(Clone)]
pub struct HsmService {
    session: Arc<Mutex<HsmSession>>,
    key_label: String,
}

impl std::fmt::Debug for HsmService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmService")
            .field("key_label", &self.key_label)
            .finish_non_exhaustive()
    }
}

fn config_err(step: &str) -> impl Fn(cryptoki::error::Error) -> ServiceError + '_ {
    move |err| ServiceError::configuration(format!("HSM {step}: {err}"))
}

impl HsmService {
    /// Load the module, log in to the token and locate (or generate) the key pair.
    pub fn open(config: HsmConfig) -> Result<Self, ServiceError> {
        if config.pin.is_empty() {
            return Err(ServiceError::configuration(
                "HSM PIN must be provided through STRONGBOX_HSM_PIN",
            ));
        }
        if config.module_path.as_os_str().is_empty() {
            return Err(ServiceError::configuration("HSM module path must be set"));
        }
        if config.key_label.trim().is_empty() {
            return Err(ServiceError::configuration("HSM key label must be set"));
        }

        let pkcs11 = Pkcs11::new(&config.module_path).map_err(|err| {
            ServiceError::configuration(format!(
                "loading PKCS#11 module {}: {err}",
                config.module_path.display()
            ))
        })?;
        pkcs11
            .initialize(CInitializeArgs::OsThreads)
            .map_err(config_err("initialize"))?;

        let slot = pkcs11
            .get_slots_with_token()
            .map_err(config_err("listing slots"))?
            .into_iter()
            .find(|slot| slot.id() == config.slot_id)
            .ok_or_else(|| {
                ServiceError::configuration(format!(
                    "no HSM token present in slot {}",
                    config.slot_id
                ))
            })?;

        if !config.token_label.is_empty() {
            let info = pkcs11
                .get_token_info(slot)
                .map_err(config_err("reading token info"))?;
            if info.label().trim() != config.token_label {
                return Err(ServiceError::configuration(format!(
                    "token in slot {} is labelled '{}', expected '{}'",
                    config.slot_id,
                    info.label().trim(),
                    config.token_label
                )));
            }
        }

        let session = pkcs11
            .open_rw_session(slot)
            .map_err(config_err("opening session"))?;
        session
            .login(UserType::User, Some(&AuthPin::new(config.pin.clone())))
            .map_err(config_err("login"))?;

        let (public_key, private_key) = match find_key_pair(&session, &config.key_label)
            .map_err(config_err("searching key pair"))?
        {
            Some(pair) => pair,
            None => {
                info!(label = %config.key_label, "generating RSA key pair on the token");
                generate_key_pair(&session, &config.key_label)
                    .map_err(config_err("generating key pair"))?
            }
        };
        debug!(slot = config.slot_id, label = %config.key_label, "HSM session ready");

        Ok(Self {
            session: Arc::new(Mutex::new(HsmSession {
                session,
                public_key,
                private_key,
            })),
            key_label: config.key_label,
        })
    }

    /// Envelope store with this HSM as provider and `inner` holding ciphertext.
    pub fn with_store<S: Service>(self, inner: S) -> EnvelopeService<Self, S> {
        EnvelopeService::new(self, inner)
    }

    async fn run<T, F>(&self, op: F) -> Result<T, HsmFailure>
    where
        T: Send + 'static,
        F: FnOnce(&HsmSession) -> Result<T, cryptoki::error::Error> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let guard = session
                .lock()
                .map_err(|_| HsmFailure::Task("session lock poisoned".to_string()))?;
            op(&guard).map_err(HsmFailure::Device)
        })
        .await
        .map_err(|e| HsmFailure::Task(format!("worker failed: {e}")))?
    }
}

fn find_key_pair(
    session: &Session,
    label: &str,
) -> Result<Option<(ObjectHandle, ObjectHandle)>, cryptoki::error::Error> {
    let find = |class| {
        session.find_objects(&[
            Attribute::Class(class),
            Attribute::Label(label.as_bytes().to_vec()),
        ])
    };
    let public = find(ObjectClass::PUBLIC_KEY)?.into_iter().next();
    let private = find(ObjectClass::PRIVATE_KEY)?.into_iter().next();
    Ok(public.zip(private))
}

fn generate_key_pair(
    session: &Session,
    label: &str,
) -> Result<(ObjectHandle, ObjectHandle), cryptoki::error::Error> {
    let label = label.as_bytes().to_vec();
    let public_template = [
        Attribute::Token(true),
        Attribute::Private(false),
        Attribute::Encrypt(true),
        Attribute::ModulusBits(Ulong::from(RSA_MODULUS_BITS)),
        Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()),
        Attribute::Label(label.clone()),
    ];
    let private_template = [
        Attribute::Token(true),
        Attribute::Private(true),
        Attribute::Sensitive(true),
        Attribute::Extractable(false),
        Attribute::Decrypt(true),
        Attribute::Label(label),
    ];
    session.generate_key_pair(
        &Mechanism::RsaPkcsKeyPairGen,
        &public_template,
        &private_template,
    )
}

fn data_objects(session: &Session, key: Option<&str>) -> Result<Vec<ObjectHandle>, cryptoki::error::Error> {
    let mut template = vec![
        Attribute::Class(ObjectClass::DATA),
        Attribute::Application(APPLICATION.to_vec()),
    ];
    if let Some(key) = key {
        template.push(Attribute::Label(key.as_bytes().to_vec()));
    }
    session.find_objects(&template)
}

#[async_trait]
impl KeyManagement for HsmService {
    fn name(&self) -> &'static str {
        "hsm"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let plaintext = bind(key, plaintext);
        Ok(self
            .run(move |hsm| hsm.session.encrypt(&Mechanism::RsaPkcs, hsm.public_key, &plaintext))
            .await?)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn decrypt(&self, key: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KeyManagementError> {
        let ciphertext = ciphertext.to_vec();
        let bound = self
            .run(move |hsm| hsm.session.decrypt(&Mechanism::RsaPkcs, hsm.private_key, &ciphertext))
            .await?;
        unbind(key, &bound)
    }
}

#[async_trait]
impl Service for HsmService {
    fn name(&self) -> &'static str {
        "hsm"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let owned = key.to_string();
        let sealed = self
            .run(move |hsm| {
                let Some(handle) = data_objects(&hsm.session, Some(&owned))?.into_iter().next()
                else {
                    return Ok(None);
                };
                let attributes = hsm.session.get_attributes(handle, &[AttributeType::Value])?;
                Ok(attributes.into_iter().find_map(|attr| match attr {
                    Attribute::Value(value) => Some(value),
                    _ => None,
                }))
            })
            .await?
            .ok_or_else(|| ServiceError::not_found(key))?;

        KeyManagement::decrypt(self, key, &sealed)
            .await
            .map_err(|err| match err {
                KeyManagementError::Rejected { reason } => ServiceError::DecryptionFailed { reason },
                KeyManagementError::Unreachable { reason } => ServiceError::Unavailable { reason },
            })
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        let sealed = KeyManagement::encrypt(self, key, value)
            .await
            .map_err(|err| match err {
                KeyManagementError::Rejected { reason } => ServiceError::EncryptionFailed { reason },
                KeyManagementError::Unreachable { reason } => ServiceError::Unavailable { reason },
            })?;

        let owned = key.to_string();
        self.run(move |hsm| {
            let previous = data_objects(&hsm.session, Some(&owned))?;
            // The new object exists before the old one goes away.
            hsm.session.create_object(&[
                Attribute::Class(ObjectClass::DATA),
                Attribute::Token(true),
                Attribute::Private(true),
                Attribute::Application(APPLICATION.to_vec()),
                Attribute::Label(owned.as_bytes().to_vec()),
                Attribute::Value(sealed),
            ])?;
            for handle in previous {
                hsm.session.destroy_object(handle)?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        let owned = key.to_string();
        self.run(move |hsm| {
            for handle in data_objects(&hsm.session, Some(&owned))? {
                hsm.session.destroy_object(handle)?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let mut keys = self
            .run(|hsm| {
                let mut labels = Vec::new();
                for handle in data_objects(&hsm.session, None)? {
                    let attributes = hsm.session.get_attributes(handle, &[AttributeType::Label])?;
                    labels.extend(attributes.into_iter().filter_map(|attr| match attr {
                        Attribute::Label(label) => String::from_utf8(label).ok(),
                        _ => None,
                    }));
                }
                Ok(labels)
            })
            .await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
