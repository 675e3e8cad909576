use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced by `Service` implementations and by their construction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Requested key does not exist. A valid outcome, not a fault.
    #[error("entry not found for key: {key}")]
    NotFound { key: String },
    /// The substrate (or the key-management service behind it) could not be reached.
    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },
    /// The key-management boundary refused to encrypt; nothing was written.
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },
    /// Stored bytes exist but could not be turned back into plaintext.
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },
    /// Stored bytes were read but are not in the format the substrate writes.
    #[error("stored value for {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    /// Invalid, missing or mismatched parameters, or a key the substrate
    /// cannot address.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
    /// A fan-out write or delete did not reach every replica.
    #[error("{operation} failed on {} of {total} members: {}", .failures.len(), describe_failures(.failures))]
    PartialReplication {
        operation: Operation,
        total: usize,
        failures: Vec<MemberFailure>,
    },
}

impl ServiceError {
    pub fn not_found(key: impl Into<String>) -> Self {
        ServiceError::NotFound { key: key.into() }
    }

    pub fn unavailable(reason: impl ToString) -> Self {
        ServiceError::Unavailable {
            reason: reason.to_string(),
        }
    }

    pub fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        ServiceError::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn configuration(reason: impl ToString) -> Self {
        ServiceError::Configuration {
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound { .. })
    }
}

/// Mutating operations that an aggregate fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Set,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Set => f.write_str("set"),
            Operation::Delete => f.write_str("delete"),
        }
    }
}

/// One replica's failure inside a fan-out operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    /// Position of the member in the aggregate group.
    pub index: usize,
    /// `Service::name` of the member.
    pub name: &'static str,
    pub error: Box<ServiceError>,
}

fn describe_failures(failures: &[MemberFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("#{} ({}): {}", f.index, f.name, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Uniform key/value contract for secret material. Every substrate, wrapper and
/// aggregate implements it, so callers never see the topology behind a handle.
#[async_trait]
pub trait Service: Send + Sync {
    /// Short name used for logging and failure reports.
    fn name(&self) -> &'static str;

    /// Retrieve the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError>;

    /// Persist a value under a key, overwriting any existing entry.
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError>;

    /// Remove a key and its value (idempotent).
    async fn delete(&self, key: &str) -> Result<(), ServiceError>;

    /// Keys currently stored that start with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError>;

    /// Whether `key` holds a readable value.
    async fn exists(&self, key: &str) -> Result<bool, ServiceError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(ServiceError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl<T> Service for Arc<T>
where
    T: Service + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        (**self).delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        (**self).list(prefix).await
    }
}

#[async_trait]
impl<T> Service for Box<T>
where
    T: Service + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        (**self).delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        (**self).list(prefix).await
    }
}
