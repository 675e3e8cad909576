//! Key-management providers for the envelope layer.

mod alibaba;
mod aws;
mod gcp;
mod local;

pub use alibaba::AlibabaKms;
pub use aws::AwsKms;
pub use gcp::GoogleCloudKms;
pub use local::LocalKeyManagement;

/// Encryption-context entry naming the storage key a ciphertext belongs to.
pub(crate) const CONTEXT_KEY: &str = "strongbox-key";
