//! Concrete substrates behind the `strongbox_core::Service` contract: object
//! stores, cluster and vault secret stores, the local filesystem, plus the
//! key-management providers that the envelope layer encrypts with.

pub mod alibaba;
pub mod auth;
pub mod azure;
pub mod dev;
pub mod file;
pub mod gcs;
pub mod hsm;
mod http;
pub mod k8s;
pub mod kms;
pub mod oss;
pub mod s3;
pub mod vault;

pub use alibaba::AlibabaCredentials;
pub use azure::AzureKeyVaultService;
pub use dev::DevService;
pub use file::FileService;
pub use gcs::GcsService;
pub use hsm::{HsmConfig, HsmService};
pub use k8s::K8sSecretService;
pub use kms::{AlibabaKms, AwsKms, GoogleCloudKms, LocalKeyManagement};
pub use oss::OssService;
pub use s3::S3Service;
pub use vault::{VaultAuth, VaultKvService};
