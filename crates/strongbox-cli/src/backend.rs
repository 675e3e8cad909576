//! Backend selection: validate the configuration into an immutable
//! [`Backend`] descriptor, then compose the live store from it.

use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr, sync::Arc};

use strongbox_core::{EnvelopeService, MultiService, Service, ServiceError};
use strongbox_storage::{
    AlibabaCredentials, AlibabaKms, AwsKms, AzureKeyVaultService, DevService, FileService,
    GcsService, GoogleCloudKms, HsmConfig, HsmService, K8sSecretService, LocalKeyManagement,
    OssService, S3Service, VaultAuth, VaultKvService,
};
use tracing::{debug, info};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    GcpKmsGcs,
    AwsKmsS3,
    AzureKv,
    AlibabaKmsOss,
    Vault,
    K8s,
    Hsm,
    HsmK8s,
    Dev,
    File,
}

impl Mode {
    pub const ALL: [Mode; 10] = [
        Mode::GcpKmsGcs,
        Mode::AwsKmsS3,
        Mode::AzureKv,
        Mode::AlibabaKmsOss,
        Mode::Vault,
        Mode::K8s,
        Mode::Hsm,
        Mode::HsmK8s,
        Mode::Dev,
        Mode::File,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::GcpKmsGcs => "gcp-kms-gcs",
            Mode::AwsKmsS3 => "aws-kms-s3",
            Mode::AzureKv => "azure-kv",
            Mode::AlibabaKmsOss => "alibaba-kms-oss",
            Mode::Vault => "vault",
            Mode::K8s => "k8s",
            Mode::Hsm => "hsm",
            Mode::HsmK8s => "hsm-k8s",
            Mode::Dev => "dev",
            Mode::File => "file",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ServiceError::configuration(format!("unsupported backend mode: '{s}'")))
    }
}

/// One replica of the AWS mode: a bucket and the KMS key that seals it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsRegionPair {
    pub s3_region: String,
    pub s3_bucket: String,
    pub kms_region: String,
    pub kms_key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcpKmsKey {
    pub project: String,
    pub location: String,
    pub key_ring: String,
    pub crypto_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sSecret {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Validated backend parameters. Building one performs no I/O.
#[derive(Debug, Clone)]
pub enum Backend {
    GcpKmsGcs {
        bucket: String,
        prefix: String,
        key: GcpKmsKey,
    },
    AwsKmsS3 {
        prefix: String,
        pairs: Vec<AwsRegionPair>,
    },
    AzureKv {
        vault_name: String,
    },
    AlibabaKmsOss {
        credentials: AlibabaCredentials,
        oss_endpoint: String,
        bucket: String,
        prefix: String,
        kms_region: String,
        kms_key_id: String,
    },
    Vault {
        address: String,
        path: String,
        auth: VaultAuth,
    },
    K8s(K8sSecret),
    Hsm(HsmConfig),
    HsmK8s {
        hsm: HsmConfig,
        secret: K8sSecret,
    },
    Dev,
    File {
        path: PathBuf,
        key_file: Option<PathBuf>,
    },
}

fn require(value: &str, what: &str) -> Result<String, ServiceError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ServiceError::configuration(format!("{what} must be set")));
    }
    Ok(value.to_string())
}

fn same_len(
    (left_name, left): (&str, &[String]),
    (right_name, right): (&str, &[String]),
) -> Result<(), ServiceError> {
    if left.len() != right.len() {
        return Err(ServiceError::configuration(format!(
            "specify the same number of {left_name} and {right_name} [{} != {}]",
            left.len(),
            right.len()
        )));
    }
    Ok(())
}

impl Backend {
    pub fn resolve(config: &Config) -> Result<Self, ServiceError> {
        let mode: Mode = config
            .mode
            .as_deref()
            .ok_or_else(|| {
                ServiceError::configuration(
                    "backend mode is not set (config `mode` or STRONGBOX_MODE)",
                )
            })?
            .trim()
            .parse()?;

        let backend = match mode {
            Mode::GcpKmsGcs => {
                let gcp = config.gcp.clone().unwrap_or_default();
                Backend::GcpKmsGcs {
                    bucket: require(&gcp.storage_bucket, "gcp.storage_bucket")?,
                    prefix: gcp.storage_prefix,
                    key: GcpKmsKey {
                        project: require(&gcp.kms_project, "gcp.kms_project")?,
                        location: require(&gcp.kms_location, "gcp.kms_location")?,
                        key_ring: require(&gcp.kms_key_ring, "gcp.kms_key_ring")?,
                        crypto_key: require(&gcp.kms_crypto_key, "gcp.kms_crypto_key")?,
                    },
                }
            }
            Mode::AwsKmsS3 => {
                let aws = config.aws.clone().unwrap_or_default();
                same_len(
                    ("s3_regions", &aws.s3_regions),
                    ("s3_buckets", &aws.s3_buckets),
                )?;
                same_len(
                    ("kms_regions", &aws.kms_regions),
                    ("kms_key_ids", &aws.kms_key_ids),
                )?;
                same_len(
                    ("s3_buckets", &aws.s3_buckets),
                    ("kms_key_ids", &aws.kms_key_ids),
                )?;
                if aws.s3_regions.is_empty() {
                    return Err(ServiceError::configuration(
                        "aws-kms-s3 needs at least one S3 bucket and KMS key",
                    ));
                }

                let pairs = aws
                    .s3_regions
                    .iter()
                    .zip(&aws.s3_buckets)
                    .zip(aws.kms_regions.iter().zip(&aws.kms_key_ids))
                    .enumerate()
                    .map(|(i, ((s3_region, s3_bucket), (kms_region, kms_key_id)))| {
                        Ok(AwsRegionPair {
                            s3_region: require(s3_region, &format!("aws.s3_regions[{i}]"))?,
                            s3_bucket: require(s3_bucket, &format!("aws.s3_buckets[{i}]"))?,
                            kms_region: require(kms_region, &format!("aws.kms_regions[{i}]"))?,
                            kms_key_id: require(kms_key_id, &format!("aws.kms_key_ids[{i}]"))?,
                        })
                    })
                    .collect::<Result<Vec<_>, ServiceError>>()?;
                Backend::AwsKmsS3 {
                    prefix: aws.s3_prefix,
                    pairs,
                }
            }
            Mode::AzureKv => {
                let azure = config.azure.clone().unwrap_or_default();
                Backend::AzureKv {
                    vault_name: require(&azure.key_vault_name, "azure.key_vault_name")?,
                }
            }
            Mode::AlibabaKmsOss => {
                let ali = config.alibaba.clone().unwrap_or_default();
                let credentials =
                    AlibabaCredentials::new(ali.access_key_id.trim(), ali.access_key_secret.trim())?;
                if ali.oss_bucket.trim().is_empty() {
                    return Err(ServiceError::configuration(
                        "Alibaba OSS bucket should be specified",
                    ));
                }
                Backend::AlibabaKmsOss {
                    credentials,
                    oss_endpoint: require(&ali.oss_endpoint, "alibaba.oss_endpoint")?,
                    bucket: ali.oss_bucket.trim().to_string(),
                    prefix: ali.oss_prefix,
                    kms_region: require(&ali.kms_region, "alibaba.kms_region")?,
                    kms_key_id: require(&ali.kms_key_id, "alibaba.kms_key_id")?,
                }
            }
            Mode::Vault => {
                let vault = config.vault.clone().unwrap_or_default();
                let auth = if !vault.token.trim().is_empty() {
                    VaultAuth::Token(vault.token.trim().to_string())
                } else if !vault.role.trim().is_empty() {
                    VaultAuth::Kubernetes {
                        role: vault.role.trim().to_string(),
                        auth_path: require(&vault.auth_path, "vault.auth_path")?,
                        jwt_path: vault.token_path.clone(),
                    }
                } else {
                    return Err(ServiceError::configuration(
                        "vault mode needs a token (VAULT_TOKEN) or a Kubernetes auth role",
                    ));
                };
                Backend::Vault {
                    address: require(&vault.address, "vault.address")?,
                    path: require(&vault.unseal_keys_path, "vault.unseal_keys_path")?,
                    auth,
                }
            }
            Mode::K8s => Backend::K8s(k8s_secret(config)?),
            Mode::Hsm => Backend::Hsm(hsm_config(config)?),
            Mode::HsmK8s => Backend::HsmK8s {
                hsm: hsm_config(config)?,
                secret: k8s_secret(config)?,
            },
            Mode::Dev => Backend::Dev,
            Mode::File => {
                let file = config.file.clone().unwrap_or_default();
                if file.path.as_os_str().is_empty() {
                    return Err(ServiceError::configuration("file.path must be set"));
                }
                Backend::File {
                    path: file.path,
                    key_file: file.key_file,
                }
            }
        };
        debug!(?backend, "resolved backend");
        Ok(backend)
    }

    pub fn mode(&self) -> Mode {
        match self {
            Backend::GcpKmsGcs { .. } => Mode::GcpKmsGcs,
            Backend::AwsKmsS3 { .. } => Mode::AwsKmsS3,
            Backend::AzureKv { .. } => Mode::AzureKv,
            Backend::AlibabaKmsOss { .. } => Mode::AlibabaKmsOss,
            Backend::Vault { .. } => Mode::Vault,
            Backend::K8s(_) => Mode::K8s,
            Backend::Hsm(_) => Mode::Hsm,
            Backend::HsmK8s { .. } => Mode::HsmK8s,
            Backend::Dev => Mode::Dev,
            Backend::File { .. } => Mode::File,
        }
    }
}

fn k8s_secret(config: &Config) -> Result<K8sSecret, ServiceError> {
    let k8s = config.k8s.clone().unwrap_or_default();
    Ok(K8sSecret {
        namespace: require(&k8s.namespace, "k8s.namespace")?,
        name: require(&k8s.secret, "k8s.secret")?,
        labels: k8s.labels,
    })
}

fn hsm_config(config: &Config) -> Result<HsmConfig, ServiceError> {
    let hsm = config.hsm.clone().unwrap_or_default();
    if config.hsm_pin.is_empty() {
        return Err(ServiceError::configuration(
            "HSM PIN must be provided through STRONGBOX_HSM_PIN",
        ));
    }
    if hsm.module_path.as_os_str().is_empty() {
        return Err(ServiceError::configuration("hsm.module_path must be set"));
    }
    Ok(HsmConfig {
        module_path: hsm.module_path,
        slot_id: hsm.slot_id,
        token_label: hsm.token_label.trim().to_string(),
        pin: config.hsm_pin.clone(),
        key_label: require(&hsm.key_label, "hsm.key_label")?,
    })
}

/// Connect to the substrates named by `backend` and compose the store.
pub async fn build(backend: Backend) -> Result<Arc<dyn Service>, ServiceError> {
    let mode = backend.mode();
    let store: Arc<dyn Service> = match backend {
        Backend::GcpKmsGcs { bucket, prefix, key } => {
            let gcs = GcsService::new(bucket, prefix)?;
            let kms = GoogleCloudKms::new(&key.project, &key.location, &key.key_ring, &key.crypto_key)?;
            Arc::new(EnvelopeService::new(kms, gcs))
        }
        Backend::AwsKmsS3 { prefix, pairs } => {
            let mut members: Vec<Arc<dyn Service>> = Vec::with_capacity(pairs.len());
            for pair in pairs {
                let s3 = S3Service::new(pair.s3_region, pair.s3_bucket, prefix.clone()).await?;
                let kms = AwsKms::new(pair.kms_region, pair.kms_key_id).await?;
                members.push(Arc::new(EnvelopeService::new(kms, s3)));
            }
            Arc::new(MultiService::new(members)?)
        }
        Backend::AzureKv { vault_name } => Arc::new(AzureKeyVaultService::new(&vault_name)?),
        Backend::AlibabaKmsOss {
            credentials,
            oss_endpoint,
            bucket,
            prefix,
            kms_region,
            kms_key_id,
        } => {
            let oss = OssService::new(&oss_endpoint, bucket, prefix, credentials.clone())?;
            let kms = AlibabaKms::new(&kms_region, kms_key_id, credentials)?;
            Arc::new(EnvelopeService::new(kms, oss))
        }
        Backend::Vault {
            address,
            path,
            auth,
        } => Arc::new(VaultKvService::connect(&address, &path, auth).await?),
        Backend::K8s(secret) => Arc::new(K8sSecretService::in_cluster(
            secret.namespace,
            secret.name,
            secret.labels,
        )?),
        Backend::Hsm(hsm) => Arc::new(HsmService::open(hsm)?),
        Backend::HsmK8s { hsm, secret } => {
            let k8s = K8sSecretService::in_cluster(secret.namespace, secret.name, secret.labels)?;
            Arc::new(HsmService::open(hsm)?.with_store(k8s))
        }
        Backend::Dev => Arc::new(DevService::new()?),
        Backend::File { path, key_file } => {
            let files = FileService::new(path)?;
            match key_file {
                Some(key_file) => Arc::new(EnvelopeService::new(
                    LocalKeyManagement::from_key_file(key_file)?,
                    files,
                )),
                None => Arc::new(files),
            }
        }
    };
    info!(%mode, store = store.name(), "backend ready");
    Ok(store)
}
