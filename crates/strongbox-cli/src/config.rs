use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};

pub const DEFAULT_K8S_NAMESPACE: &str = "default";
pub const DEFAULT_K8S_SECRET: &str = "strongbox";
pub const DEFAULT_HSM_KEY_LABEL: &str = "strongbox";
pub const DEFAULT_VAULT_AUTH_PATH: &str = "kubernetes";
pub const DEFAULT_VAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// User-level configuration loaded from `~/.config/strongbox/config.toml`
/// (platform-specific) or the path given with `--config`.
#[derive(Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Backend mode, e.g. `aws-kms-s3` or `file`.
    pub mode: Option<String>,
    pub aws: Option<AwsConfig>,
    pub gcp: Option<GcpConfig>,
    pub azure: Option<AzureConfig>,
    pub alibaba: Option<AlibabaConfig>,
    pub vault: Option<VaultConfig>,
    pub k8s: Option<K8sConfig>,
    pub hsm: Option<HsmSettings>,
    pub file: Option<FileConfig>,
    /// Only ever read from `STRONGBOX_HSM_PIN`.
    #[serde(skip)]
    pub hsm_pin: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("mode", &self.mode)
            .field("aws", &self.aws)
            .field("gcp", &self.gcp)
            .field("azure", &self.azure)
            .field("alibaba", &self.alibaba)
            .field("vault", &self.vault)
            .field("k8s", &self.k8s)
            .field("hsm", &self.hsm)
            .field("file", &self.file)
            .field("hsm_pin", &"<redacted>")
            .finish()
    }
}

/// Parallel lists: entry `i` of every list describes the `i`-th replica.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AwsConfig {
    pub s3_regions: Vec<String>,
    pub s3_buckets: Vec<String>,
    pub s3_prefix: String,
    pub kms_regions: Vec<String>,
    pub kms_key_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct GcpConfig {
    pub storage_bucket: String,
    pub storage_prefix: String,
    pub kms_project: String,
    pub kms_location: String,
    pub kms_key_ring: String,
    pub kms_crypto_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AzureConfig {
    pub key_vault_name: String,
}

#[derive(Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AlibabaConfig {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub oss_endpoint: String,
    pub oss_bucket: String,
    pub oss_prefix: String,
    pub kms_region: String,
    pub kms_key_id: String,
}

impl std::fmt::Debug for AlibabaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlibabaConfig")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("oss_endpoint", &self.oss_endpoint)
            .field("oss_bucket", &self.oss_bucket)
            .field("oss_prefix", &self.oss_prefix)
            .field("kms_region", &self.kms_region)
            .field("kms_key_id", &self.kms_key_id)
            .finish()
    }
}

#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct VaultConfig {
    pub address: String,
    pub unseal_keys_path: String,
    /// Kubernetes auth role; used when no token is configured.
    pub role: String,
    pub auth_path: String,
    pub token_path: PathBuf,
    pub token: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            unseal_keys_path: String::new(),
            role: String::new(),
            auth_path: DEFAULT_VAULT_AUTH_PATH.to_string(),
            token_path: PathBuf::from(DEFAULT_VAULT_TOKEN_PATH),
            token: String::new(),
        }
    }
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("address", &self.address)
            .field("unseal_keys_path", &self.unseal_keys_path)
            .field("role", &self.role)
            .field("auth_path", &self.auth_path)
            .field("token_path", &self.token_path)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct K8sConfig {
    pub namespace: String,
    pub secret: String,
    /// Labels put on the Secret when strongbox creates it.
    pub labels: BTreeMap<String, String>,
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_K8S_NAMESPACE.to_string(),
            secret: DEFAULT_K8S_SECRET.to_string(),
            labels: BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "strongbox".to_string(),
            )]),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HsmSettings {
    pub module_path: PathBuf,
    pub slot_id: u64,
    pub token_label: String,
    pub key_label: String,
}

impl Default for HsmSettings {
    fn default() -> Self {
        Self {
            module_path: PathBuf::new(),
            slot_id: 0,
            token_label: String::new(),
            key_label: DEFAULT_HSM_KEY_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub path: PathBuf,
    /// When set, values are sealed with a local AES-GCM key kept in this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl Config {
    /// Apply environment overrides; `lookup` is `std::env::var` outside tests.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(mode) = var("STRONGBOX_MODE") {
            self.mode = Some(mode);
        }
        if let Some(pin) = var("STRONGBOX_HSM_PIN") {
            self.hsm_pin = pin;
        }

        let id = var("ALIBABA_ACCESS_KEY_ID");
        let secret = var("ALIBABA_ACCESS_KEY_SECRET");
        if id.is_some() || secret.is_some() {
            let alibaba = self.alibaba.get_or_insert_with(AlibabaConfig::default);
            if alibaba.access_key_id.is_empty() {
                alibaba.access_key_id = id.unwrap_or_default();
            }
            if alibaba.access_key_secret.is_empty() {
                alibaba.access_key_secret = secret.unwrap_or_default();
            }
        }

        if let Some(token) = var("VAULT_TOKEN") {
            let vault = self.vault.get_or_insert_with(VaultConfig::default);
            if vault.token.is_empty() {
                vault.token = token;
            }
        }
        self
    }

    /// Starter file written by `config init`: a local file store.
    pub fn starter() -> Result<Self> {
        Ok(Config {
            mode: Some("file".to_string()),
            file: Some(FileConfig {
                path: default_data_dir()?,
                key_file: None,
            }),
            ..Config::default()
        })
    }
}

/// Load config from `path` (or the default path) and apply the environment.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_path()?,
    };
    Ok(load_from_path(path)?.with_env(|name| std::env::var(name).ok()))
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("strongbox").join("config.toml"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("strongbox"))
}

/// Write `config` to `path` unless a file is already there, so user edits are
/// never clobbered. Returns the path either way.
pub fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
