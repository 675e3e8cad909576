use std::{fs, path::Path};

use async_trait::async_trait;
use strongbox_core::{keys, MemoryService, Service, ServiceError};
use tracing::debug;

/// Store for a Vault dev server: memory only, seeded with the root token the
/// dev server leaves in `~/.vault-token`.
#[derive(Debug, Clone)]
pub struct DevService {
    inner: MemoryService,
}

impl DevService {
    /// Seed from `$HOME/.vault-token`.
    pub fn new() -> Result<Self, ServiceError> {
        let home = dirs::home_dir()
            .ok_or_else(|| ServiceError::configuration("no home directory available"))?;
        Self::from_token_file(home.join(".vault-token"))
    }

    pub fn from_token_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let token = fs::read(path).map_err(|e| {
            ServiceError::configuration(format!(
                "dev mode needs a root token at {}: {e}",
                path.display()
            ))
        })?;
        debug!(path = %path.display(), "seeded dev store with root token");
        Ok(Self {
            inner: MemoryService::with_entries([(keys::ROOT_TOKEN, token)]),
        })
    }
}

#[async_trait]
impl Service for DevService {
    fn name(&self) -> &'static str {
        "dev"
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        self.inner.list(prefix).await
    }
}
