use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::service::{Service, ServiceError};

/// Raw in-memory store. Nothing is encrypted or persisted; it backs dev mode
/// and serves as the inner store in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryService {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with the given entries.
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        let map = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    /// Raw bytes currently held for `key`, bypassing the contract.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().ok()?.get(key).cloned()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, ServiceError> {
        self.inner
            .lock()
            .map_err(|err| ServiceError::unavailable(format!("lock poisoned: {err}")))
    }
}

#[async_trait]
impl Service for MemoryService {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(key))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let mut keys: Vec<String> = self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
