use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use strongbox_core::{Service, ServiceError};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

/// Longest filename common filesystems accept (`NAME_MAX`).
const MAX_FILE_NAME: usize = 255;

/// File-backed store: one file per key under `root`. Values are written as
/// given, so wrap it in an envelope layer when the bytes must be protected.
#[derive(Debug, Clone)]
pub struct FileService {
    root: PathBuf,
}

impl FileService {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ServiceError> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(ServiceError::configuration("file path must not be empty"));
        }
        fs::create_dir_all(&root).map_err(|e| {
            ServiceError::configuration(format!("cannot create {}: {e}", root.display()))
        })?;
        debug!(root = %root.display(), "initializing file store");
        Ok(Self { root })
    }

    /// Keys whose encoded name would exceed `NAME_MAX` (about 190 bytes of
    /// key) are refused instead of being shortened, so `list` can always
    /// recover the key from the filename.
    pub(crate) fn path_for(&self, key: &str) -> Result<PathBuf, ServiceError> {
        let name = sanitize_key(key);
        if name.len() > MAX_FILE_NAME {
            return Err(ServiceError::configuration(format!(
                "key of {} bytes is too long for the file store",
                key.len()
            )));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl Service for FileService {
    fn name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        read_value(&self.path_for(key)?, key)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        write_value(&self.path_for(key)?, value)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_err(err)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(storage_err)?;
            if !entry.file_type().map_err(storage_err)?.is_file() {
                continue;
            }
            // Temp files left by interrupted writes do not decode and are skipped.
            let Some(key) = entry.file_name().to_str().and_then(unsanitize_key) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Replace the file atomically so readers see the old or the new value, never a torn one.
fn write_value(path: &Path, value: &[u8]) -> Result<(), ServiceError> {
    let parent = path
        .parent()
        .ok_or_else(|| ServiceError::unavailable("invalid storage path"))?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    tmp.write_all(value).map_err(storage_err)?;
    tmp.as_file().sync_all().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn read_value(path: &Path, key: &str) -> Result<Vec<u8>, ServiceError> {
    let mut file = File::open(path).map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            ServiceError::not_found(key)
        } else {
            storage_err(err)
        }
    })?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    Ok(buf)
}

fn sanitize_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

fn unsanitize_key(name: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(name).ok()?;
    String::from_utf8(bytes).ok()
}

fn storage_err<E: ToString>(err: E) -> ServiceError {
    ServiceError::unavailable(err.to_string())
}
