use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{validate_key, ObjectStorage};
use crate::error::StorageError;

/// Stores objects as files below a root directory and hands out `file://`
/// URLs.
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        // Write to a temp file and rename so readers never see a partial object.
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StorageError::WriteObject {
                path: tmp.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::WriteObject {
                path: path.clone(),
                source: e,
            })?;

        log::debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::ReadObject { path, source: e }),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Deleting a missing object is not an error.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::WriteObject { path, source: e }),
        }
    }
}
