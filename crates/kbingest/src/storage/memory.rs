use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{validate_key, ObjectStorage};
use crate::error::StorageError;

/// Keeps objects in memory. Useful for tests and dry runs.
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Vec<u8>, String)>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content type recorded for `key`, if stored.
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.lock().get(key).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        validate_key(key)?;
        let mut objects = self.lock();
        objects.insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{}", key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let objects = self.lock();
        objects
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut objects = self.lock();
        objects.remove(key);
        Ok(())
    }
}
