//! Object storage for raw item bytes.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::sanitize;

pub mod filesystem;
pub mod memory;

pub use filesystem::FsObjectStorage;
pub use memory::MemoryObjectStorage;

/// Interface implemented by object-storage backends.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under `key` and returns a URL the object can be
    /// retrieved from.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Builds the object key `{prefix}/{unix_ts}_{item_id}_{filename}.pdf`.
///
/// Titles are not unique within a batch, so the item id keeps two items
/// stored in the same second from sharing an object.
pub fn object_key(prefix: &str, item_id: &str, name: &str, unix_ts: i64) -> String {
    let filename = sanitize::storage_filename(name);
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}_{}_{}", unix_ts, item_id, filename)
    } else {
        format!("{}/{}_{}_{}", prefix, unix_ts, item_id, filename)
    }
}

/// Content type for a stored object, guessed from its key.
pub fn content_type_for(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Rejects keys that could escape the storage root.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment.is_empty() || segment == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
