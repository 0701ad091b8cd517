use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::{FetchError, IndexingError, StorageError};

/// Why one item's pipeline stopped. The `Display` form is what ends up in
/// the item's `error_message`.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Validation failed: {0}")]
    Rejected(String),

    #[error("Validator crashed: {0}")]
    ValidatorPanicked(String),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Registration failed: {0}")]
    Indexing(#[from] IndexingError),

    /// Item state could not be written. Recorded on the item only if a later
    /// write goes through.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
