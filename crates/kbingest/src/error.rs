use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::RateLimitError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("User '{caller}' is not allowed to access job '{job_id}'")]
    Forbidden { job_id: String, caller: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Indexing service error: {0}")]
    Indexing(#[from] IndexingError),

    #[error("Rate limiter: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

/// Coarse classification used by callers that need to map errors onto
/// user-facing responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    ExternalService,
    RateLimited,
    Persistence,
    Cancelled,
    Config,
}

impl IngestError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        IngestError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Validation(_) => ErrorKind::Validation,
            IngestError::NotFound { .. } => ErrorKind::NotFound,
            IngestError::Forbidden { .. } => ErrorKind::Forbidden,
            IngestError::Config(_) => ErrorKind::Config,
            IngestError::Storage(_) | IngestError::Fetch(_) => ErrorKind::ExternalService,
            IngestError::Indexing(e) if e.is_throttled() => ErrorKind::RateLimited,
            IngestError::Indexing(IndexingError::RateLimit(_)) => ErrorKind::Cancelled,
            IngestError::Indexing(_) => ErrorKind::ExternalService,
            IngestError::RateLimit(_) => ErrorKind::Cancelled,
            IngestError::Database(_) => ErrorKind::Persistence,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Secret '{name}' could not be resolved: {reason}")]
    Secret { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write object '{path}': {source}")]
    WriteObject {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read object '{path}': {source}")]
    ReadObject {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Unsupported source URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download of '{url}' returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to read local file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum IndexingError {
    #[error("Indexing service is not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Indexing service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The service asked us to slow down (HTTP 429 or equivalent).
    #[error("Indexing service is throttling requests")]
    Throttled { retry_after: Option<Duration> },

    #[error("Unexpected response from indexing service: {0}")]
    Decode(String),

    #[error("Request was not sent: {0}")]
    RateLimit(#[from] RateLimitError),
}

impl IndexingError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, IndexingError::Throttled { .. })
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to store notification: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Failed to encode notification metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
