//! External semantic-indexing service.
//!
//! The service is eventually consistent: registering a data source and
//! starting a pass return immediately, and the pass is polled until it
//! reports a terminal state. Every string the service reports is decoded
//! through [`PassState::decode`], which never maps an unrecognized value to
//! success.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexingError;
use crate::model::ItemType;

pub mod http;
pub mod limited;

pub use http::HttpIndexingClient;
pub use limited::RateLimitedIndexing;

/// What gets registered for one stored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub item_id: String,
    pub title: String,
    pub item_type: ItemType,
    /// Object-storage key.
    pub object_key: String,
    /// URL the service can fetch the object from.
    pub storage_url: String,
}

/// Raw pass status as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PassReport {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            detail: None,
        }
    }

    pub fn decode(&self) -> PassState {
        PassState::decode(&self.state)
    }
}

/// Decoded pass state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassState {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
    /// A value we have no mapping for. Treated as still running.
    Unknown(String),
}

impl PassState {
    pub fn decode(raw: &str) -> Self {
        match raw.trim() {
            "BATCH_JOB_PHASE_SUCCEEDED" | "INDEX_JOB_STATUS_COMPLETED" | "completed"
            | "succeeded" => PassState::Succeeded,
            "BATCH_JOB_PHASE_FAILED" | "BATCH_JOB_PHASE_ERROR" | "INDEX_JOB_STATUS_FAILED"
            | "failed" => PassState::Failed,
            "BATCH_JOB_PHASE_CANCELLED" | "INDEX_JOB_STATUS_CANCELLED" | "cancelled" => {
                PassState::Cancelled
            }
            "BATCH_JOB_PHASE_PENDING"
            | "BATCH_JOB_PHASE_RUNNING"
            | "INDEX_JOB_STATUS_PENDING"
            | "INDEX_JOB_STATUS_IN_PROGRESS"
            | "DATA_SOURCE_STATUS_UPDATED"
            | "pending"
            | "in_progress"
            | "running" => PassState::InProgress,
            other => PassState::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PassState::Succeeded | PassState::Failed | PassState::Cancelled
        )
    }
}

/// Interface implemented by indexing-service backends.
#[async_trait]
pub trait IndexingClient: Send + Sync {
    /// Registers a stored object with the index and returns the data source id.
    async fn register_data_source(
        &self,
        index_ref: &str,
        source: &DataSourceDescriptor,
    ) -> Result<String, IndexingError>;

    /// Starts an indexing pass over the given data sources and returns the
    /// pass id.
    async fn start_indexing_pass(
        &self,
        index_ref: &str,
        data_source_ids: &[String],
    ) -> Result<String, IndexingError>;

    async fn get_indexing_pass_status(&self, pass_id: &str) -> Result<PassReport, IndexingError>;
}
