//! Progress broadcaster for streaming item and job transitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{ItemStatus, JobStatus};

/// One observed transition. Item events carry `item_id` and `item_status`;
/// job events carry only `job_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestProgressEvent {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_status: Option<ItemStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,
    /// Human-readable message describing current activity.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl IngestProgressEvent {
    pub fn item(
        job_id: &str,
        item_id: &str,
        title: &str,
        status: ItemStatus,
        message: &str,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            item_id: Some(item_id.to_string()),
            title: Some(title.to_string()),
            item_status: Some(status),
            job_status: None,
            message: message.to_string(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn job(job_id: &str, status: JobStatus, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            item_id: None,
            title: None,
            item_status: None,
            job_status: Some(status),
            message: message.to_string(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Broadcasts progress events to any number of subscribers.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: Arc<broadcast::Sender<IngestProgressEvent>>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: IngestProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestProgressEvent> {
        self.sender.subscribe()
    }

    pub fn job_status(&self, job_id: &str, status: JobStatus, message: &str) {
        self.send(IngestProgressEvent::job(job_id, status, message));
    }

    /// Creates a tracker that stamps every event with the item's identity.
    pub fn track_item(&self, job_id: &str, item_id: &str, title: &str) -> ItemProgressTracker {
        ItemProgressTracker {
            job_id: job_id.to_string(),
            item_id: item_id.to_string(),
            title: title.to_string(),
            sender: Arc::clone(&self.sender),
        }
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Tracks progress for a single item.
pub struct ItemProgressTracker {
    job_id: String,
    item_id: String,
    title: String,
    sender: Arc<broadcast::Sender<IngestProgressEvent>>,
}

impl ItemProgressTracker {
    pub fn update(&self, status: ItemStatus, message: &str) {
        let event =
            IngestProgressEvent::item(&self.job_id, &self.item_id, &self.title, status, message);
        let _ = self.sender.send(event);
    }

    pub fn failed(&self, error: &str) {
        let event = IngestProgressEvent::item(
            &self.job_id,
            &self.item_id,
            &self.title,
            ItemStatus::Failed,
            "Item failed",
        )
        .with_error(error);
        let _ = self.sender.send(event);
    }
}
