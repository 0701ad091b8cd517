//! User-facing notifications about job progress and outcomes.
//!
//! The engine emits one `in_progress` notification when a job starts waiting
//! on the indexing service and exactly one `success`, `warning` or `error`
//! notification per terminal transition. Emission failures are logged by the
//! caller and never undo a state transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;
use crate::model::{IngestionJob, JobStatus, JobType};

pub mod channel;
pub mod database;

pub use channel::BroadcastNotifier;
pub use database::DatabaseNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
    InProgress,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Info => "info",
            NotificationKind::Success => "success",
            NotificationKind::Warning => "warning",
            NotificationKind::Error => "error",
            NotificationKind::InProgress => "in_progress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    BatchIngest,
    DocumentUpload,
    General,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::BatchIngest => "batch_ingest",
            NotificationCategory::DocumentUpload => "document_upload",
            NotificationCategory::General => "general",
        }
    }

    pub fn for_job_type(job_type: JobType) -> Self {
        match job_type {
            JobType::BatchIngest => NotificationCategory::BatchIngest,
            JobType::BatchUpload => NotificationCategory::DocumentUpload,
        }
    }
}

/// Job counters attached to every job notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMetadata {
    pub job_id: String,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub progress: u32,
}

impl NotificationMetadata {
    pub fn for_job(job: &IngestionJob) -> Self {
        Self {
            job_id: job.id.clone(),
            total: job.total_items,
            completed: job.completed_items,
            failed: job.failed_items,
            progress: job.progress(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub category: NotificationCategory,
    pub title: String,
    pub message: String,
    pub metadata: NotificationMetadata,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Sent once when the job's files are stored and the indexing pass runs.
    pub fn awaiting_confirmation(job: &IngestionJob) -> Self {
        let noun = noun_for(job.job_type);
        let message = if job.failed_items > 0 {
            format!(
                "Uploaded {} {} ({} failed). Indexing for search...",
                job.completed_items, noun, job.failed_items
            )
        } else {
            format!(
                "Uploaded {} {}. Indexing for search...",
                job.completed_items, noun
            )
        };
        Self::for_job(
            job,
            NotificationKind::InProgress,
            format!("{} processing", capitalized(noun)),
            message,
        )
    }

    /// Builds the single notification for a job that reached a terminal
    /// status. Returns `None` for non-terminal statuses.
    pub fn job_finished(job: &IngestionJob) -> Option<Self> {
        let noun = noun_for(job.job_type);
        let (kind, title, message) = match job.status {
            JobStatus::Completed => (
                NotificationKind::Success,
                format!("{} ready", capitalized(noun)),
                format!(
                    "Successfully indexed {} {}. They are now available for search.",
                    job.completed_items, noun
                ),
            ),
            JobStatus::PartiallyCompleted => (
                NotificationKind::Warning,
                format!("{} partially ready", capitalized(noun)),
                format!(
                    "Indexed {} {} ({} failed).",
                    job.completed_items, noun, job.failed_items
                ),
            ),
            JobStatus::Failed => (
                NotificationKind::Error,
                format!("{} failed", capitalized(noun)),
                match &job.error_message {
                    Some(reason) => format!("Failed to index {}: {}", noun, reason),
                    None => format!("Failed to index {}. Please try again.", noun),
                },
            ),
            JobStatus::Cancelled => (
                NotificationKind::Warning,
                format!("{} cancelled", capitalized(noun)),
                format!(
                    "Job cancelled after {} of {} {} were processed.",
                    job.completed_items + job.failed_items,
                    job.total_items,
                    noun
                ),
            ),
            _ => return None,
        };
        Some(Self::for_job(job, kind, title, message))
    }

    fn for_job(job: &IngestionJob, kind: NotificationKind, title: String, message: String) -> Self {
        Self {
            user_id: job.owner_id.clone(),
            kind,
            category: NotificationCategory::for_job_type(job.job_type),
            title,
            message,
            metadata: NotificationMetadata::for_job(job),
            created_at: Utc::now(),
        }
    }
}

fn noun_for(job_type: JobType) -> &'static str {
    match job_type {
        JobType::BatchIngest => "exam papers",
        JobType::BatchUpload => "documents",
    }
}

fn capitalized(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Interface implemented by notification sinks.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn emit(&self, notification: &Notification) -> Result<(), NotifyError>;
}
