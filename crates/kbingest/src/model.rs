//! Job and item records, their status sets and the derived job status law.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::item_repo::ItemRow;
use crate::db::job_repo::JobRow;

/// Largest batch a single job may carry.
pub const MAX_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Files uploaded by a user.
    BatchUpload,
    /// Papers discovered by the crawler.
    BatchIngest,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::BatchUpload => "batch_upload",
            JobType::BatchIngest => "batch_ingest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "batch_upload" => Some(JobType::BatchUpload),
            "batch_ingest" => Some(JobType::BatchIngest),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Document,
    ExamPaper,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Document => "document",
            ItemType::ExamPaper => "exam_paper",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document" => Some(ItemType::Document),
            "exam_paper" => Some(ItemType::ExamPaper),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    AwaitingExternalConfirmation,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::AwaitingExternalConfirmation => "awaiting_external_confirmation",
            JobStatus::Completed => "completed",
            JobStatus::PartiallyCompleted => "partially_completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parses a persisted status. Unrecognized values are never assumed
    /// successful.
    pub fn parse(s: &str, job_id: &str) -> Self {
        match s {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "awaiting_external_confirmation" => JobStatus::AwaitingExternalConfirmation,
            "completed" => JobStatus::Completed,
            "partially_completed" => JobStatus::PartiallyCompleted,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            other => {
                log::warn!(
                    "Unknown job status '{}' for job {}, treating as failed",
                    other,
                    job_id
                );
                JobStatus::Failed
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::PartiallyCompleted
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Fetching,
    Validating,
    Storing,
    Registering,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Fetching => "fetching",
            ItemStatus::Validating => "validating",
            ItemStatus::Storing => "storing",
            ItemStatus::Registering => "registering",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str, item_id: &str) -> Self {
        match s {
            "pending" => ItemStatus::Pending,
            "fetching" => ItemStatus::Fetching,
            "validating" => ItemStatus::Validating,
            "storing" => ItemStatus::Storing,
            "registering" => ItemStatus::Registering,
            "completed" => ItemStatus::Completed,
            "failed" => ItemStatus::Failed,
            "cancelled" => ItemStatus::Cancelled,
            other => {
                log::warn!(
                    "Unknown item status '{}' for item {}, treating as failed",
                    other,
                    item_id
                );
                ItemStatus::Failed
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }

    /// True for the pipeline steps between `pending` and a terminal state.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ItemStatus::Fetching
                | ItemStatus::Validating
                | ItemStatus::Storing
                | ItemStatus::Registering
        )
    }

    /// Position in the forward pipeline order. Terminal states rank last so a
    /// transition into them is always forward.
    fn rank(&self) -> u8 {
        match self {
            ItemStatus::Pending => 0,
            ItemStatus::Fetching => 1,
            ItemStatus::Validating => 2,
            ItemStatus::Storing => 3,
            ItemStatus::Registering => 4,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Cancelled => 5,
        }
    }

    /// Whether the pipeline may move an item from `self` to `next`.
    /// Resetting to `pending` goes through the explicit retry path instead.
    pub fn can_advance_to(&self, next: ItemStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ItemStatus::Cancelled => *self == ItemStatus::Pending,
            ItemStatus::Failed => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final job status from item counters.
///
/// `failed == 0` yields completed, both counters positive yields partially
/// completed, and nothing completed yields failed. Cancelled items count
/// toward neither counter.
pub fn derive_job_status(completed: u32, failed: u32) -> JobStatus {
    match (completed, failed) {
        (_, 0) => JobStatus::Completed,
        (0, _) => JobStatus::Failed,
        _ => JobStatus::PartiallyCompleted,
    }
}

/// Percentage of resolved items, rounded down.
pub fn progress_percent(total: u32, completed: u32, failed: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    ((completed + failed) * 100) / total
}

/// A batch ingestion job as seen by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionJob {
    pub id: String,
    pub job_type: JobType,
    pub owner_id: String,
    pub status: JobStatus,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_index_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub retired: bool,
}

impl IngestionJob {
    pub fn progress(&self) -> u32 {
        progress_percent(self.total_items, self.completed_items, self.failed_items)
    }
}

impl From<JobRow> for IngestionJob {
    fn from(row: JobRow) -> Self {
        let job_type = JobType::parse(&row.job_type).unwrap_or_else(|| {
            log::warn!(
                "Unknown job type '{}' for job {}, defaulting to batch_upload",
                row.job_type,
                row.id
            );
            JobType::BatchUpload
        });
        Self {
            status: JobStatus::parse(&row.status, &row.id),
            job_type,
            owner_id: row.owner_id,
            total_items: row.total_items,
            completed_items: row.completed_items,
            failed_items: row.failed_items,
            external_index_ref: row.external_index_ref,
            error_message: row.error_message,
            created_at: parse_timestamp(&row.created_at),
            started_at: row.started_at.as_deref().map(parse_timestamp),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            updated_at: parse_timestamp(&row.updated_at),
            retired: row.retired,
            id: row.id,
        }
    }
}

/// One file or paper inside a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionItem {
    pub id: String,
    pub job_id: String,
    pub item_type: ItemType,
    pub source_url: String,
    pub title: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_entity_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<ItemRow> for IngestionItem {
    fn from(row: ItemRow) -> Self {
        let item_type = ItemType::parse(&row.item_type).unwrap_or_else(|| {
            log::warn!(
                "Unknown item type '{}' for item {}, defaulting to document",
                row.item_type,
                row.id
            );
            ItemType::Document
        });
        Self {
            status: ItemStatus::parse(&row.status, &row.id),
            item_type,
            job_id: row.job_id,
            source_url: row.source_url,
            title: row.title,
            created_entity_ref: row.created_entity_ref,
            storage_url: row.storage_url,
            data_source_id: row.data_source_id,
            subject_ref: row.subject_ref,
            year: row.year,
            month: row.month,
            exam_type: row.exam_type,
            error_message: row.error_message,
            created_at: parse_timestamp(&row.created_at),
            started_at: row.started_at.as_deref().map(parse_timestamp),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            updated_at: parse_timestamp(&row.updated_at),
            id: row.id,
        }
    }
}

/// A job together with all of its items, read in one consistent snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: IngestionJob,
    pub progress: u32,
    pub items: Vec<IngestionItem>,
}

/// One entry of a `StartJob` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRequest {
    pub item_type: ItemType,
    pub source_url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_type: Option<String>,
}

impl ItemRequest {
    pub fn document(source_url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            item_type: ItemType::Document,
            source_url: source_url.into(),
            title: title.into(),
            subject_ref: None,
            year: None,
            month: None,
            exam_type: None,
        }
    }
}

/// Returned by `StartJob` before any item has been processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub total_items: u32,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("Failed to parse timestamp '{}': {}", s, e);
            DateTime::<Utc>::UNIX_EPOCH
        })
}
