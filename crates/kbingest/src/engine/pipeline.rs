use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::broadcast::{ItemProgressTracker, ProgressBroadcaster};
use crate::db::{item_repo, Database, DatabaseError};
use crate::error::IndexingError;
use crate::fetch::{FetchedFile, SourceFetcher};
use crate::indexing::{DataSourceDescriptor, IndexingClient};
use crate::model::{now_rfc3339, IngestionItem, ItemStatus, JobType};
use crate::sanitize;
use crate::storage::{self, ObjectStorage};
use crate::validate::{PolicyLimits, Validator};

use super::error::PipelineError;
use super::Collaborators;

/// Attempts at writing an item's failure before the error is handed up.
const FAILURE_WRITE_ATTEMPTS: u32 = 3;
const FAILURE_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// How one pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed { data_source_id: String },
    /// The failure was recorded on the item.
    Failed(String),
    /// The item left the expected state under us (cancelled or reset).
    Skipped,
    /// Shutdown stopped the item between steps. It keeps its in-flight status
    /// and is picked up again by `Orchestrator::resume_interrupted`.
    Interrupted,
}

/// Drives a single item through fetch, validate, store and register.
///
/// Each step is persisted with a conditional update before it runs, so a
/// step only starts if the item is still where this run left it.
pub struct ItemPipeline {
    db: Database,
    fetcher: Arc<dyn SourceFetcher>,
    validator: Arc<dyn Validator>,
    storage: Arc<dyn ObjectStorage>,
    indexing: Arc<dyn IndexingClient>,
    progress: ProgressBroadcaster,
    index_ref: String,
    storage_prefix: String,
}

impl ItemPipeline {
    pub fn new(
        db: Database,
        collaborators: &Collaborators,
        progress: ProgressBroadcaster,
        index_ref: impl Into<String>,
        storage_prefix: impl Into<String>,
    ) -> Self {
        Self {
            db,
            fetcher: Arc::clone(&collaborators.fetcher),
            validator: Arc::clone(&collaborators.validator),
            storage: Arc::clone(&collaborators.storage),
            indexing: Arc::clone(&collaborators.indexing),
            progress,
            index_ref: index_ref.into(),
            storage_prefix: storage_prefix.into(),
        }
    }

    /// Runs the item to a terminal state. Item-level failures are recorded
    /// on the item and reported as [`ItemOutcome::Failed`]; only a failure to
    /// write item state comes back as an error.
    pub async fn run(
        &self,
        job_type: JobType,
        item: &IngestionItem,
        shutdown: &CancellationToken,
    ) -> Result<ItemOutcome, DatabaseError> {
        let span = info_span!("item_pipeline",
            job_id = %item.job_id,
            item_id = %item.id,
            source = %sanitize::redact_url(&item.source_url),
        );
        self.run_inner(job_type, item, shutdown).instrument(span).await
    }

    async fn run_inner(
        &self,
        job_type: JobType,
        item: &IngestionItem,
        shutdown: &CancellationToken,
    ) -> Result<ItemOutcome, DatabaseError> {
        let tracker = self.progress.track_item(&item.job_id, &item.id, &item.title);
        let mut stored_key = None;

        let error = match self
            .execute(job_type, item, &tracker, shutdown, &mut stored_key)
            .await
        {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };

        let message = error.to_string();
        warn!("Item {} failed: {}", item.id, message);
        if let Some(key) = stored_key {
            self.discard_object(&key).await;
        }
        self.record_failure(item, &message, &tracker).await
    }

    /// Writes the item's failure, retrying a few times before giving up.
    async fn record_failure(
        &self,
        item: &IngestionItem,
        message: &str,
        tracker: &ItemProgressTracker,
    ) -> Result<ItemOutcome, DatabaseError> {
        let mut attempt = 1;
        loop {
            match item_repo::fail(&self.db, &item.id, message, &now_rfc3339()) {
                Ok(true) => {
                    tracker.failed(message);
                    return Ok(ItemOutcome::Failed(message.to_string()));
                }
                Ok(false) => return Ok(ItemOutcome::Skipped),
                Err(e) if attempt < FAILURE_WRITE_ATTEMPTS => {
                    warn!(
                        "Could not record failure of item {} (attempt {}): {}",
                        item.id, attempt, e
                    );
                    attempt += 1;
                    tokio::time::sleep(FAILURE_WRITE_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute(
        &self,
        job_type: JobType,
        item: &IngestionItem,
        tracker: &ItemProgressTracker,
        shutdown: &CancellationToken,
        stored_key: &mut Option<String>,
    ) -> Result<ItemOutcome, PipelineError> {
        // Step 1: Fetch
        if !self.step(
            item,
            ItemStatus::Pending,
            ItemStatus::Fetching,
            tracker,
            "Fetching source",
        )? {
            return Ok(ItemOutcome::Skipped);
        }
        let file = self
            .fetcher
            .fetch(&item.source_url)
            .instrument(info_span!("fetch"))
            .await?;
        debug!("Fetched {} bytes for item {}", file.size(), item.id);
        if shutdown.is_cancelled() {
            return Ok(ItemOutcome::Interrupted);
        }

        // Step 2: Validate
        if !self.step(
            item,
            ItemStatus::Fetching,
            ItemStatus::Validating,
            tracker,
            "Validating file",
        )? {
            return Ok(ItemOutcome::Skipped);
        }
        let file = self
            .validate(file, PolicyLimits::for_job_type(job_type))
            .instrument(info_span!("validate"))
            .await?;
        if shutdown.is_cancelled() {
            return Ok(ItemOutcome::Interrupted);
        }

        // Step 3: Store
        if !self.step(
            item,
            ItemStatus::Validating,
            ItemStatus::Storing,
            tracker,
            "Storing file",
        )? {
            return Ok(ItemOutcome::Skipped);
        }
        let key = storage::object_key(
            &self.storage_prefix,
            &item.id,
            &item.title,
            chrono::Utc::now().timestamp(),
        );
        let content_type = storage::content_type_for(&key);
        let storage_url = self
            .storage
            .put(&key, file.bytes, &content_type)
            .instrument(info_span!("store", key = %key))
            .await?;
        *stored_key = Some(key.clone());
        item_repo::set_storage_url(&self.db, &item.id, &storage_url, &now_rfc3339())?;
        if shutdown.is_cancelled() {
            return Ok(ItemOutcome::Interrupted);
        }

        // Step 4: Register with the index
        if !self.step(
            item,
            ItemStatus::Storing,
            ItemStatus::Registering,
            tracker,
            "Registering with index",
        )? {
            return Ok(ItemOutcome::Skipped);
        }
        let descriptor = DataSourceDescriptor {
            item_id: item.id.clone(),
            title: item.title.clone(),
            item_type: item.item_type,
            object_key: key.clone(),
            storage_url,
        };
        let registered = self
            .indexing
            .register_data_source(&self.index_ref, &descriptor)
            .instrument(info_span!("register"))
            .await;
        let data_source_id = match registered {
            Ok(id) => id,
            // The limiter gave up because we are shutting down, not the service.
            Err(IndexingError::RateLimit(_)) if shutdown.is_cancelled() => {
                return Ok(ItemOutcome::Interrupted);
            }
            Err(e) => return Err(e.into()),
        };

        if !item_repo::complete(
            &self.db,
            &item.id,
            ItemStatus::Registering,
            &key,
            Some(&data_source_id),
            &now_rfc3339(),
        )? {
            return Ok(ItemOutcome::Skipped);
        }
        tracker.update(ItemStatus::Completed, "Registered with index");
        Ok(ItemOutcome::Completed { data_source_id })
    }

    fn step(
        &self,
        item: &IngestionItem,
        from: ItemStatus,
        to: ItemStatus,
        tracker: &ItemProgressTracker,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        let moved = item_repo::advance(&self.db, &item.id, from, to, &now_rfc3339())?;
        if moved {
            tracker.update(to, message);
        } else {
            debug!("Item {} is no longer {}, stopping", item.id, from);
        }
        Ok(moved)
    }

    /// PDF parsing is CPU bound, so it runs on the blocking pool.
    async fn validate(
        &self,
        file: FetchedFile,
        limits: PolicyLimits,
    ) -> Result<FetchedFile, PipelineError> {
        let validator = Arc::clone(&self.validator);
        let (file, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = validator.validate(&file, &limits);
            (file, outcome)
        })
        .await
        .map_err(|e| PipelineError::ValidatorPanicked(e.to_string()))?;

        if outcome.valid {
            Ok(file)
        } else {
            Err(PipelineError::Rejected(
                outcome
                    .error
                    .unwrap_or_else(|| "file was rejected".to_string()),
            ))
        }
    }

    async fn discard_object(&self, key: &str) {
        if let Err(e) = self.storage.delete(key).await {
            warn!("Failed to remove unregistered object {}: {}", key, e);
        }
    }
}
