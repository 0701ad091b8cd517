//! Job orchestration: accepting batches, fanning items out to the pipeline
//! and settling the job once every item has resolved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::broadcast::ProgressBroadcaster;
use crate::candidates::{Candidate, CandidateFilter, CandidateProvider};
use crate::config::EngineConfig;
use crate::db::item_repo::{self, ItemRow};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{Database, DatabaseError};
use crate::error::{IngestError, Result};
use crate::indexing::IndexingClient;
use crate::model::{
    derive_job_status, now_rfc3339, IngestionItem, IngestionJob, ItemRequest, ItemStatus,
    JobReceipt, JobSnapshot, JobStatus, JobType, MAX_BATCH_SIZE,
};
use crate::notify::{Notification, Notifier};

use super::pipeline::ItemPipeline;
use super::{finalize_job, notify_job, Caller, Collaborators};

const NO_ITEMS_COMPLETED: &str = "No items completed successfully";

/// Filter for [`Orchestrator::list_jobs`].
#[derive(Debug, Default, Clone)]
pub struct ListJobsFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// In-memory state for a job this process is driving.
struct JobHandle {
    /// Stops items that are still waiting for a pipeline slot.
    cancel: CancellationToken,
    /// Serializes finalization attempts from the job's item tasks.
    finalize_lock: tokio::sync::Mutex<()>,
    /// Item tasks spawned under this handle that have not returned.
    in_flight: AtomicUsize,
    /// Set when an item's state could not be written. The handle is dropped
    /// once the job's tasks drain so the health check can resume the job.
    stalled: AtomicBool,
}

impl JobHandle {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            finalize_lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
        }
    }

    fn is_stale(&self) -> bool {
        self.cancel.is_cancelled() || self.stalled.load(Ordering::SeqCst)
    }
}

struct Inner {
    db: Database,
    pipeline: ItemPipeline,
    indexing: Arc<dyn IndexingClient>,
    notifier: Arc<dyn Notifier>,
    progress: ProgressBroadcaster,
    config: EngineConfig,
    index_ref: String,
    /// Bounds in-flight pipelines across all jobs.
    permits: Arc<Semaphore>,
    active: Mutex<HashMap<String, Arc<JobHandle>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Accepts jobs and drives their items through the [`ItemPipeline`].
///
/// Every item runs as its own task; the last one to resolve settles the job.
/// Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        collaborators: Collaborators,
        progress: ProgressBroadcaster,
        config: EngineConfig,
        index_ref: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let index_ref = index_ref.into();
        let pipeline = ItemPipeline::new(
            db.clone(),
            &collaborators,
            progress.clone(),
            index_ref.clone(),
            config.storage_prefix.clone(),
        );
        let permits = Arc::new(Semaphore::new(config.max_concurrent_items.max(1)));

        Self {
            inner: Arc::new(Inner {
                db,
                pipeline,
                indexing: collaborators.indexing,
                notifier: collaborators.notifier,
                progress,
                config,
                index_ref,
                permits,
                active: Mutex::new(HashMap::new()),
                shutdown,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn progress(&self) -> &ProgressBroadcaster {
        &self.inner.progress
    }

    /// Persists the job and its items, then starts processing in the
    /// background. Returns before any item has run.
    pub async fn start_job(
        &self,
        caller: &Caller,
        job_type: JobType,
        items: Vec<ItemRequest>,
    ) -> Result<JobReceipt> {
        self.check_batch(&items)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(IngestError::Validation(
                "engine is shutting down, not accepting jobs".to_string(),
            ));
        }

        let job_id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let total_items = items.len() as u32;

        let job = JobRow {
            id: job_id.clone(),
            job_type: job_type.as_str().to_string(),
            owner_id: caller.id.clone(),
            status: JobStatus::Pending.as_str().to_string(),
            total_items,
            completed_items: 0,
            failed_items: 0,
            external_index_ref: None,
            error_message: None,
            created_at: now.clone(),
            started_at: None,
            completed_at: None,
            updated_at: now.clone(),
            retired: false,
        };
        let rows: Vec<ItemRow> = items
            .into_iter()
            .map(|request| ItemRow {
                id: Uuid::new_v4().to_string(),
                job_id: job_id.clone(),
                item_type: request.item_type.as_str().to_string(),
                source_url: request.source_url.trim().to_string(),
                title: request.title.trim().to_string(),
                status: ItemStatus::Pending.as_str().to_string(),
                created_entity_ref: None,
                storage_url: None,
                data_source_id: None,
                subject_ref: request.subject_ref,
                year: request.year,
                month: request.month,
                exam_type: request.exam_type,
                error_message: None,
                created_at: now.clone(),
                started_at: None,
                completed_at: None,
                updated_at: now.clone(),
            })
            .collect();

        // Registered before the rows exist so a concurrent resume never
        // sees the job undriven.
        let handle = self.renew_handle(&job_id);
        if let Err(e) = job_repo::insert_with_items(&self.inner.db, &job, &rows) {
            self.release(&job_id, &handle);
            return Err(e.into());
        }
        log::info!(
            "Accepted {} job {} with {} items for {}",
            job_type,
            job_id,
            total_items,
            caller.id
        );
        self.inner
            .progress
            .job_status(&job_id, JobStatus::Pending, "Job accepted");

        self.drive(job_id.clone(), job_type, handle);

        Ok(JobReceipt {
            job_id,
            status: JobStatus::Pending,
            total_items,
        })
    }

    /// Searches `provider` and starts a `batch_ingest` job over the matches,
    /// truncated to the batch cap.
    pub async fn start_from_candidates(
        &self,
        caller: &Caller,
        provider: &dyn CandidateProvider,
        filter: &CandidateFilter,
    ) -> Result<JobReceipt> {
        let candidates = provider.search(filter).await?;
        if candidates.is_empty() {
            return Err(IngestError::Validation(
                "no candidates matched the filter".to_string(),
            ));
        }
        let items: Vec<ItemRequest> = candidates
            .into_iter()
            .take(self.batch_cap())
            .map(Candidate::into_item_request)
            .collect();
        self.start_job(caller, JobType::BatchIngest, items).await
    }

    /// Reads the job and all of its items in one snapshot.
    pub fn get_job_status(&self, job_id: &str, caller: &Caller) -> Result<JobSnapshot> {
        let Some((job, items)) = job_repo::snapshot(&self.inner.db, job_id)? else {
            return Err(IngestError::not_found("Job", job_id));
        };
        authorize(caller, &job)?;

        let job = IngestionJob::from(job);
        Ok(JobSnapshot {
            progress: job.progress(),
            items: items.into_iter().map(IngestionItem::from).collect(),
            job,
        })
    }

    /// Lists the caller's jobs, newest first. Privileged callers see every
    /// owner's jobs. Retired jobs are left out.
    pub fn list_jobs(
        &self,
        caller: &Caller,
        filter: &ListJobsFilter,
    ) -> Result<(Vec<IngestionJob>, u64)> {
        let query = JobFilter {
            owner_id: (!caller.privileged).then(|| caller.id.clone()),
            status: filter.status.map(|s| s.as_str().to_string()),
            include_retired: false,
            limit: filter.limit,
            offset: filter.offset,
        };
        let (rows, total) = job_repo::query(&self.inner.db, &query)?;
        Ok((rows.into_iter().map(IngestionJob::from).collect(), total))
    }

    /// Cancels pending items and lets in-flight ones finish. Returns the job
    /// status right after the request was applied.
    pub async fn cancel_job(&self, job_id: &str, caller: &Caller) -> Result<JobStatus> {
        let job = self.load_job(job_id, caller)?;
        if job.status.is_terminal() {
            return Err(IngestError::Validation(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        if job.status == JobStatus::AwaitingExternalConfirmation {
            finalize_job(
                &self.inner.db,
                self.inner.notifier.as_ref(),
                &self.inner.progress,
                job_id,
                JobStatus::AwaitingExternalConfirmation,
                JobStatus::Cancelled,
                Some("Cancelled by user"),
            )
            .await?;
            return self.current_status(job_id);
        }

        let cancelled = item_repo::cancel_pending(&self.inner.db, job_id, &now_rfc3339())?;
        if let Some(handle) = self.active().get(job_id) {
            handle.cancel.cancel();
        }
        log::info!(
            "Cancellation requested for job {} by {} ({} pending items cancelled)",
            job_id,
            caller.id,
            cancelled
        );
        self.inner
            .progress
            .job_status(job_id, job.status, "Cancellation requested");

        self.finalize_if_resolved(job_id).await;
        self.current_status(job_id)
    }

    /// Resets a failed or cancelled item and runs it again. The job goes back
    /// to `processing` until the item resolves.
    pub async fn retry_item(&self, job_id: &str, item_id: &str, caller: &Caller) -> Result<()> {
        let job = self.load_job(job_id, caller)?;
        if job.retired {
            return Err(IngestError::Validation(format!(
                "job {} is retired",
                job_id
            )));
        }
        if !job.status.is_terminal() && job.status != JobStatus::AwaitingExternalConfirmation {
            return Err(IngestError::Validation(format!(
                "job {} is still {}, items can be retried once it settles",
                job_id, job.status
            )));
        }

        let item = self.load_item(job_id, item_id)?;
        if !matches!(item.status, ItemStatus::Failed | ItemStatus::Cancelled) {
            return Err(IngestError::Validation(format!(
                "item {} is {}, only failed or cancelled items can be retried",
                item_id, item.status
            )));
        }

        if !item_repo::reset_for_retry(&self.inner.db, item_id, &now_rfc3339())? {
            return Err(IngestError::Validation(format!(
                "item {} changed state while being retried",
                item_id
            )));
        }
        log::info!("Retrying item {} of job {} for {}", item_id, job_id, caller.id);
        self.inner
            .progress
            .job_status(job_id, JobStatus::Processing, "Retrying item");

        let item = self.load_item(job_id, item_id)?;
        let handle = self.renew_handle(job_id);
        self.spawn_item(job.job_type, item, handle);
        Ok(())
    }

    /// Soft-retires a terminal job.
    pub fn retire_job(&self, job_id: &str, caller: &Caller) -> Result<()> {
        let job = self.load_job(job_id, caller)?;
        if !job.status.is_terminal() {
            return Err(IngestError::Validation(format!(
                "job {} is {}, only finished jobs can be retired",
                job_id, job.status
            )));
        }
        if !job_repo::retire(&self.inner.db, job_id, &now_rfc3339())? {
            return Err(IngestError::Validation(format!(
                "job {} is already retired",
                job_id
            )));
        }
        log::info!("Retired job {}", job_id);
        Ok(())
    }

    /// Picks up `pending`/`processing` jobs nobody in this process is
    /// driving, typically after a restart. Items stuck mid-pipeline go back
    /// to `pending` and the job is driven again. Returns how many jobs were
    /// resumed.
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let jobs = job_repo::list_by_status(
            &self.inner.db,
            &[JobStatus::Pending, JobStatus::Processing],
        )?;

        let mut resumed = 0;
        for row in jobs {
            let Some(handle) = self.claim(&row.id) else {
                continue;
            };
            let job = IngestionJob::from(row);
            let reset = match self.reset_for_resume(&job.id) {
                Ok(reset) => reset,
                Err(e) => {
                    self.release(&job.id, &handle);
                    return Err(e.into());
                }
            };
            log::info!(
                "Resuming job {} ({} interrupted items reset)",
                job.id,
                reset
            );
            self.drive(job.id, job.job_type, handle);
            resumed += 1;
        }
        Ok(resumed)
    }

    fn reset_for_resume(&self, job_id: &str) -> std::result::Result<usize, DatabaseError> {
        let db = &self.inner.db;
        let now = now_rfc3339();
        let reset = item_repo::reset_interrupted(db, job_id, &now)?;
        // A cancelled item means cancellation was requested before the restart.
        if item_repo::counts(db, job_id)?.cancelled > 0 {
            item_repo::cancel_pending(db, job_id, &now)?;
        }
        Ok(reset)
    }

    /// Whether this process currently holds the job's in-memory state.
    pub fn is_driving(&self, job_id: &str) -> bool {
        self.active().contains_key(job_id)
    }

    /// Waits until every job and item task spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Stops scheduling new work and waits for running tasks. Items
    /// interrupted between steps are resumed on the next start.
    pub async fn shutdown(&self) {
        log::info!("Shutting down orchestrator");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    fn batch_cap(&self) -> usize {
        self.inner.config.batch_cap.clamp(1, MAX_BATCH_SIZE)
    }

    fn check_batch(&self, items: &[ItemRequest]) -> Result<()> {
        if items.is_empty() {
            return Err(IngestError::Validation(
                "a job needs at least one item".to_string(),
            ));
        }
        let cap = self.batch_cap();
        if items.len() > cap {
            return Err(IngestError::Validation(format!(
                "batch has {} items, the limit is {}",
                items.len(),
                cap
            )));
        }
        for (index, item) in items.iter().enumerate() {
            if item.source_url.trim().is_empty() {
                return Err(IngestError::Validation(format!(
                    "item {} has no source URL",
                    index
                )));
            }
            if item.title.trim().is_empty() {
                return Err(IngestError::Validation(format!(
                    "item {} has no title",
                    index
                )));
            }
        }
        Ok(())
    }

    fn load_job(&self, job_id: &str, caller: &Caller) -> Result<IngestionJob> {
        let Some(job) = job_repo::find_by_id(&self.inner.db, job_id)? else {
            return Err(IngestError::not_found("Job", job_id));
        };
        authorize(caller, &job)?;
        Ok(IngestionJob::from(job))
    }

    fn load_item(&self, job_id: &str, item_id: &str) -> Result<IngestionItem> {
        item_repo::find_by_id(&self.inner.db, item_id)?
            .filter(|item| item.job_id == job_id)
            .map(IngestionItem::from)
            .ok_or_else(|| IngestError::not_found("Item", item_id))
    }

    fn current_status(&self, job_id: &str) -> Result<JobStatus> {
        job_repo::find_by_id(&self.inner.db, job_id)?
            .map(|row| JobStatus::parse(&row.status, &row.id))
            .ok_or_else(|| IngestError::not_found("Job", job_id))
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, Arc<JobHandle>>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a handle for a job nobody is driving. `None` if one
    /// already exists.
    fn claim(&self, job_id: &str) -> Option<Arc<JobHandle>> {
        let mut active = self.active();
        if active.contains_key(job_id) {
            return None;
        }
        let handle = Arc::new(JobHandle::new());
        active.insert(job_id.to_string(), Arc::clone(&handle));
        Some(handle)
    }

    /// Returns the job's handle, replacing one left cancelled or stalled by
    /// an earlier run.
    fn renew_handle(&self, job_id: &str) -> Arc<JobHandle> {
        let mut active = self.active();
        let handle = active
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobHandle::new()));
        if handle.is_stale() {
            *handle = Arc::new(JobHandle::new());
        }
        Arc::clone(handle)
    }

    fn release(&self, job_id: &str, handle: &Arc<JobHandle>) {
        let mut active = self.active();
        if active
            .get(job_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            active.remove(job_id);
        }
    }

    fn drive(&self, job_id: String, job_type: JobType, handle: Arc<JobHandle>) {
        let this = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = this.run_job(&job_id, job_type, &handle).await {
                log::error!("Failed to drive job {}: {}", job_id, e);
                if handle.in_flight.load(Ordering::SeqCst) == 0 {
                    this.release(&job_id, &handle);
                }
            }
        });
    }

    async fn run_job(
        &self,
        job_id: &str,
        job_type: JobType,
        handle: &Arc<JobHandle>,
    ) -> std::result::Result<(), DatabaseError> {
        let db = &self.inner.db;
        if job_repo::transition(
            db,
            job_id,
            &[JobStatus::Pending],
            JobStatus::Processing,
            &now_rfc3339(),
        )? {
            self.inner
                .progress
                .job_status(job_id, JobStatus::Processing, "Processing items");
        }

        let pending: Vec<IngestionItem> = item_repo::list_for_job(db, job_id)?
            .into_iter()
            .map(IngestionItem::from)
            .filter(|item| item.status == ItemStatus::Pending)
            .collect();

        if pending.is_empty() {
            self.finalize_if_resolved(job_id).await;
            return Ok(());
        }
        log::debug!("Job {}: scheduling {} items", job_id, pending.len());
        for item in pending {
            self.spawn_item(job_type, item, Arc::clone(handle));
        }
        Ok(())
    }

    fn spawn_item(&self, job_type: JobType, item: IngestionItem, handle: Arc<JobHandle>) {
        handle.in_flight.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        self.inner.tasks.spawn(async move {
            if !this.process_item(job_type, &item, &handle).await {
                handle.stalled.store(true, Ordering::SeqCst);
            }
            let drained = handle.in_flight.fetch_sub(1, Ordering::SeqCst) == 1;
            this.finalize_if_resolved(&item.job_id).await;

            if drained && handle.stalled.load(Ordering::SeqCst) {
                log::warn!(
                    "Job {} has items stuck after store errors, leaving it for the health check",
                    item.job_id
                );
                this.release(&item.job_id, &handle);
            }
        });
    }

    /// Returns `false` when the item's state could not be written.
    async fn process_item(
        &self,
        job_type: JobType,
        item: &IngestionItem,
        handle: &JobHandle,
    ) -> bool {
        let permit = tokio::select! {
            permit = Arc::clone(&self.inner.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return true,
            },
            _ = handle.cancel.cancelled() => return true,
            _ = self.inner.shutdown.cancelled() => return true,
        };
        if handle.cancel.is_cancelled() || self.inner.shutdown.is_cancelled() {
            return true;
        }

        let recorded = match self
            .inner
            .pipeline
            .run(job_type, item, &self.inner.shutdown)
            .await
        {
            Ok(outcome) => {
                log::debug!("Item {} finished: {:?}", item.id, outcome);
                true
            }
            Err(e) => {
                log::error!("Failed to record progress for item {}: {}", item.id, e);
                false
            }
        };
        drop(permit);
        recorded
    }

    async fn finalize_if_resolved(&self, job_id: &str) {
        if let Err(e) = self.try_finalize(job_id).await {
            log::error!("Failed to settle job {}: {}", job_id, e);
        }
    }

    async fn try_finalize(&self, job_id: &str) -> std::result::Result<(), DatabaseError> {
        // Jobs this process is not driving settle without registering a handle.
        let handle = self
            .active()
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(JobHandle::new()));
        let _guard = handle.finalize_lock.lock().await;

        let db = &self.inner.db;
        let counts = item_repo::counts(db, job_id)?;
        if !counts.all_resolved() {
            return Ok(());
        }
        let job = match job_repo::find_by_id(db, job_id)? {
            Some(row) => IngestionJob::from(row),
            None => {
                self.release(job_id, &handle);
                return Ok(());
            }
        };

        if matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
            let (to, error) = if counts.cancelled > 0 {
                (Some(JobStatus::Cancelled), None)
            } else if counts.completed == 0 {
                (Some(JobStatus::Failed), Some(NO_ITEMS_COMPLETED))
            } else if !self.inner.config.require_index_confirmation {
                (
                    Some(derive_job_status(job.completed_items, job.failed_items)),
                    None,
                )
            } else {
                (None, None)
            };

            match to {
                Some(to) => {
                    finalize_job(
                        db,
                        self.inner.notifier.as_ref(),
                        &self.inner.progress,
                        job_id,
                        job.status,
                        to,
                        error,
                    )
                    .await?;
                }
                None => self.await_indexing(&job).await?,
            }
        }

        self.release(job_id, &handle);
        Ok(())
    }

    /// Starts the indexing pass over every registered data source and parks
    /// the job until the reconciler sees the pass finish. A pass that fails
    /// to start is retried by the reconciler.
    async fn await_indexing(&self, job: &IngestionJob) -> std::result::Result<(), DatabaseError> {
        let db = &self.inner.db;
        if job.status == JobStatus::Pending {
            job_repo::transition(
                db,
                &job.id,
                &[JobStatus::Pending],
                JobStatus::Processing,
                &now_rfc3339(),
            )?;
        }

        let data_sources = item_repo::registered_data_sources(db, &job.id)?;
        let pass_id = if data_sources.is_empty() {
            None
        } else {
            match self
                .inner
                .indexing
                .start_indexing_pass(&self.inner.index_ref, &data_sources)
                .instrument(info_span!("start_indexing_pass", job_id = %job.id))
                .await
            {
                Ok(pass_id) => Some(pass_id),
                Err(e) => {
                    log::warn!(
                        "Could not start indexing pass for job {}, will retry: {}",
                        job.id,
                        e
                    );
                    None
                }
            }
        };

        if job_repo::mark_awaiting(db, &job.id, pass_id.as_deref(), &now_rfc3339())? {
            log::info!(
                "Job {} awaiting indexing pass {}",
                job.id,
                pass_id.as_deref().unwrap_or("(not started)")
            );
            self.inner.progress.job_status(
                &job.id,
                JobStatus::AwaitingExternalConfirmation,
                "Waiting for the indexing pass",
            );
            notify_job(db, self.inner.notifier.as_ref(), &job.id, |job| {
                Some(Notification::awaiting_confirmation(job))
            })
            .await;
        }
        Ok(())
    }
}

fn authorize(caller: &Caller, job: &JobRow) -> Result<()> {
    if caller.can_access(&job.owner_id) {
        Ok(())
    } else {
        Err(IngestError::Forbidden {
            job_id: job.id.clone(),
            caller: caller.id.clone(),
        })
    }
}
