//! Reconciliation of local job state with the indexing service.
//!
//! The service never calls back, so jobs parked in
//! `awaiting_external_confirmation` are polled until their pass reports a
//! terminal state. Every transition made here is a conditional update: a
//! job is only finalized, and only notified, by the caller that wins it.

use std::sync::Arc;
use std::time::Instant;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::broadcast::ProgressBroadcaster;
use crate::config::SchedulerConfig;
use crate::db::{item_repo, job_repo, run_repo, Database};
use crate::error::{IngestError, Result};
use crate::indexing::{IndexingClient, PassState};
use crate::model::{derive_job_status, now_rfc3339, IngestionJob, JobStatus};
use crate::notify::{Notification, Notifier};
use crate::ratelimit::RateLimiter;

use super::orchestrator::Orchestrator;
use super::{finalize_job, notify_job, Collaborators};

pub const CONFIRMATION_TASK: &str = "index_confirmation";
pub const HEALTH_TASK: &str = "health_check";

/// What one confirmation tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Awaiting jobs looked at.
    pub checked: u32,
    /// Jobs this tick moved to a terminal status.
    pub finalized: u32,
    pub still_running: u32,
    pub errors: u32,
    /// The tick did not run because the previous one was still going.
    pub skipped: bool,
    /// The indexing service throttled at least one call.
    pub throttled: bool,
}

/// What one health tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Awaiting jobs failed for waiting too long.
    pub timed_out: u32,
    /// Orphaned jobs handed back to the orchestrator.
    pub resumed: u32,
    pub skipped: bool,
}

enum Confirmation {
    Finalized,
    /// Someone else settled the job first.
    AlreadySettled,
    StillRunning,
}

pub struct Reconciler {
    db: Database,
    indexing: Arc<dyn IndexingClient>,
    notifier: Arc<dyn Notifier>,
    limiter: Arc<RateLimiter>,
    progress: ProgressBroadcaster,
    config: SchedulerConfig,
    index_ref: String,
    orchestrator: Option<Orchestrator>,
    /// Held for the whole tick so a slow tick is skipped, not overlapped.
    confirmation_lock: Mutex<()>,
    health_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        db: Database,
        collaborators: &Collaborators,
        limiter: Arc<RateLimiter>,
        progress: ProgressBroadcaster,
        config: SchedulerConfig,
        index_ref: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            indexing: Arc::clone(&collaborators.indexing),
            notifier: Arc::clone(&collaborators.notifier),
            limiter,
            progress,
            config,
            index_ref: index_ref.into(),
            orchestrator: None,
            confirmation_lock: Mutex::new(()),
            health_lock: Mutex::new(()),
            shutdown,
        }
    }

    /// Lets the health tick hand orphaned jobs back to `orchestrator`.
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Polls the pass of every awaiting job once and finalizes the ones
    /// whose pass has ended. Running it twice over the same external state
    /// changes nothing the second time.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let Ok(_guard) = self.confirmation_lock.try_lock() else {
            log::info!("Index confirmation skipped: previous run still in progress");
            self.record_skipped(CONFIRMATION_TASK);
            return Ok(ReconcileReport {
                skipped: true,
                ..Default::default()
            });
        };

        let started = Instant::now();
        let run_id = self.record_start(CONFIRMATION_TASK);
        let mut report = ReconcileReport::default();
        let result = self
            .confirm_awaiting(&mut report)
            .instrument(info_span!("index_confirmation"))
            .await;

        if !report.throttled && self.limiter.backoff_multiplier() > 1.0 {
            self.limiter.reset_to_defaults();
        }

        let message = format!(
            "checked {}, finalized {}, still running {}, errors {}",
            report.checked, report.finalized, report.still_running, report.errors
        );
        let error = result.as_ref().err().map(|e| e.to_string());
        self.record_finish(run_id, started, report.checked, &message, error.as_deref());
        if report.checked > 0 {
            log::info!("Index confirmation: {}", message);
        }

        result.map(|_| report)
    }

    /// Fails jobs that have waited on their pass for longer than
    /// `stale_after` and resumes orphaned jobs.
    pub async fn health_check_once(&self) -> Result<HealthReport> {
        let Ok(_guard) = self.health_lock.try_lock() else {
            log::info!("Health check skipped: previous run still in progress");
            self.record_skipped(HEALTH_TASK);
            return Ok(HealthReport {
                skipped: true,
                ..Default::default()
            });
        };

        let started = Instant::now();
        let run_id = self.record_start(HEALTH_TASK);
        let mut report = HealthReport::default();
        let result = self
            .check_health(&mut report)
            .instrument(info_span!("health_check"))
            .await;

        let message = format!(
            "timed out {}, resumed {}",
            report.timed_out, report.resumed
        );
        let error = result.as_ref().err().map(|e| e.to_string());
        self.record_finish(
            run_id,
            started,
            report.timed_out + report.resumed,
            &message,
            error.as_deref(),
        );

        result.map(|_| report)
    }

    async fn confirm_awaiting(&self, report: &mut ReconcileReport) -> Result<()> {
        let jobs = job_repo::list_by_status(&self.db, &[JobStatus::AwaitingExternalConfirmation])?;

        for row in jobs {
            if self.shutdown.is_cancelled() {
                log::info!("Shutdown requested, stopping index confirmation");
                break;
            }
            report.checked += 1;
            let job = IngestionJob::from(row);

            match self.confirm_job(&job).await {
                Ok(Confirmation::Finalized) => report.finalized += 1,
                Ok(Confirmation::AlreadySettled) => {}
                Ok(Confirmation::StillRunning) => report.still_running += 1,
                Err(e) => {
                    if matches!(&e, IngestError::Indexing(inner) if inner.is_throttled()) {
                        report.throttled = true;
                    }
                    report.errors += 1;
                    log::warn!("Failed to reconcile job {}: {}", job.id, e);
                }
            }
        }
        Ok(())
    }

    async fn confirm_job(&self, job: &IngestionJob) -> Result<Confirmation> {
        let Some(pass_id) = job.external_index_ref.as_deref() else {
            return self.start_missing_pass(job).await;
        };

        let pass = self.indexing.get_indexing_pass_status(pass_id).await?;
        match pass.decode() {
            PassState::InProgress => Ok(Confirmation::StillRunning),
            PassState::Unknown(raw) => {
                log::warn!(
                    "Indexing pass {} for job {} reported unrecognized state '{}', treating it as running",
                    pass_id,
                    job.id,
                    raw
                );
                Ok(Confirmation::StillRunning)
            }
            PassState::Succeeded => {
                let to = if job.completed_items == 0 {
                    JobStatus::Failed
                } else {
                    derive_job_status(job.completed_items, job.failed_items)
                };
                self.finalize(job, to, None).await
            }
            PassState::Failed => {
                let detail = pass
                    .detail
                    .unwrap_or_else(|| format!("pass {} reported failure", pass_id));
                self.fail_with_items(&job.id, &format!("Indexing failed: {}", detail))
                    .await
            }
            PassState::Cancelled => {
                self.finalize(job, JobStatus::Cancelled, Some("Indexing pass was cancelled"))
                    .await
            }
        }
    }

    /// The orchestrator could not start the pass; try again.
    async fn start_missing_pass(&self, job: &IngestionJob) -> Result<Confirmation> {
        let data_sources = item_repo::registered_data_sources(&self.db, &job.id)?;
        if data_sources.is_empty() {
            return self
                .finalize(job, JobStatus::Failed, Some("No registered data sources to index"))
                .await;
        }

        let pass_id = self
            .indexing
            .start_indexing_pass(&self.index_ref, &data_sources)
            .await?;
        if job_repo::set_external_ref(&self.db, &job.id, &pass_id, &now_rfc3339())? {
            log::info!("Started indexing pass {} for job {}", pass_id, job.id);
        }
        Ok(Confirmation::StillRunning)
    }

    async fn finalize(
        &self,
        job: &IngestionJob,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<Confirmation> {
        let won = finalize_job(
            &self.db,
            self.notifier.as_ref(),
            &self.progress,
            &job.id,
            JobStatus::AwaitingExternalConfirmation,
            to,
            error_message,
        )
        .await?;
        Ok(if won {
            Confirmation::Finalized
        } else {
            Confirmation::AlreadySettled
        })
    }

    /// Fails the job and every item that had completed. Their data sources
    /// never became searchable.
    async fn fail_with_items(&self, job_id: &str, message: &str) -> Result<Confirmation> {
        if !job_repo::fail_with_items(
            &self.db,
            job_id,
            JobStatus::AwaitingExternalConfirmation,
            message,
            &now_rfc3339(),
        )? {
            return Ok(Confirmation::AlreadySettled);
        }
        log::warn!("Job {} failed: {}", job_id, message);
        self.progress.job_status(job_id, JobStatus::Failed, message);
        notify_job(
            &self.db,
            self.notifier.as_ref(),
            job_id,
            Notification::job_finished,
        )
        .await;
        Ok(Confirmation::Finalized)
    }

    async fn check_health(&self, report: &mut HealthReport) -> Result<()> {
        let cutoff = i64::try_from(self.config.stale_after_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|age| Utc::now().checked_sub_signed(age));

        if let Some(cutoff) = cutoff {
            let jobs =
                job_repo::list_by_status(&self.db, &[JobStatus::AwaitingExternalConfirmation])?;
            let message = format!(
                "Timed out after {} waiting for the indexing pass",
                humanize_secs(self.config.stale_after_secs)
            );
            for row in jobs {
                if self.shutdown.is_cancelled() {
                    break;
                }
                let job = IngestionJob::from(row);
                if job.updated_at > cutoff {
                    continue;
                }
                if let Confirmation::Finalized = self.fail_with_items(&job.id, &message).await? {
                    report.timed_out += 1;
                }
            }
        }

        if let Some(orchestrator) = &self.orchestrator {
            if !self.shutdown.is_cancelled() {
                report.resumed = orchestrator.resume_interrupted().await? as u32;
            }
        }
        Ok(())
    }

    fn record_start(&self, task: &str) -> Option<i64> {
        match run_repo::start(&self.db, task, &now_rfc3339()) {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("Failed to record start of {} run: {}", task, e);
                None
            }
        }
    }

    fn record_finish(
        &self,
        run_id: Option<i64>,
        started: Instant,
        processed: u32,
        message: &str,
        error: Option<&str>,
    ) {
        let Some(run_id) = run_id else {
            return;
        };
        let duration_ms = started.elapsed().as_millis() as i64;
        if let Err(e) = run_repo::finish(
            &self.db,
            run_id,
            &now_rfc3339(),
            duration_ms,
            processed,
            Some(message),
            error,
        ) {
            log::warn!("Failed to record end of run {}: {}", run_id, e);
        }
    }

    fn record_skipped(&self, task: &str) {
        if let Err(e) = run_repo::record_skipped(&self.db, task, &now_rfc3339()) {
            log::warn!("Failed to record skipped {} run: {}", task, e);
        }
    }
}

fn humanize_secs(secs: u64) -> String {
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
