//! The ingestion job engine.
//!
//! [`Orchestrator`] accepts batches and drives every item through the
//! [`ItemPipeline`]. [`Reconciler`] polls the indexing service for jobs that
//! wait on an external pass, and [`ReconcileScheduler`] runs it on a timer.

use std::sync::Arc;

use crate::broadcast::ProgressBroadcaster;
use crate::db::{job_repo, Database, DatabaseError};
use crate::fetch::SourceFetcher;
use crate::indexing::IndexingClient;
use crate::model::{now_rfc3339, IngestionJob, JobStatus};
use crate::notify::{Notification, Notifier};
use crate::storage::ObjectStorage;
use crate::validate::Validator;

pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod reconciler;
pub mod scheduler;

pub use error::PipelineError;
pub use orchestrator::{ListJobsFilter, Orchestrator};
pub use pipeline::{ItemOutcome, ItemPipeline};
pub use reconciler::{HealthReport, ReconcileReport, Reconciler};
pub use scheduler::ReconcileScheduler;

/// External collaborators the engine talks to. `indexing` is expected to be
/// rate limited already (see [`crate::indexing::RateLimitedIndexing`]).
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub validator: Arc<dyn Validator>,
    pub storage: Arc<dyn ObjectStorage>,
    pub indexing: Arc<dyn IndexingClient>,
    pub notifier: Arc<dyn Notifier>,
}

/// Who is calling a job operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    /// Privileged callers may read and act on jobs they do not own.
    pub privileged: bool,
}

impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privileged: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            privileged: true,
        }
    }

    pub fn can_access(&self, owner_id: &str) -> bool {
        self.privileged || self.id == owner_id
    }
}

/// Re-reads the job and emits the notification `build` produces for it.
/// Failures are logged; a notification never undoes a transition.
pub(crate) async fn notify_job<F>(db: &Database, notifier: &dyn Notifier, job_id: &str, build: F)
where
    F: FnOnce(&IngestionJob) -> Option<Notification>,
{
    let job = match job_repo::find_by_id(db, job_id) {
        Ok(Some(row)) => IngestionJob::from(row),
        Ok(None) => {
            log::warn!("Job {} vanished before it could be notified", job_id);
            return;
        }
        Err(e) => {
            log::error!("Failed to load job {} for notification: {}", job_id, e);
            return;
        }
    };
    let Some(notification) = build(&job) else {
        return;
    };
    if let Err(e) = notifier.emit(&notification).await {
        log::warn!(
            "Failed to emit '{}' notification for job {}: {}",
            notification.kind.as_str(),
            job_id,
            e
        );
    }
}

/// Moves a job from `from` into the terminal status `to`. The caller whose
/// update wins broadcasts the change and sends the one notification for it.
pub(crate) async fn finalize_job(
    db: &Database,
    notifier: &dyn Notifier,
    progress: &ProgressBroadcaster,
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
    error_message: Option<&str>,
) -> Result<bool, DatabaseError> {
    if !job_repo::finalize(db, job_id, from, to, error_message, &now_rfc3339())? {
        log::debug!("Job {} already left {}, not finalizing as {}", job_id, from, to);
        return Ok(false);
    }
    log::info!("Job {} finished as {}", job_id, to);
    progress.job_status(job_id, to, error_message.unwrap_or("Job finished"));
    notify_job(db, notifier, job_id, Notification::job_finished).await;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_access() {
        assert!(Caller::user("u1").can_access("u1"));
        assert!(!Caller::user("u2").can_access("u1"));
        assert!(Caller::admin("ops").can_access("u1"));
    }
}
