//! Test harness wiring an orchestrator and reconciler to in-memory fakes.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kbingest::config::{EngineConfig, SchedulerConfig};
use kbingest::engine::{Collaborators, Orchestrator, Reconciler};
use kbingest::indexing::RateLimitedIndexing;
use kbingest::ratelimit::{PoolConfig, RateLimitConfig};
use kbingest::storage::MemoryObjectStorage;
use kbingest::validate::PdfValidator;
use kbingest::{
    Caller, Database, ItemRequest, JobReceipt, JobSnapshot, JobStatus, JobType,
    ProgressBroadcaster, RateLimiter, ReconcileReport,
};

use super::fakes::{pdf_bytes, MapFetcher, RecordingNotifier, ScriptedIndex};

pub const INDEX_REF: &str = "kb-test";
pub const OWNER: &str = "user-1";

/// Pools fast enough that tests never wait on a token.
fn fast_pools() -> RateLimitConfig {
    let fast = PoolConfig {
        burst: 1000,
        refill_per_sec: 1000.0,
        min_interval_ms: 0,
    };
    RateLimitConfig {
        general: fast,
        restricted: fast,
    }
}

/// Builder for a [`TestHarness`].
pub struct HarnessBuilder {
    engine: EngineConfig,
    scheduler: SchedulerConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            engine: EngineConfig {
                max_concurrent_items: 4,
                ..EngineConfig::default()
            },
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Jobs settle as soon as their items resolve.
    pub fn without_confirmation(mut self) -> Self {
        self.engine.require_index_confirmation = false;
        self
    }

    pub fn max_concurrent_items(mut self, n: usize) -> Self {
        self.engine.max_concurrent_items = n;
        self
    }

    pub fn batch_cap(mut self, cap: usize) -> Self {
        self.engine.batch_cap = cap;
        self
    }

    pub fn stale_after_secs(mut self, secs: u64) -> Self {
        self.scheduler.stale_after_secs = secs;
        self
    }

    pub fn build(self) -> TestHarness {
        TestHarness::with_config(self.engine, self.scheduler, Database::open_in_memory())
    }

    /// Builds on top of an existing database, as a restarted process would.
    pub fn build_on(self, db: Database) -> TestHarness {
        TestHarness::with_config(self.engine, self.scheduler, Ok(db))
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TestHarness {
    pub db: Database,
    pub fetcher: Arc<MapFetcher>,
    pub index: Arc<ScriptedIndex>,
    pub notifier: Arc<RecordingNotifier>,
    pub storage: Arc<MemoryObjectStorage>,
    pub limiter: Arc<RateLimiter>,
    pub orchestrator: Orchestrator,
    pub reconciler: Reconciler,
    pub shutdown: CancellationToken,
    pub owner: Caller,
    pub admin: Caller,
}

impl TestHarness {
    pub fn new() -> Self {
        HarnessBuilder::new().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    fn with_config(
        engine: EngineConfig,
        scheduler: SchedulerConfig,
        db: Result<Database, kbingest::db::DatabaseError>,
    ) -> Self {
        let db = db.expect("Failed to open test database");
        let shutdown = CancellationToken::new();
        let fetcher = Arc::new(MapFetcher::default());
        let index = Arc::new(ScriptedIndex::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let storage = Arc::new(MemoryObjectStorage::new());
        let limiter = Arc::new(RateLimiter::new(fast_pools()));

        let collaborators = Collaborators {
            fetcher: fetcher.clone(),
            validator: Arc::new(PdfValidator::new()),
            storage: storage.clone(),
            indexing: Arc::new(RateLimitedIndexing::new(
                index.clone(),
                Arc::clone(&limiter),
                shutdown.clone(),
            )),
            notifier: notifier.clone(),
        };
        let progress = ProgressBroadcaster::default();

        let orchestrator = Orchestrator::new(
            db.clone(),
            collaborators.clone(),
            progress.clone(),
            engine,
            INDEX_REF,
            shutdown.clone(),
        );
        let reconciler = Reconciler::new(
            db.clone(),
            &collaborators,
            Arc::clone(&limiter),
            progress,
            scheduler,
            INDEX_REF,
            shutdown.clone(),
        )
        .with_orchestrator(orchestrator.clone());

        Self {
            db,
            fetcher,
            index,
            notifier,
            storage,
            limiter,
            orchestrator,
            reconciler,
            shutdown,
            owner: Caller::user(OWNER),
            admin: Caller::admin("ops"),
        }
    }

    /// Serves a valid one-page PDF at `url`.
    pub fn add_pdf(&self, url: &str) {
        self.fetcher.insert(url, pdf_bytes(1));
    }

    /// Serves bytes that are not a PDF at `url`.
    pub fn add_garbage(&self, url: &str) {
        self.fetcher.insert(url, b"<html>not a paper</html>".to_vec());
    }

    pub fn document(url: &str, title: &str) -> ItemRequest {
        ItemRequest::document(url, title)
    }

    /// Starts a `batch_upload` job owned by [`OWNER`].
    pub async fn submit(&self, items: Vec<ItemRequest>) -> JobReceipt {
        self.orchestrator
            .start_job(&self.owner, JobType::BatchUpload, items)
            .await
            .expect("Failed to start job")
    }

    /// Submits and waits until every item task has finished.
    pub async fn submit_and_settle(&self, items: Vec<ItemRequest>) -> JobReceipt {
        let receipt = self.submit(items).await;
        self.settle().await;
        receipt
    }

    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.orchestrator.wait_idle())
            .await
            .expect("Engine did not settle in time");
    }

    pub fn snapshot(&self, job_id: &str) -> JobSnapshot {
        self.orchestrator
            .get_job_status(job_id, &self.admin)
            .expect("Failed to read job")
    }

    pub fn status(&self, job_id: &str) -> JobStatus {
        self.snapshot(job_id).job.status
    }

    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconciler
            .reconcile_once()
            .await
            .expect("Reconcile failed")
    }

    /// Polls `condition` until it holds, failing the test after five seconds.
    pub async fn wait_for<F>(&self, what: &str, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("Timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
