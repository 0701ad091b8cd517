pub mod broadcast;
pub mod candidates;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod indexing;
pub mod logging;
pub mod model;
pub mod notify;
pub mod ratelimit;
pub mod sanitize;
pub mod storage;
pub mod validate;

pub use broadcast::{IngestProgressEvent, ProgressBroadcaster};
pub use candidates::{Candidate, CandidateFilter, CandidateProvider, StaticCandidateProvider};
pub use config::{load_config, Config};
pub use db::Database;
pub use engine::{
    Caller, Collaborators, ItemOutcome, ListJobsFilter, Orchestrator, ReconcileReport,
    ReconcileScheduler, Reconciler,
};
pub use error::{ErrorKind, IngestError, Result};
pub use indexing::{IndexingClient, PassState};
pub use model::{
    IngestionItem, IngestionJob, ItemRequest, ItemStatus, ItemType, JobReceipt, JobSnapshot,
    JobStatus, JobType,
};
pub use notify::{Notification, Notifier};
pub use ratelimit::{Pool, RateLimiter};
