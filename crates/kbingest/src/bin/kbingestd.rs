//! `kbingestd [config-path]`: runs the ingestion engine and the
//! reconciliation scheduler until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use kbingest::config::{self, Config};
use kbingest::engine::{Collaborators, Orchestrator, ReconcileScheduler, Reconciler};
use kbingest::error::ConfigError;
use kbingest::fetch::DefaultFetcher;
use kbingest::indexing::{HttpIndexingClient, RateLimitedIndexing};
use kbingest::notify::DatabaseNotifier;
use kbingest::storage::FsObjectStorage;
use kbingest::validate::PdfValidator;
use kbingest::{logging, Database, ProgressBroadcaster, RateLimiter};

/// Used when no path is given and `~/.kbingest/kbingest.json` exists.
fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".kbingest").join("kbingest.json"))
        .filter(|path| path.exists())
}

fn load(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    match path.or_else(default_config_path) {
        Some(path) => config::load_config(path),
        None => config::load_config_from_str("{}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load(std::env::args_os().nth(1).map(PathBuf::from)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kbingestd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.logging);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("kbingestd: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> kbingest::Result<()> {
    let db = Database::open(&config.database.resolved_path()?)?;
    let shutdown = CancellationToken::new();

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let http = HttpIndexingClient::new(
        &config.indexing.base_url,
        config.indexing.resolve_api_token()?,
        config.indexing.timeout(),
    )?;
    let collaborators = Collaborators {
        fetcher: Arc::new(DefaultFetcher::new(
            &config.engine.user_agent,
            config.engine.download_timeout(),
        )?),
        validator: Arc::new(PdfValidator::new()),
        storage: Arc::new(FsObjectStorage::new(config.storage.resolved_root()?)),
        indexing: Arc::new(
            RateLimitedIndexing::new(Arc::new(http), Arc::clone(&limiter), shutdown.clone())
                .with_throttle_retries(config.indexing.throttle_retries),
        ),
        notifier: Arc::new(DatabaseNotifier::new(db.clone())),
    };
    if config.indexing.knowledge_base_id.is_empty() {
        log::warn!("indexing.knowledge_base_id is empty, registrations will likely be rejected");
    }
    let index_ref = config.indexing.knowledge_base_id.clone();
    let progress = ProgressBroadcaster::default();

    let orchestrator = Orchestrator::new(
        db.clone(),
        collaborators.clone(),
        progress.clone(),
        config.engine.clone(),
        index_ref.clone(),
        shutdown.clone(),
    );
    let resumed = orchestrator.resume_interrupted().await?;
    if resumed > 0 {
        log::info!("Resumed {} interrupted jobs", resumed);
    }

    let reconciler = Reconciler::new(
        db,
        &collaborators,
        limiter,
        progress,
        config.scheduler,
        index_ref,
        shutdown.clone(),
    )
    .with_orchestrator(orchestrator.clone());
    let scheduler = ReconcileScheduler::new(Arc::new(reconciler), config.scheduler);
    let (_trigger_tx, trigger_rx) = broadcast::channel(16);
    let scheduler_task = scheduler.start(trigger_rx);

    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Interrupt received, shutting down");
        signal.cancel();
    }) {
        log::warn!("Failed to install Ctrl-C handler: {}", e);
    }

    shutdown.cancelled().await;

    scheduler.stop();
    if let Err(e) = scheduler_task.await {
        log::error!("Scheduler task ended abnormally: {}", e);
    }
    scheduler.wait_for_ticks().await;
    orchestrator.shutdown().await;
    log::info!("kbingestd stopped");
    Ok(())
}
