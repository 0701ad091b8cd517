//! Periodic reconciliation scheduler.
//!
//! Runs two independent timers: the index confirmation tick (default every
//! 2 minutes) and the health tick (default every 15 minutes). A manual
//! confirmation run can be requested through a broadcast channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;

use super::reconciler::Reconciler;

pub struct ReconcileScheduler {
    reconciler: Arc<Reconciler>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    ticks: TaskTracker,
}

impl ReconcileScheduler {
    /// The scheduler stops on its own [`stop`](Self::stop) and whenever the
    /// reconciler's shutdown token fires.
    pub fn new(reconciler: Arc<Reconciler>, config: SchedulerConfig) -> Self {
        let shutdown = reconciler.shutdown_token().child_token();
        Self {
            reconciler,
            config,
            shutdown,
            ticks: TaskTracker::new(),
        }
    }

    /// Starts the timer loop on the current runtime. Each tick runs as its
    /// own task, so a slow confirmation run never delays the health tick.
    /// Overlapping runs of the same tick are skipped by the reconciler.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let reconciler = Arc::clone(&self.reconciler);
        let shutdown = self.shutdown.clone();
        let ticks = self.ticks.clone();
        let config = self.config;

        tokio::spawn(async move {
            let mut confirmation = tokio::time::interval(config.confirmation_interval());
            confirmation.set_missed_tick_behavior(MissedTickBehavior::Skip);
            confirmation.tick().await; // skip immediate first tick

            let mut health = tokio::time::interval(config.health_interval());
            health.set_missed_tick_behavior(MissedTickBehavior::Skip);
            health.tick().await;

            log::info!(
                "Reconciliation scheduler started (confirmation every {:?}, health every {:?})",
                config.confirmation_interval(),
                config.health_interval()
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = confirmation.tick() => spawn_confirmation(&ticks, &reconciler),
                    _ = health.tick() => spawn_health(&ticks, &reconciler),
                    Ok(()) = trigger_rx.recv() => {
                        log::info!("Manual index confirmation triggered");
                        spawn_confirmation(&ticks, &reconciler);
                    }
                }
            }

            log::info!("Reconciliation scheduler stopped");
        })
    }

    /// Signals the timer loop to stop. Runs already in progress finish.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Waits for every tick started so far.
    pub async fn wait_for_ticks(&self) {
        self.ticks.close();
        self.ticks.wait().await;
        self.ticks.reopen();
    }
}

fn spawn_confirmation(ticks: &TaskTracker, reconciler: &Arc<Reconciler>) {
    let reconciler = Arc::clone(reconciler);
    ticks.spawn(async move {
        if let Err(e) = reconciler.reconcile_once().await {
            log::error!("Index confirmation failed: {}", e);
        }
    });
}

fn spawn_health(ticks: &TaskTracker, reconciler: &Arc<Reconciler>) {
    let reconciler = Arc::clone(reconciler);
    ticks.spawn(async move {
        match reconciler.health_check_once().await {
            Ok(report) if report.timed_out > 0 || report.resumed > 0 => log::info!(
                "Health check: {} timed out, {} resumed",
                report.timed_out,
                report.resumed
            ),
            Ok(_) => {}
            Err(e) => log::error!("Health check failed: {}", e),
        }
    });
}
