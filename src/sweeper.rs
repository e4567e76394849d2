use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::guest::GuestFlow;

/// Runs `Engine::run_sweep_now` on a fixed interval until shut down.
pub struct SweepScheduler;

/// Owner of a running background loop. Dropping it does not stop the loop; call `shutdown`.
pub struct SweepHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweepScheduler {
    pub fn spawn(engine: Arc<Engine>, every: Duration) -> SweepHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(engine, every, cancel.clone()));
        SweepHandle { cancel, task }
    }
}

impl SweepHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("sweeper task ended abnormally: {e}");
        }
    }
}

async fn run_sweeper(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("sweeper stopped");
                return;
            }
            _ = interval.tick() => {
                match engine.run_sweep_now().await {
                    Ok(report) => debug!(transitions = report.total(), "sweeper pass done"),
                    // Retried on the next tick.
                    Err(e) => warn!("sweeper pass failed: {e}"),
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough records have accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let appends = engine.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match engine.compact_wal().await {
                    Ok(()) => info!(appends, "compacted WAL"),
                    Err(e) => warn!("WAL compaction failed: {e}"),
                }
            }
        }
    }
}

/// Background task that deletes staged guest uploads nobody can confirm any more.
pub async fn run_upload_janitor(guests: Arc<GuestFlow>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let removed = guests.purge_stale_uploads().await;
                debug!(removed, "upload janitor pass done");
            }
        }
    }
}
