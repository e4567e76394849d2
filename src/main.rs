use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use slotbook::clock::SystemClock;
use slotbook::config::Config;
use slotbook::engine::Engine;
use slotbook::files::LocalFileStore;
use slotbook::guest::{GuestFlow, NoAccounts};
use slotbook::notify::OutboxNotifier;
use slotbook::sweeper::{self, SweepScheduler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotbook::observability::init(config.metrics_port);

    // Ensure data directories exist
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.files_dir)?;

    let notifier = Arc::new(OutboxNotifier::new(config.outbox_path()));
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        notifier,
        Arc::new(SystemClock),
    )?);

    let guests = Arc::new(GuestFlow::new(
        engine.clone(),
        Arc::new(LocalFileStore::new(config.files_dir.clone())),
        Arc::new(NoAccounts),
        config.guest_settings(),
    ));

    info!("slotbook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  outbox: {}", config.outbox_path().display());
    info!("  files_dir: {}", config.files_dir.display());
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Catch up on anything that became due while we were down.
    let report = engine.run_sweep_now().await?;
    info!(transitions = report.total(), "startup sweep done");

    let sweeps = SweepScheduler::spawn(engine.clone(), config.sweep_interval);
    let background_cancel = CancellationToken::new();
    let compactor = tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        background_cancel.clone(),
    ));
    let janitor = tokio::spawn(sweeper::run_upload_janitor(
        guests,
        config.sweep_interval,
        background_cancel.clone(),
    ));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping background tasks");
    sweeps.shutdown().await;
    background_cancel.cancel();
    if let Err(e) = compactor.await {
        tracing::warn!("compactor ended abnormally: {e}");
    }
    if let Err(e) = janitor.await {
        tracing::warn!("upload janitor ended abnormally: {e}");
    }
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction skipped: {e}");
    }

    info!("slotbook stopped");
    Ok(())
}
