use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use courtside::config::{Config, NotifierKind};
use courtside::engine::Engine;
use courtside::notify::{LogNotifier, Notifier, NotifyDispatcher, OutboxNotifier};
use courtside::scheduler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    courtside::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let notifier: Arc<dyn Notifier> = match config.notifier {
        NotifierKind::Log => Arc::new(LogNotifier),
        NotifierKind::Outbox => Arc::new(OutboxNotifier::new(
            config.outbox_path.clone(),
            config.mail_from.clone(),
        )),
    };
    let dispatcher = NotifyDispatcher::spawn(notifier, config.notify_queue);

    let journal_path = config.journal_path();
    let engine = Arc::new(Engine::open(journal_path.clone(), dispatcher.clone())?);

    info!("courtside started");
    info!("  journal: {}", journal_path.display());
    info!("  penalty expiry: daily at {:02}:00", config.expiry_hour);
    info!("  notifier: {:?}", config.notifier);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let expiry = tokio::spawn(scheduler::run_expiry_scheduler(engine.clone(), config.expiry_hour));
    let compactor = tokio::spawn(scheduler::run_compactor(engine.clone(), config.compact_threshold));

    // Graceful shutdown on SIGTERM/ctrl-c
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

    info!("shutdown signal received");
    expiry.abort();
    compactor.abort();

    // Let queued notifications go out before exiting
    let drained = tokio::time::timeout(std::time::Duration::from_secs(10), dispatcher.flush()).await;
    if drained.is_err() {
        tracing::warn!("notification drain timed out");
    }

    info!("courtside stopped");
    Ok(())
}
