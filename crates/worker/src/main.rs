use botqueue::config;
use botqueue::db;
use botqueue::queue::{AttemptsRepo, ItemStore, QueueManager};
use botqueue::telemetry;

use tokio::sync::watch;
use tracing::{error, info};

mod handlers;
use handlers::build_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init(cfg.log_json);

    info!(
        worker_id = %cfg.worker_id,
        concurrency = cfg.concurrency,
        poll_interval_ms = cfg.poll_interval_ms,
        reap_interval_ms = cfg.reap_interval_ms,
        stale_timeout_secs = cfg.stale_timeout_secs,
        handler_timeout_secs = cfg.handler_timeout_secs,
        migrate_on_startup = cfg.migrate_on_startup,
        "botqueue worker starting"
    );

    let pool = db::make_pool(&cfg.database_url, &cfg.pool_settings()).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store = ItemStore::new(pool.clone()).with_max_payload_bytes(cfg.max_payload_bytes);
    let attempts = AttemptsRepo::new(pool.clone());
    let registry = build_registry(cfg.handler_timeout());

    let manager = QueueManager::new(
        store,
        attempts,
        registry,
        cfg.retry_policy(),
        cfg.manager_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager_handle = tokio::spawn(async move { manager.run(shutdown_rx).await });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested; finishing in-flight items"),
        Err(e) => error!(error = %e, "could not listen for ctrl-c; shutting down"),
    }
    // in-flight items finish; anything cut short is picked up by the reaper
    let _ = shutdown_tx.send(true);

    manager_handle.await??;
    pool.close().await;

    info!("botqueue worker stopped");
    Ok(())
}
