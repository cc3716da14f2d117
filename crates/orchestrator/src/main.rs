use anyhow::{Context, Result};
use std::sync::Arc;

mod job_handler;
mod jobs;
mod metrics;
mod orchestrator;
mod scheduler;
mod store;
mod wallet_worker;
mod watcher;

use jobs::tracker::JobTracker;
use orchestrator::Orchestrator;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("orchestrator", &config.observability.log_level);
    tracing::dispatcher::set_global_default(dispatch)
        .context("failed to install tracing dispatcher")?;

    tracing::info!("orchestrator starting");

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent).context("create database directory")?;
    }

    metrics::describe();
    metrics::install_prometheus(config.observability.prometheus_port)?;

    let db = common::db::AsyncDb::open(&config.database.path)
        .await
        .context("open database")?;
    let store = Store::new(db.clone());

    if config.orchestrator.enable_recovery {
        let recovered = store
            .recover(config.retry.max_refresh_retries)
            .await
            .context("recover")?;
        tracing::info!(recovered, "startup recovery complete");
    }

    let client = Arc::new(common::api_client::NodeApiClient::new(
        &config.api.base_url,
        config.api.http_timeout,
    )?);
    let config = Arc::new(config);

    let shutdown = tokio_util::sync::CancellationToken::new();

    let (wal_tick_tx, mut wal_tick_rx) = tokio::sync::mpsc::channel::<()>(1);
    let _scheduler_handles = scheduler::start(vec![scheduler::JobSpec {
        name: "wal_checkpoint".to_string(),
        interval: std::time::Duration::from_secs(300),
        tick: wal_tick_tx,
        run_immediately: false,
    }]);

    let wal_db = db.clone();
    let wal_task = tokio::spawn(async move {
        while wal_tick_rx.recv().await.is_some() {
            let tracker = match JobTracker::start(&wal_db, "wal_checkpoint").await {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "failed to start wal_checkpoint job tracker");
                    continue;
                }
            };
            match jobs::maintenance::run_wal_checkpoint_once(&wal_db).await {
                Ok((log, checkpointed)) => {
                    if let Err(e) = tracker
                        .success(Some(serde_json::json!({ "log": log, "checkpointed": checkpointed })))
                        .await
                    {
                        tracing::error!(error = %e, "failed to record wal_checkpoint success");
                    }
                }
                Err(e) => {
                    if let Err(track_err) = tracker.fail(&e).await {
                        tracing::error!(error = %track_err, "failed to record wal_checkpoint failure");
                    }
                }
            }
        }
    });

    let mut orch = Orchestrator::new(store, client, Arc::clone(&config));
    let orch_shutdown = shutdown.clone();
    let orch_handle = tokio::spawn(async move {
        orch.run(orch_shutdown).await;
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal, draining wallet workers");
    shutdown.cancel();
    orch_handle.await.context("orchestrator task panicked")?;

    wal_task.abort();
    tracing::info!("orchestrator stopped");
    Ok(())
}
