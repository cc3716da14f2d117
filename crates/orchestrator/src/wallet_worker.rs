use crate::store::{JobOutcome, Store};
use crate::{job_handler, watcher};
use common::api_client::NodeApiClient;
use common::config::Config;
use common::types::WalletTriple;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Drive one wallet end-to-end: dequeue and dispatch its jobs, tick its
/// watchers, and exit once there has been no work for `idle_timeout`. The
/// Orchestrator respawns a worker the next time this wallet has work.
pub async fn run(
    store: Store,
    client: Arc<NodeApiClient>,
    config: Arc<Config>,
    wallet: WalletTriple,
    cancel: CancellationToken,
) {
    info!(wallet = %wallet.xpub_van, "wallet worker started");
    let mut last_work_at = Instant::now();
    let poll_interval = config.wallet_worker.poll_interval;
    let idle_timeout = config.wallet_worker.idle_timeout;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(wallet = %wallet.xpub_van, "wallet worker cancelled");
                break;
            }
            _ = tokio::time::sleep(poll_interval) => {
                let did_work = run_one_cycle(&store, &client, &config, &wallet).await;
                if did_work {
                    last_work_at = Instant::now();
                } else if last_work_at.elapsed() >= idle_timeout {
                    debug!(wallet = %wallet.xpub_van, "wallet worker idle timeout reached");
                    break;
                }
            }
        }
    }

    info!(wallet = %wallet.xpub_van, "wallet worker stopped");
}

/// Dequeue and dispatch one job (if any), then tick every active watcher
/// once. Returns `true` if any of that produced observable work.
async fn run_one_cycle(
    store: &Store,
    client: &NodeApiClient,
    config: &Config,
    wallet: &WalletTriple,
) -> bool {
    let mut did_work = false;

    match store.dequeue_for_wallet(wallet.xpub_van.clone()).await {
        Ok(Some(job)) => {
            did_work = true;
            let start = std::time::Instant::now();
            let result = job_handler::handle(store, client, config, &job).await;
            metrics::histogram!("orchestrator_job_handler_duration_ms")
                .record(start.elapsed().as_secs_f64() * 1000.0);

            // `complete_job` owns the retry-vs-terminal decision and the
            // backoff delay, keyed off the job's own `attempts` column, so
            // a retry never starts a pristine counter in a new row.
            let (outcome, outcome_label) = match result {
                Ok(true) => (JobOutcome::Completed, "completed"),
                Ok(false) => (JobOutcome::LockSkipped, "lock_skipped"),
                Err(e) => {
                    error!(wallet = %wallet.xpub_van, job_id = %job.job_id, error = %e, "job handler failed");
                    (JobOutcome::Failed(e.to_string()), "failed")
                }
            };

            if let Err(e) = store
                .complete_job(
                    job.job_id.clone(),
                    outcome,
                    job.max_retries,
                    config.retry.retry_delay_base,
                )
                .await
            {
                error!(wallet = %wallet.xpub_van, job_id = %job.job_id, error = %e, "failed to record job completion");
            }

            metrics::counter!("orchestrator_jobs_completed_total", "outcome" => outcome_label)
                .increment(1);
        }
        Ok(None) => {}
        Err(e) => {
            error!(wallet = %wallet.xpub_van, error = %e, "failed to dequeue job");
        }
    }

    match store.list_active_watchers(wallet.xpub_van.clone()).await {
        Ok(watchers) => {
            for w in watchers {
                match watcher::tick(store, client, config, &w).await {
                    Ok(ticked) => did_work = did_work || ticked,
                    Err(e) => {
                        error!(
                            wallet = %wallet.xpub_van,
                            recipient_id = %w.recipient_id,
                            error = %e,
                            "watcher tick failed"
                        );
                    }
                }
            }
        }
        Err(e) => {
            error!(wallet = %wallet.xpub_van, error = %e, "failed to list active watchers");
        }
    }

    did_work
}
