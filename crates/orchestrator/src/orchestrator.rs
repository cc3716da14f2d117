use crate::wallet_worker;
use anyhow::{Context, Result};
use common::api_client::NodeApiClient;
use common::config::Config;
use common::types::WalletTriple;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::store::Store;

/// Handle to a running Wallet Worker task.
struct WorkerHandle {
    cancel: CancellationToken,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// Supervises one Wallet Worker task per wallet that currently needs work,
/// bounded by `max_wallet_workers`. Never runs two workers for the same
/// wallet at once — that invariant is what makes the per-wallet lock
/// unnecessary for correctness and only useful for cross-process safety.
pub struct Orchestrator {
    store: Store,
    client: Arc<NodeApiClient>,
    config: Arc<Config>,
    workers: HashMap<String, WorkerHandle>,
}

impl Orchestrator {
    pub fn new(store: Store, client: Arc<NodeApiClient>, config: Arc<Config>) -> Self {
        Self {
            store,
            client,
            config,
            workers: HashMap::new(),
        }
    }

    pub fn active_worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run the main poll loop until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let poll_interval = self.config.orchestrator.poll_interval;
        info!(?poll_interval, "orchestrator loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("orchestrator received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(poll_interval) => {
                    self.reap_finished_workers();

                    if let Err(e) = self.dispatch_pending_wallets().await {
                        error!(error = %e, "failed to poll for wallets needing work");
                    }

                    metrics::gauge!("orchestrator_active_wallet_workers")
                        .set(self.workers.len() as f64);
                }
            }
        }

        self.shutdown().await;
    }

    async fn dispatch_pending_wallets(&mut self) -> Result<()> {
        let wallets = self
            .store
            .list_wallets_needing_work()
            .await
            .context("list_wallets_needing_work")?;

        for wallet in wallets {
            if self.workers.contains_key(&wallet.xpub_van) {
                continue;
            }
            if self.workers.len() >= self.config.orchestrator.max_wallet_workers {
                warn!(
                    max = self.config.orchestrator.max_wallet_workers,
                    "at max wallet worker capacity, deferring dispatch"
                );
                break;
            }
            self.spawn_worker(wallet);
        }

        Ok(())
    }

    fn spawn_worker(&mut self, wallet: WalletTriple) {
        let xpub_van = wallet.xpub_van.clone();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let store = self.store.clone();
        let client = Arc::clone(&self.client);
        let config = Arc::clone(&self.config);

        let handle = tokio::spawn(async move {
            wallet_worker::run(store, client, config, wallet, cancel_clone).await;
        });

        metrics::counter!("orchestrator_wallet_workers_spawned_total").increment(1);
        self.workers
            .insert(xpub_van, WorkerHandle { cancel, handle });
    }

    fn reap_finished_workers(&mut self) {
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, h)| h.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();

        for xpub_van in finished {
            self.workers.remove(&xpub_van);
            metrics::counter!("orchestrator_wallet_workers_reaped_total", "reason" => "finished")
                .increment(1);
        }
    }

    /// Cancel every supervised worker and wait for them to exit, bounded by
    /// a drain window so a stuck worker cannot hang process shutdown
    /// forever.
    async fn shutdown(&mut self) {
        info!(count = self.workers.len(), "shutting down wallet workers");
        let drain = Duration::from_secs(10);

        for (xpub_van, handle) in self.workers.drain() {
            handle.cancel.cancel();
            match tokio::time::timeout(drain, handle.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(wallet = %xpub_van, error = %e, "wallet worker panicked on shutdown"),
                Err(_) => warn!(wallet = %xpub_van, "wallet worker did not exit within drain window"),
            }
        }
    }
}
