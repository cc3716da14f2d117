use crate::store::Store;
use anyhow::{Context, Result};
use common::api_client::NodeApiClient;
use common::config::Config;
use common::types::{Job, WalletTriple};
use tracing::{debug, info, warn};

/// Does the refresh procedure need to run for this job, or only a watcher
/// registration? `invoice_created` without an `asset_id` yet is the one
/// dispatch branch that skips the refresh entirely — there is nothing to
/// refresh until the invoice is paid onto a known asset.
fn is_late_bound_invoice(job: &Job) -> bool {
    job.trigger == "invoice_created" && job.asset_id.is_none()
}

/// Run one job through to completion. Returns `Ok(true)` when the handler
/// actually ran (whether or not it acquired the wallet lock partway
/// through), `Ok(false)` when no handler ran because the wallet lock was
/// held elsewhere — the caller must not count this as an attempt — and
/// `Err` on a real failure, which the caller classifies as retry-or-failed
/// via `job.attempts`/`job.max_retries`.
pub async fn handle(
    store: &Store,
    client: &NodeApiClient,
    config: &Config,
    job: &Job,
) -> Result<bool> {
    if is_late_bound_invoice(job) {
        let recipient_id = job
            .recipient_id
            .clone()
            .context("invoice_created job missing recipient_id")?;
        info!(
            wallet = %job.wallet.xpub_van,
            recipient_id = %recipient_id,
            "invoice created without asset yet, registering watcher only"
        );
        store
            .create_watcher(
                job.wallet.clone(),
                recipient_id,
                None,
                config.watcher.invoice_created_watcher_ttl,
            )
            .await?;
        metrics::counter!("orchestrator_watchers_created_total").increment(1);
        return Ok(true);
    }

    run_unified_refresh(store, client, config, &job.wallet).await
}

/// Acquire the wallet lock, refresh the node's view of the wallet, sweep
/// detached and per-asset transfers, register watchers for anything
/// non-terminal, and fail out any cancellation-eligible transfer. Releases
/// the lock on every exit path, including the lock-contention path.
async fn run_unified_refresh(
    store: &Store,
    client: &NodeApiClient,
    config: &Config,
    wallet: &WalletTriple,
) -> Result<bool> {
    let acquired = store
        .acquire_lock(wallet.xpub_van.clone(), config.watcher.wallet_lock_ttl)
        .await?;
    if !acquired {
        debug!(wallet = %wallet.xpub_van, "wallet lock held elsewhere, skipping this dispatch");
        metrics::counter!("orchestrator_lock_acquire_total", "outcome" => "skipped").increment(1);
        return Ok(false);
    }
    metrics::counter!("orchestrator_lock_acquire_total", "outcome" => "acquired").increment(1);

    let result = run_unified_refresh_locked(store, client, config, wallet).await;

    if let Err(e) = store.release_lock(wallet.xpub_van.clone()).await {
        warn!(wallet = %wallet.xpub_van, error = %e, "failed to release wallet lock");
    }

    result.map(|()| true)
}

async fn run_unified_refresh_locked(
    store: &Store,
    client: &NodeApiClient,
    config: &Config,
    wallet: &WalletTriple,
) -> Result<()> {
    client.refresh(wallet).await.context("wallet/refresh")?;

    // Detached transfers are not yet bound to any listed asset.
    let detached = client
        .listtransfers(wallet, None)
        .await
        .context("wallet/listtransfers (detached)")?;
    process_transfers(store, client, config, wallet, None, detached).await?;

    let assets = client.listassets(wallet).await.context("wallet/listassets")?;
    for asset in assets {
        let transfers = client
            .listtransfers(wallet, Some(&asset.asset_id))
            .await
            .with_context(|| format!("wallet/listtransfers (asset {})", asset.asset_id))?;
        process_transfers(
            store,
            client,
            config,
            wallet,
            Some(asset.asset_id.as_str()),
            transfers,
        )
        .await?;
    }

    Ok(())
}

async fn process_transfers(
    store: &Store,
    client: &NodeApiClient,
    config: &Config,
    wallet: &WalletTriple,
    asset_id: Option<&str>,
    transfers: Vec<common::types::Transfer>,
) -> Result<()> {
    for transfer in transfers {
        if transfer.status.is_terminal() {
            continue;
        }

        if crate::watcher::is_cancellation_eligible(&transfer, config.watcher.duration_rcv_transfer)
        {
            info!(
                wallet = %wallet.xpub_van,
                recipient_id = %transfer.recipient_id,
                "cancellation predicate matched during refresh, failing transfer"
            );
            client
                .failtransfers(wallet, transfer.batch_transfer_idx)
                .await
                .context("wallet/failtransfers")?;
            continue;
        }

        store
            .create_watcher(
                wallet.clone(),
                transfer.recipient_id.clone(),
                asset_id.map(str::to_string).or_else(|| transfer.asset_id.clone()),
                config.watcher.watcher_ttl,
            )
            .await?;
        metrics::counter!("orchestrator_watchers_created_total").increment(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_late_bound_invoice_true_without_asset() {
        let job = Job {
            job_id: "j1".to_string(),
            wallet: WalletTriple::new("van1", "col1", "fp1"),
            trigger: "invoice_created".to_string(),
            recipient_id: Some("R1".to_string()),
            asset_id: None,
            status: common::types::JobStatus::Pending,
            attempts: 0,
            max_retries: 10,
            created_at: String::new(),
            processed_at: None,
            error_message: None,
        };
        assert!(is_late_bound_invoice(&job));
    }

    #[test]
    fn test_is_late_bound_invoice_false_with_asset() {
        let job = Job {
            job_id: "j1".to_string(),
            wallet: WalletTriple::new("van1", "col1", "fp1"),
            trigger: "invoice_created".to_string(),
            recipient_id: Some("R1".to_string()),
            asset_id: Some("A1".to_string()),
            status: common::types::JobStatus::Pending,
            attempts: 0,
            max_retries: 10,
            created_at: String::new(),
            processed_at: None,
            error_message: None,
        };
        assert!(!is_late_bound_invoice(&job));
    }

    #[test]
    fn test_is_late_bound_invoice_false_for_sync() {
        let job = Job {
            job_id: "j1".to_string(),
            wallet: WalletTriple::new("van1", "col1", "fp1"),
            trigger: "sync".to_string(),
            recipient_id: None,
            asset_id: None,
            status: common::types::JobStatus::Pending,
            attempts: 0,
            max_retries: 10,
            created_at: String::new(),
            processed_at: None,
            error_message: None,
        };
        assert!(!is_late_bound_invoice(&job));
    }
}
