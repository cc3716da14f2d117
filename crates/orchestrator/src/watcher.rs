use crate::store::Store;
use anyhow::{Context, Result};
use common::api_client::NodeApiClient;
use common::config::Config;
use common::types::{Transfer, TransferKind, TransferStatus, Watcher, WatcherStatus};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A `WAITING_COUNTERPARTY` transfer is cancellation-eligible once its
/// expiration has passed, and either it is a blind receive (which never
/// gets a second chance to settle) or its expiration plus the configured
/// receive-transfer grace window has also passed.
pub fn is_cancellation_eligible(transfer: &Transfer, duration_rcv_transfer: Duration) -> bool {
    if transfer.status != TransferStatus::WaitingCounterparty {
        return false;
    }
    let Some(expiration) = transfer.expiration else {
        return false;
    };
    let now = chrono::Utc::now().timestamp();
    if expiration >= now {
        return false;
    }
    if transfer.kind == TransferKind::ReceiveBlind {
        return true;
    }
    expiration + duration_rcv_transfer.as_secs() as i64 <= now
}

/// One tick of one watcher: refresh the wallet, locate the transfer this
/// watcher is tracking, and either transition it to a terminal state,
/// cancel it, or leave it watching. Returns `true` if any DB-visible work
/// was done (used by the Wallet Worker to decide whether to reset its idle
/// timer).
pub async fn tick(
    store: &Store,
    client: &NodeApiClient,
    config: &Config,
    watcher: &Watcher,
) -> Result<bool> {
    if is_expired(watcher) {
        info!(
            wallet = %watcher.wallet.xpub_van,
            recipient_id = %watcher.recipient_id,
            "watcher expired"
        );

        // Best-effort: if the tracked transfer is still open on the node
        // and the cancellation predicate holds, fail it before the watcher
        // is torn down. A lock-skip or a failed lookup is not fatal to the
        // expiry itself, only logged.
        let acquired = store
            .acquire_lock(watcher.wallet.xpub_van.clone(), config.watcher.wallet_lock_ttl)
            .await?;
        if acquired {
            if let Err(e) = attempt_cancel_on_expiry(client, config, watcher).await {
                warn!(
                    wallet = %watcher.wallet.xpub_van,
                    recipient_id = %watcher.recipient_id,
                    error = %e,
                    "best-effort cancellation on watcher expiry failed"
                );
            }
            if let Err(e) = store.release_lock(watcher.wallet.xpub_van.clone()).await {
                warn!(wallet = %watcher.wallet.xpub_van, error = %e, "failed to release wallet lock");
            }
        } else {
            debug!(
                wallet = %watcher.wallet.xpub_van,
                recipient_id = %watcher.recipient_id,
                "wallet lock held elsewhere, skipping best-effort cancellation on expiry"
            );
        }

        store
            .update_watcher(
                watcher.wallet.xpub_van.clone(),
                watcher.recipient_id.clone(),
                None,
                Some(WatcherStatus::Expired),
                false,
            )
            .await?;
        metrics::counter!("orchestrator_watcher_ticks_total", "outcome" => "expired")
            .increment(1);
        return Ok(true);
    }

    let acquired = store
        .acquire_lock(watcher.wallet.xpub_van.clone(), config.watcher.wallet_lock_ttl)
        .await?;
    if !acquired {
        debug!(
            wallet = %watcher.wallet.xpub_van,
            recipient_id = %watcher.recipient_id,
            "wallet lock held elsewhere, skipping this tick"
        );
        metrics::counter!("orchestrator_watcher_ticks_total", "outcome" => "lock_skipped")
            .increment(1);
        return Ok(false);
    }

    let result = tick_locked(store, client, config, watcher).await;

    if let Err(e) = store.release_lock(watcher.wallet.xpub_van.clone()).await {
        warn!(wallet = %watcher.wallet.xpub_van, error = %e, "failed to release wallet lock");
    }

    result
}

fn is_expired(watcher: &Watcher) -> bool {
    parse_sqlite_datetime(&watcher.expires_at)
        .map(|dt| dt < chrono::Utc::now().naive_utc())
        .unwrap_or(false)
}

/// Parse the `TEXT` timestamp format SQLite's `datetime()`/`strftime()`
/// functions produce (`YYYY-MM-DD HH:MM:SS[.SSS]`, always UTC since the
/// schema never passes a `'localtime'` modifier).
fn parse_sqlite_datetime(s: &str) -> Option<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

async fn tick_locked(
    store: &Store,
    client: &NodeApiClient,
    config: &Config,
    watcher: &Watcher,
) -> Result<bool> {
    client
        .refresh(&watcher.wallet)
        .await
        .context("wallet/refresh")?;
    store
        .update_watcher(
            watcher.wallet.xpub_van.clone(),
            watcher.recipient_id.clone(),
            None,
            None,
            true,
        )
        .await?;

    let transfer = find_transfer(client, watcher).await?;

    let Some((transfer, discovered_asset_id)) = transfer else {
        // Not found yet (still propagating on the node side); leave watching.
        metrics::counter!("orchestrator_watcher_ticks_total", "outcome" => "still_watching")
            .increment(1);
        return Ok(true);
    };

    if let Some(asset_id) = discovered_asset_id {
        store
            .update_watcher(
                watcher.wallet.xpub_van.clone(),
                watcher.recipient_id.clone(),
                Some(asset_id),
                None,
                false,
            )
            .await?;
    }

    if is_cancellation_eligible(&transfer, config.watcher.duration_rcv_transfer) {
        info!(
            wallet = %watcher.wallet.xpub_van,
            recipient_id = %watcher.recipient_id,
            "cancellation predicate matched, failing transfer"
        );
        client
            .failtransfers(&watcher.wallet, transfer.batch_transfer_idx)
            .await
            .context("wallet/failtransfers")?;
        store
            .update_watcher(
                watcher.wallet.xpub_van.clone(),
                watcher.recipient_id.clone(),
                None,
                Some(WatcherStatus::Expired),
                false,
            )
            .await?;
        metrics::counter!("orchestrator_watcher_ticks_total", "outcome" => "expired")
            .increment(1);
        return Ok(true);
    }

    if transfer.status.is_terminal() {
        let status = match transfer.status {
            TransferStatus::Settled => WatcherStatus::Settled,
            TransferStatus::Expired => WatcherStatus::Expired,
            _ => WatcherStatus::Failed,
        };
        info!(
            wallet = %watcher.wallet.xpub_van,
            recipient_id = %watcher.recipient_id,
            ?status,
            "transfer reached a terminal state"
        );
        store
            .update_watcher(
                watcher.wallet.xpub_van.clone(),
                watcher.recipient_id.clone(),
                None,
                Some(status),
                false,
            )
            .await?;
        let outcome = match status {
            WatcherStatus::Settled => "settled",
            WatcherStatus::Expired => "expired",
            _ => "failed",
        };
        metrics::counter!("orchestrator_watcher_ticks_total", "outcome" => outcome).increment(1);
        return Ok(true);
    }

    metrics::counter!("orchestrator_watcher_ticks_total", "outcome" => "still_watching")
        .increment(1);
    Ok(true)
}

/// Look up the transfer this watcher tracks and fail it if the
/// cancellation predicate holds. A transfer that is no longer found, or
/// not yet cancellation-eligible, is left alone.
async fn attempt_cancel_on_expiry(
    client: &NodeApiClient,
    config: &Config,
    watcher: &Watcher,
) -> Result<()> {
    let Some((transfer, _)) = find_transfer(client, watcher).await? else {
        return Ok(());
    };
    if is_cancellation_eligible(&transfer, config.watcher.duration_rcv_transfer) {
        client
            .failtransfers(&watcher.wallet, transfer.batch_transfer_idx)
            .await
            .context("wallet/failtransfers")?;
    }
    Ok(())
}

/// Locate the transfer this watcher is tracking by `recipient_id`. If the
/// watcher doesn't yet know its `asset_id`, search the detached list first,
/// then every asset's transfer list, returning the asset it was found
/// under so the caller can persist that discovery.
async fn find_transfer(
    client: &NodeApiClient,
    watcher: &Watcher,
) -> Result<Option<(Transfer, Option<String>)>> {
    if let Some(asset_id) = &watcher.asset_id {
        let transfers = client
            .listtransfers(&watcher.wallet, Some(asset_id))
            .await
            .context("wallet/listtransfers")?;
        return Ok(transfers
            .into_iter()
            .find(|t| t.recipient_id == watcher.recipient_id)
            .map(|t| (t, None)));
    }

    let detached = client
        .listtransfers(&watcher.wallet, None)
        .await
        .context("wallet/listtransfers (detached)")?;
    if let Some(t) = detached.into_iter().find(|t| t.recipient_id == watcher.recipient_id) {
        return Ok(Some((t, None)));
    }

    let assets = client
        .listassets(&watcher.wallet)
        .await
        .context("wallet/listassets")?;
    for asset in assets {
        let transfers = client
            .listtransfers(&watcher.wallet, Some(&asset.asset_id))
            .await
            .with_context(|| format!("wallet/listtransfers (asset {})", asset.asset_id))?;
        if let Some(t) = transfers.into_iter().find(|t| t.recipient_id == watcher.recipient_id) {
            return Ok(Some((t, Some(asset.asset_id))));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(
        status: TransferStatus,
        kind: TransferKind,
        expiration: Option<i64>,
    ) -> Transfer {
        Transfer {
            recipient_id: "R1".to_string(),
            asset_id: Some("A1".to_string()),
            status,
            kind,
            batch_transfer_idx: 1,
            expiration,
        }
    }

    #[test]
    fn test_cancellation_eligible_for_expired_blind_receive() {
        let past = chrono::Utc::now().timestamp() - 100;
        let t = transfer(
            TransferStatus::WaitingCounterparty,
            TransferKind::ReceiveBlind,
            Some(past),
        );
        assert!(is_cancellation_eligible(&t, Duration::from_secs(0)));
    }

    #[test]
    fn test_not_cancellation_eligible_when_not_expired() {
        let future = chrono::Utc::now().timestamp() + 100;
        let t = transfer(
            TransferStatus::WaitingCounterparty,
            TransferKind::ReceiveBlind,
            Some(future),
        );
        assert!(!is_cancellation_eligible(&t, Duration::from_secs(0)));
    }

    #[test]
    fn test_not_cancellation_eligible_when_settled() {
        let past = chrono::Utc::now().timestamp() - 100;
        let t = transfer(TransferStatus::Settled, TransferKind::ReceiveBlind, Some(past));
        assert!(!is_cancellation_eligible(&t, Duration::from_secs(0)));
    }

    #[test]
    fn test_non_blind_waits_for_grace_window() {
        let expiration = chrono::Utc::now().timestamp() - 10;
        let t = transfer(
            TransferStatus::WaitingCounterparty,
            TransferKind::Other,
            Some(expiration),
        );
        // Still within the grace window: not yet eligible.
        assert!(!is_cancellation_eligible(&t, Duration::from_secs(3600)));
        // Grace window has elapsed: now eligible.
        assert!(is_cancellation_eligible(&t, Duration::from_secs(5)));
    }

    #[test]
    fn test_no_expiration_never_eligible() {
        let t = transfer(TransferStatus::WaitingCounterparty, TransferKind::ReceiveBlind, None);
        assert!(!is_cancellation_eligible(&t, Duration::from_secs(0)));
    }

    #[test]
    fn test_is_expired_true_for_past_expires_at() {
        let watcher = Watcher {
            wallet: common::types::WalletTriple::new("van1", "col1", "fp1"),
            recipient_id: "R1".to_string(),
            asset_id: None,
            status: WatcherStatus::Watching,
            refresh_count: 0,
            last_refresh: None,
            created_at: String::new(),
            expires_at: "2000-01-01 00:00:00".to_string(),
        };
        assert!(is_expired(&watcher));
    }

    #[test]
    fn test_is_expired_false_for_future_expires_at() {
        let watcher = Watcher {
            wallet: common::types::WalletTriple::new("van1", "col1", "fp1"),
            recipient_id: "R1".to_string(),
            asset_id: None,
            status: WatcherStatus::Watching,
            refresh_count: 0,
            last_refresh: None,
            created_at: String::new(),
            expires_at: "2999-01-01 00:00:00".to_string(),
        };
        assert!(!is_expired(&watcher));
    }
}
