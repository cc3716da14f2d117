use crate::types::{Asset, Transfer, WalletTriple};
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::debug;

/// Client for the node's own wallet HTTP API (`refresh`, `listassets`,
/// `listtransfers`, `failtransfers`). This is the orchestrator's only
/// outbound dependency — the node-internal asset/invoice/PSBT logic is
/// not reimplemented here, only called.
pub struct NodeApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl NodeApiClient {
    pub fn new(base_url: &str, http_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn request(&self, path: &str, wallet: &WalletTriple) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base_url))
            .header("xpub-van", wallet.xpub_van.clone())
            .header("xpub-col", wallet.xpub_col.clone())
            .header("master-fingerprint", wallet.master_fingerprint.clone())
    }

    /// `POST /wallet/refresh`. Not idempotent (has a side-effect on wallet
    /// state) but safe to retry.
    pub async fn refresh(&self, wallet: &WalletTriple) -> Result<()> {
        debug!(xpub_van = %wallet.xpub_van, "calling wallet/refresh");
        let resp = self
            .request("/wallet/refresh", wallet)
            .send()
            .await
            .with_context(|| format!("refresh failed for wallet {}", wallet.xpub_van))?;
        ensure_success(resp, "refresh").await
    }

    /// `POST /wallet/listassets`. Idempotent.
    pub async fn listassets(&self, wallet: &WalletTriple) -> Result<Vec<Asset>> {
        let resp = self
            .request("/wallet/listassets", wallet)
            .send()
            .await
            .with_context(|| format!("listassets failed for wallet {}", wallet.xpub_van))?;
        let resp = ensure_success_response(resp, "listassets").await?;
        resp.json()
            .await
            .context("failed to deserialize listassets response")
    }

    /// `POST /wallet/listtransfers`, optionally filtered by `asset_id`.
    /// With `asset_id = None`, returns *detached* transfers — those not yet
    /// bound to any listed asset. Idempotent.
    pub async fn listtransfers(
        &self,
        wallet: &WalletTriple,
        asset_id: Option<&str>,
    ) -> Result<Vec<Transfer>> {
        let mut req = self.request("/wallet/listtransfers", wallet);
        if let Some(asset_id) = asset_id {
            req = req.json(&serde_json::json!({ "asset_id": asset_id }));
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("listtransfers failed for wallet {}", wallet.xpub_van))?;
        let resp = ensure_success_response(resp, "listtransfers").await?;
        resp.json()
            .await
            .context("failed to deserialize listtransfers response")
    }

    /// `POST /wallet/failtransfers`. Cancels an expired pending transfer.
    /// Idempotent: re-failing an already-failed transfer is a no-op.
    pub async fn failtransfers(
        &self,
        wallet: &WalletTriple,
        batch_transfer_idx: i64,
    ) -> Result<()> {
        debug!(
            xpub_van = %wallet.xpub_van,
            batch_transfer_idx,
            "calling wallet/failtransfers"
        );
        let resp = self
            .request("/wallet/failtransfers", wallet)
            .json(&serde_json::json!({ "batch_transfer_idx": batch_transfer_idx }))
            .send()
            .await
            .with_context(|| format!("failtransfers failed for wallet {}", wallet.xpub_van))?;
        ensure_success(resp, "failtransfers").await
    }
}

async fn ensure_success(resp: reqwest::Response, call: &str) -> Result<()> {
    ensure_success_response(resp, call).await.map(drop)
}

async fn ensure_success_response(
    resp: reqwest::Response,
    call: &str,
) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("{call} returned {status}: {body}");
}
