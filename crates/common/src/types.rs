use serde::{Deserialize, Serialize};
use std::fmt;

/// The three identifiers that together address one wallet. `xpub_van` is
/// the sharding key: all locks and worker assignment are keyed on it alone,
/// but `xpub_col` and `master_fingerprint` travel alongside it because the
/// node's HTTP API requires all three on every call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletTriple {
    pub xpub_van: String,
    pub xpub_col: String,
    pub master_fingerprint: String,
}

impl WalletTriple {
    pub fn new(
        xpub_van: impl Into<String>,
        xpub_col: impl Into<String>,
        master_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            xpub_van: xpub_van.into(),
            xpub_col: xpub_col.into(),
            master_fingerprint: master_fingerprint.into(),
        }
    }
}

/// What caused a refresh job to be enqueued. Extensible by design: a tagged
/// variant rather than an open class hierarchy, since the handler's
/// dispatch rule only branches on one case (`invoice_created` without an
/// asset yet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Sync,
    AssetSent,
    InvoiceCreated {
        recipient_id: String,
        asset_id: Option<String>,
    },
    Manual,
}

impl Trigger {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::AssetSent => "asset_sent",
            Self::InvoiceCreated { .. } => "invoice_created",
            Self::Manual => "manual",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<&'static str> {
        match s {
            "sync" => Some("sync"),
            "asset_sent" => Some("asset_sent"),
            "invoice_created" => Some("invoice_created"),
            "manual" => Some("manual"),
            _ => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherStatus {
    Watching,
    Settled,
    Failed,
    Expired,
}

impl fmt::Display for WatcherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Watching => write!(f, "watching"),
            Self::Settled => write!(f, "settled"),
            Self::Failed => write!(f, "failed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl WatcherStatus {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "watching" => Some(Self::Watching),
            "settled" => Some(Self::Settled),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Watching)
    }
}

/// Status of a transfer as reported by `listtransfers`. Only the subset the
/// watcher and cancellation predicate care about is modeled; unrecognized
/// values fall back to `Other` rather than failing to deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    WaitingCounterparty,
    Settled,
    Failed,
    Expired,
    #[serde(other)]
    Other,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Failed | Self::Expired)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingCounterparty => write!(f, "WAITING_COUNTERPARTY"),
            Self::Settled => write!(f, "SETTLED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Other => write!(f, "OTHER"),
        }
    }
}

/// Transfer kind, as reported by the node. `RECEIVE_BLIND` is singled out by
/// the cancellation predicate; everything else falls back to `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferKind {
    ReceiveBlind,
    #[serde(other)]
    Other,
}

/// One transfer as reported by `listtransfers`.
#[derive(Debug, Clone, Deserialize)]
pub struct Transfer {
    pub recipient_id: String,
    pub asset_id: Option<String>,
    pub status: TransferStatus,
    pub kind: TransferKind,
    pub batch_transfer_idx: i64,
    /// Unix timestamp; `None` means the transfer has no expiration.
    pub expiration: Option<i64>,
}

/// One asset as reported by `listassets`.
#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub asset_id: String,
}

/// A durable unit of work against one wallet.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub wallet: WalletTriple,
    pub trigger: String,
    pub recipient_id: Option<String>,
    pub asset_id: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: String,
    pub processed_at: Option<String>,
    pub error_message: Option<String>,
}

/// A long-lived intent to monitor one transfer until it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct Watcher {
    pub wallet: WalletTriple,
    pub recipient_id: String,
    pub asset_id: Option<String>,
    pub status: WatcherStatus,
    pub refresh_count: u32,
    pub last_refresh: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_display_and_parse() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let s = status.to_string();
            assert_eq!(JobStatus::from_str_loose(&s), Some(status));
        }
        assert_eq!(JobStatus::from_str_loose("nope"), None);
    }

    #[test]
    fn test_watcher_status_terminal() {
        assert!(!WatcherStatus::Watching.is_terminal());
        assert!(WatcherStatus::Settled.is_terminal());
        assert!(WatcherStatus::Failed.is_terminal());
        assert!(WatcherStatus::Expired.is_terminal());
    }

    #[test]
    fn test_trigger_as_db_str() {
        assert_eq!(Trigger::Sync.as_db_str(), "sync");
        assert_eq!(Trigger::AssetSent.as_db_str(), "asset_sent");
        assert_eq!(Trigger::Manual.as_db_str(), "manual");
        let trigger = Trigger::InvoiceCreated {
            recipient_id: "R1".to_string(),
            asset_id: None,
        };
        assert_eq!(trigger.as_db_str(), "invoice_created");
    }

    #[test]
    fn test_transfer_status_serde_and_terminal() {
        let json = r#""WAITING_COUNTERPARTY""#;
        let status: TransferStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status, TransferStatus::WaitingCounterparty);
        assert!(!status.is_terminal());

        let settled: TransferStatus = serde_json::from_str(r#""SETTLED""#).unwrap();
        assert!(settled.is_terminal());

        let expired: TransferStatus = serde_json::from_str(r#""EXPIRED""#).unwrap();
        assert_eq!(expired, TransferStatus::Expired);
        assert!(expired.is_terminal());

        let unknown: TransferStatus = serde_json::from_str(r#""SOME_NEW_STATE""#).unwrap();
        assert_eq!(unknown, TransferStatus::Other);
    }

    #[test]
    fn test_transfer_kind_serde() {
        let kind: TransferKind = serde_json::from_str(r#""RECEIVE_BLIND""#).unwrap();
        assert_eq!(kind, TransferKind::ReceiveBlind);
        let other: TransferKind = serde_json::from_str(r#""SEND""#).unwrap();
        assert_eq!(other, TransferKind::Other);
    }

    #[test]
    fn test_wallet_triple_eq_and_hash() {
        use std::collections::HashSet;
        let a = WalletTriple::new("van1", "col1", "fp1");
        let b = WalletTriple::new("van1", "col1", "fp1");
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
