use anyhow::{Context, Result};
use std::time::Duration;

/// Process-wide configuration, loaded once from the environment at startup
/// and passed by explicit reference into every task — no ambient globals.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub orchestrator: OrchestratorConfig,
    pub wallet_worker: WalletWorkerConfig,
    pub watcher: WatcherConfig,
    pub retry: RetryConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub http_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub max_wallet_workers: usize,
    pub enable_recovery: bool,
}

#[derive(Debug, Clone)]
pub struct WalletWorkerConfig {
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub refresh_interval: Duration,
    pub watcher_ttl: Duration,
    pub invoice_created_watcher_ttl: Duration,
    pub wallet_lock_ttl: Duration,
    pub duration_rcv_transfer: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_refresh_retries: u32,
    pub retry_delay_base: Duration,
}

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub prometheus_port: u16,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    env_parsed(key, default_secs).map(Duration::from_secs)
}

impl Config {
    /// Load configuration from the process environment (12-factor style).
    ///
    /// Every key has a documented default, so a bare environment (e.g. in
    /// tests) still produces a usable config.
    pub fn load() -> Result<Self> {
        let config = Self {
            database: DatabaseConfig {
                path: env_string("DATABASE_PATH", "data/orchestrator.db"),
            },
            api: ApiConfig {
                base_url: env_string("API_URL", "http://localhost:8000"),
                http_timeout: env_secs("HTTP_TIMEOUT", 60).context("HTTP_TIMEOUT")?,
            },
            orchestrator: OrchestratorConfig {
                poll_interval: env_secs("POLL_INTERVAL", 1).context("POLL_INTERVAL")?,
                max_wallet_workers: env_parsed("MAX_WALLET_PROCESSES", 50_usize)
                    .context("MAX_WALLET_PROCESSES")?,
                enable_recovery: env_parsed("ENABLE_RECOVERY", true)
                    .context("ENABLE_RECOVERY")?,
            },
            wallet_worker: WalletWorkerConfig {
                poll_interval: env_secs("WALLET_WORKER_POLL_INTERVAL", 5)
                    .context("WALLET_WORKER_POLL_INTERVAL")?,
                idle_timeout: env_secs("WALLET_WORKER_IDLE_TIMEOUT", 60)
                    .context("WALLET_WORKER_IDLE_TIMEOUT")?,
            },
            watcher: WatcherConfig {
                refresh_interval: env_secs("REFRESH_INTERVAL", 30)
                    .context("REFRESH_INTERVAL")?,
                watcher_ttl: env_secs("WATCHER_TTL", 86_400).context("WATCHER_TTL")?,
                invoice_created_watcher_ttl: env_secs("INVOICE_CREATED_WATCHER_TTL", 180)
                    .context("INVOICE_CREATED_WATCHER_TTL")?,
                wallet_lock_ttl: env_secs("WALLET_LOCK_TTL", 30).context("WALLET_LOCK_TTL")?,
                // Source-protocol constant with no confirmed upstream value; defaulted
                // to one hour as a conservative placeholder, overridable by operators.
                duration_rcv_transfer: env_secs("DURATION_RCV_TRANSFER", 3_600)
                    .context("DURATION_RCV_TRANSFER")?,
            },
            retry: RetryConfig {
                max_refresh_retries: env_parsed("MAX_REFRESH_RETRIES", 10_u32)
                    .context("MAX_REFRESH_RETRIES")?,
                retry_delay_base: env_secs("RETRY_DELAY_BASE", 5)
                    .context("RETRY_DELAY_BASE")?,
            },
            observability: ObservabilityConfig {
                log_level: env_string("RUST_LOG", "info"),
                prometheus_port: env_parsed("PROMETHEUS_PORT", 9100_u16)
                    .context("PROMETHEUS_PORT")?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "DATABASE_PATH must not be empty"
        );
        anyhow::ensure!(!self.api.base_url.is_empty(), "API_URL must not be empty");
        anyhow::ensure!(
            self.orchestrator.max_wallet_workers > 0,
            "MAX_WALLET_PROCESSES must be > 0"
        );
        anyhow::ensure!(
            self.wallet_worker.idle_timeout >= self.wallet_worker.poll_interval,
            "WALLET_WORKER_IDLE_TIMEOUT must be >= WALLET_WORKER_POLL_INTERVAL"
        );
        anyhow::ensure!(
            self.retry.max_refresh_retries > 0,
            "MAX_REFRESH_RETRIES must be > 0"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests mutate process environment; serialize them to avoid cross-test interference.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "DATABASE_PATH",
            "API_URL",
            "HTTP_TIMEOUT",
            "POLL_INTERVAL",
            "MAX_WALLET_PROCESSES",
            "ENABLE_RECOVERY",
            "WALLET_WORKER_POLL_INTERVAL",
            "WALLET_WORKER_IDLE_TIMEOUT",
            "REFRESH_INTERVAL",
            "WATCHER_TTL",
            "INVOICE_CREATED_WATCHER_TTL",
            "WALLET_LOCK_TTL",
            "DURATION_RCV_TRANSFER",
            "MAX_REFRESH_RETRIES",
            "RETRY_DELAY_BASE",
            "RUST_LOG",
            "PROMETHEUS_PORT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_load_with_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = Config::load().unwrap();
        assert_eq!(config.database.path, "data/orchestrator.db");
        assert_eq!(config.api.base_url, "http://localhost:8000");
        assert_eq!(config.orchestrator.poll_interval, Duration::from_secs(1));
        assert_eq!(config.orchestrator.max_wallet_workers, 50);
        assert!(config.orchestrator.enable_recovery);
        assert_eq!(config.wallet_worker.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.watcher.wallet_lock_ttl, Duration::from_secs(30));
        assert_eq!(config.retry.max_refresh_retries, 10);
    }

    #[test]
    fn test_load_respects_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MAX_WALLET_PROCESSES", "2");
        std::env::set_var("ENABLE_RECOVERY", "false");
        std::env::set_var("WALLET_LOCK_TTL", "45");
        let config = Config::load().unwrap();
        clear_env();
        assert_eq!(config.orchestrator.max_wallet_workers, 2);
        assert!(!config.orchestrator.enable_recovery);
        assert_eq!(config.watcher.wallet_lock_ttl, Duration::from_secs(45));
    }

    #[test]
    fn test_validate_rejects_zero_max_wallet_workers() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("MAX_WALLET_PROCESSES", "0");
        let result = Config::load();
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_idle_timeout_below_poll_interval() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("WALLET_WORKER_POLL_INTERVAL", "10");
        std::env::set_var("WALLET_WORKER_IDLE_TIMEOUT", "5");
        let result = Config::load();
        clear_env();
        assert!(result.is_err());
    }
}
