use anyhow::Result;
use rusqlite::Connection;

pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread). This is the
/// Store's single shared connection: there is no pool, because SQLite
/// serializes writers regardless, and `BEGIN IMMEDIATE` transactions
/// give us the same "skip locked" semantics a Postgres pool would need
/// `SELECT ... FOR UPDATE SKIP LOCKED` for.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys, busy_timeout),
    /// and run migrations — all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Startup migrations require a write lock. We can race with a second
        // orchestrator process restarting at the same time, or an operator's
        // ad-hoc sqlite3 session. If we hard-fail on `database is locked`,
        // systemd will crash-loop. Instead we retry migrations with backoff
        // until the lock clears.
        //
        // IMPORTANT: Use a short SQLite busy_timeout per attempt so we can handle backoff in Rust.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    // For normal runtime operations we still want a longer busy_timeout.
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: migration failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: migration failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying migrations"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    #[cfg(test)]
    pub async fn open_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    /// Run a closure on the background SQLite thread and return the result.
    ///
    /// The closure receives `&mut rusqlite::Connection` and can perform
    /// arbitrary sync SQLite operations. The result is sent back via oneshot
    /// channel.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    ///
    /// This measures the full wall-clock time of the operation, including queueing
    /// on the dedicated SQLite thread and execution of all SQL in the closure.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        match &res {
            Ok(_) => {
                metrics::histogram!(
                    "orchestrator_db_query_latency_ms",
                    "op" => op,
                    "status" => "ok"
                )
                .record(ms);
            }
            Err(_) => {
                metrics::histogram!(
                    "orchestrator_db_query_latency_ms",
                    "op" => op,
                    "status" => "err"
                )
                .record(ms);
                metrics::counter!("orchestrator_db_query_errors_total", "op" => op).increment(1);
            }
        }

        res
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // busy_timeout via the rusqlite API — makes SQLite retry for up to 30s
        // when the database is locked by another connection (concurrent workers).
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS refresh_jobs (
    job_id TEXT PRIMARY KEY,
    xpub_van TEXT NOT NULL,
    xpub_col TEXT NOT NULL,
    master_fingerprint TEXT NOT NULL,
    trigger TEXT NOT NULL CHECK (trigger IN ('sync', 'asset_sent', 'invoice_created', 'manual')),
    recipient_id TEXT,
    asset_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 10,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    processed_at TEXT,
    error_message TEXT,
    next_attempt_at TEXT
);

CREATE TABLE IF NOT EXISTS refresh_watchers (
    xpub_van TEXT NOT NULL,
    xpub_col TEXT NOT NULL,
    master_fingerprint TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    asset_id TEXT,
    status TEXT NOT NULL DEFAULT 'watching' CHECK (status IN ('watching', 'settled', 'failed', 'expired')),
    refresh_count INTEGER NOT NULL DEFAULT 0,
    last_refresh TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    expires_at TEXT NOT NULL,
    PRIMARY KEY (xpub_van, recipient_id)
);

CREATE TABLE IF NOT EXISTS wallet_locks (
    xpub_van TEXT PRIMARY KEY,
    locked_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,              -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,                     -- JSON with progress info
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_refresh_jobs_status ON refresh_jobs(status);
CREATE INDEX IF NOT EXISTS idx_refresh_jobs_created_at ON refresh_jobs(created_at);
CREATE INDEX IF NOT EXISTS idx_refresh_jobs_xpub_van ON refresh_jobs(xpub_van);
CREATE INDEX IF NOT EXISTS idx_refresh_jobs_recipient_id ON refresh_jobs(recipient_id);
CREATE INDEX IF NOT EXISTS idx_refresh_jobs_asset_id ON refresh_jobs(asset_id);
CREATE INDEX IF NOT EXISTS idx_refresh_watchers_status ON refresh_watchers(status);
CREATE INDEX IF NOT EXISTS idx_refresh_watchers_expires_at ON refresh_watchers(expires_at);
CREATE INDEX IF NOT EXISTS idx_refresh_watchers_xpub_van ON refresh_watchers(xpub_van);
CREATE INDEX IF NOT EXISTS idx_wallet_locks_expires_at ON wallet_locks(expires_at);
"#;
