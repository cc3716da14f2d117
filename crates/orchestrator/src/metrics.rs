use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::Matcher;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

const HISTOGRAM_BUCKETS_MS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

const HISTOGRAM_BUCKETS_SECONDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

pub fn describe() {
    describe_counter!(
        "tracing_error_events",
        "Cumulative count of all ERROR-level tracing events."
    );
    describe_histogram!(
        "orchestrator_db_query_latency_ms",
        "SQLite DB operation total latency in milliseconds (queue wait + execution)."
    );
    describe_counter!(
        "orchestrator_db_query_errors_total",
        "SQLite DB operation errors, labeled by op."
    );
    describe_gauge!(
        "orchestrator_db_file_size_bytes",
        "SQLite database file size in bytes."
    );
    describe_gauge!(
        "orchestrator_db_wal_size_bytes",
        "SQLite WAL file size in bytes (0 if not present)."
    );
    describe_counter!(
        "orchestrator_wal_checkpoint_total",
        "WAL checkpoint attempts, labeled by status (ok/busy)."
    );
    describe_gauge!(
        "orchestrator_wal_checkpoint_pages",
        "Pages checkpointed back into the main database on the last WAL checkpoint."
    );

    describe_counter!(
        "orchestrator_jobs_enqueued_total",
        "Refresh jobs enqueued, labeled by trigger."
    );
    describe_counter!(
        "orchestrator_jobs_completed_total",
        "Refresh jobs that finished processing, labeled by outcome (completed/failed/lock_skipped)."
    );
    describe_histogram!(
        "orchestrator_job_handler_duration_ms",
        "Wall-clock time to run one job through the Job Handler."
    );

    describe_counter!(
        "orchestrator_watchers_created_total",
        "Transfer watchers registered."
    );
    describe_counter!(
        "orchestrator_watcher_ticks_total",
        "Watcher tick attempts, labeled by outcome (settled/failed/expired/still_watching/lock_skipped)."
    );
    describe_gauge!(
        "orchestrator_active_watchers",
        "Watchers currently in the watching state, sampled per orchestrator poll."
    );

    describe_counter!(
        "orchestrator_lock_acquire_total",
        "Wallet lock acquisition attempts, labeled by outcome (acquired/skipped)."
    );

    describe_gauge!(
        "orchestrator_active_wallet_workers",
        "Wallet Worker tasks currently supervised by the orchestrator."
    );
    describe_counter!(
        "orchestrator_wallet_workers_spawned_total",
        "Wallet Worker tasks spawned since startup."
    );
    describe_counter!(
        "orchestrator_wallet_workers_reaped_total",
        "Wallet Worker tasks reaped after exit (idle timeout or cancellation), labeled by reason."
    );

    describe_counter!(
        "orchestrator_node_api_calls_total",
        "Calls made to the node's wallet HTTP API, labeled by endpoint and outcome."
    );
    describe_histogram!(
        "orchestrator_node_api_latency_ms",
        "Node API call latency in milliseconds, labeled by endpoint."
    );
}

pub fn install_prometheus(port: u16) -> Result<()> {
    // Bind to localhost by default. This keeps the metrics endpoint private on the host
    // (Grafana/Alloy can scrape via localhost) and avoids accidentally exposing it publicly.
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    // IMPORTANT: `install_recorder` only installs the recorder (no HTTP listener).
    // Use `install` to spawn the exporter task so /metrics is actually served.
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("orchestrator_node_api_latency_ms".to_string()),
            HISTOGRAM_BUCKETS_MS,
        )
        .map_err(anyhow::Error::from)?
        .set_buckets_for_metric(
            Matcher::Prefix("orchestrator_".to_string()),
            HISTOGRAM_BUCKETS_MS,
        )
        .map_err(anyhow::Error::from)?
        .with_http_listener(addr)
        .install()
        .map_err(anyhow::Error::msg)?;

    Ok(())
}
