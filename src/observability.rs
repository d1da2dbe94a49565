use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

/// Counter: committed transactions.
pub const TXN_COMMITS_TOTAL: &str = "slotbook_txn_commits_total";

/// Counter: transactions that ended in an error. Labels: op.
pub const TXN_ABORTS_TOTAL: &str = "slotbook_txn_aborts_total";

/// Counter: transaction re-runs after row lock contention. Labels: op.
pub const TXN_RETRIES_TOTAL: &str = "slotbook_txn_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: sessions currently stored.
pub const SESSIONS_ACTIVE: &str = "slotbook_sessions_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install the tracing subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProvider { .. } => "insert_provider",
        Command::InsertConsumer { .. } => "insert_consumer",
        Command::InsertSlot { .. } => "insert_slot",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectProviders { .. } => "select_providers",
        Command::SelectConsumers { .. } => "select_consumers",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectHistory { .. } => "select_history",
        Command::Login { .. } => "login",
        Command::SelectSession { .. } => "select_session",
        Command::DeleteSession { .. } => "delete_session",
    }
}
