use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

/// Counter: sessions booked.
pub const SESSIONS_BOOKED_TOTAL: &str = "slotd_sessions_booked_total";

/// Counter: sessions cancelled.
pub const SESSIONS_CANCELLED_TOTAL: &str = "slotd_sessions_cancelled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertExpert { .. } => "insert_expert",
        Command::InsertOverride { .. } => "insert_override",
        Command::DeleteOverride { .. } => "delete_override",
        Command::InsertWindow { .. } => "insert_window",
        Command::DeleteWindow { .. } => "delete_window",
        Command::InsertPurchase { .. } => "insert_purchase",
        Command::InsertSessions { .. } => "insert_sessions",
        Command::CancelSession { .. } => "cancel_session",
        Command::InsertFeedback { .. } => "insert_feedback",
        Command::InsertPayout { .. } => "insert_payout",
        Command::InsertClientPayment { .. } => "insert_client_payment",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectExperts => "select_experts",
        Command::SelectSessions { .. } => "select_sessions",
        Command::SelectPurchases { .. } => "select_purchases",
        Command::SelectEarnings => "select_earnings",
    }
}
