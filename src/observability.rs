use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "boardledger_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "boardledger_query_duration_seconds";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "boardledger_connections_active";

pub const CONNECTIONS_TOTAL: &str = "boardledger_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "boardledger_connections_rejected_total";

/// Gauge: tenants with a loaded engine.
pub const TENANTS_ACTIVE: &str = "boardledger_tenants_active";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "boardledger_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "boardledger_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "boardledger_wal_compactions_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: approval attempts. Labels: outcome (approved, conflict).
pub const APPROVALS_TOTAL: &str = "boardledger_approvals_total";

/// Counter: submissions refused by the booking policy validator.
pub const VALIDATION_REJECTIONS_TOTAL: &str = "boardledger_validation_rejections_total";

/// Counter: notices the booking collaborator failed to deliver.
pub const NOTIFY_FAILURES_TOTAL: &str = "boardledger_notify_failures_total";

/// Install the Prometheus exporter on `port`. Does nothing when unset; a
/// failure to bind is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://{addr}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Short, bounded-cardinality label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBillboard { .. } => "insert_billboard",
        Command::UpdatePolicy { .. } => "update_policy",
        Command::SubmitBooking { .. } => "submit_booking",
        Command::ApproveBooking { .. } => "approve_booking",
        Command::RejectBooking { .. } => "reject_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::ReleaseBlocks { .. } => "release_blocks",
        Command::InsertBlock { .. } => "insert_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::InsertOverride { .. } => "insert_override",
        Command::DeleteOverride { .. } => "delete_override",
        Command::SelectBillboards { .. } => "select_billboards",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBlocks { .. } => "select_blocks",
        Command::SelectOverrides { .. } => "select_overrides",
        Command::SelectDayStatus { .. } => "select_day_status",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectQuote { .. } => "select_quote",
    }
}
