use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bookdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bookdesk_query_duration_seconds";

/// Counter: booking writes rejected because the range was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "bookdesk_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookdesk_connections_rejected_total";

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "bookdesk_tenants_active";

/// Counter: failed logins.
pub const AUTH_FAILURES_TOTAL: &str = "bookdesk_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookdesk_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "bookdesk_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(io::Error::other)?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser(_) => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertService(_) => "insert_service",
        Command::UpdateService { .. } => "update_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertStaff(_) => "insert_staff",
        Command::UpdateStaff { .. } => "update_staff",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::InsertBooking(_) => "insert_booking",
        Command::BatchInsertBookings(_) => "batch_insert_bookings",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectUsers { .. } => "select_users",
        Command::SelectServices { .. } => "select_services",
        Command::SelectStaff { .. } => "select_staff",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectConflict { .. } => "select_conflict",
    }
}
