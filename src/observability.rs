use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "citystage_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "citystage_query_duration_seconds";

/// Counter: booking transaction outcomes. Labels: outcome.
pub const BOOKING_OUTCOMES_TOTAL: &str = "citystage_booking_outcomes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "citystage_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "citystage_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "citystage_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "citystage_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "citystage_wal_flush_batch_size";

/// Counter: background WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "citystage_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
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
        Command::InsertLocation { .. } => "insert_location",
        Command::UpdateLocation { .. } => "update_location",
        Command::SelectLocations { .. } => "select_locations",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::SelectUsers { .. } => "select_users",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectSuggestions { .. } => "select_suggestions",
        Command::SelectSettings => "select_settings",
        Command::UpdateSetting { .. } => "update_setting",
    }
}
