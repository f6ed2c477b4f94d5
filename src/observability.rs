use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtside_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtside_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtside_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtside_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtside_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

// ── Booking pipeline ────────────────────────────────────────────

/// Counter: booking rows persisted. Labels: kind (recurring, single).
pub const BOOKINGS_CREATED_TOTAL: &str = "courtside_bookings_created_total";

/// Counter: writes refused because an active booking overlapped.
pub const CONFLICTS_REJECTED_TOTAL: &str = "courtside_conflicts_rejected_total";

/// Counter: recurring dates skipped for lack of a price row.
pub const PRICE_SKIPS_TOTAL: &str = "courtside_price_skips_total";

/// Counter: PAYING bookings removed by the sweeper.
pub const SWEEPER_RECLAIMED_TOTAL: &str = "courtside_sweeper_reclaimed_total";

/// Counter: sweeper iterations that hit an error on some booking.
pub const SWEEPER_ERRORS_TOTAL: &str = "courtside_sweeper_errors_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertGroup { .. } => "insert_group",
        Command::InsertCourt { .. } => "insert_court",
        Command::InsertSlot { .. } => "insert_slot",
        Command::InsertPrice { .. } => "insert_price",
        Command::DeletePrice { .. } => "delete_price",
        Command::InsertBookings { .. } => "insert_bookings",
        Command::InsertRecurring { .. } => "insert_recurring",
        Command::InsertPayment { .. } => "insert_payment",
        Command::InsertCompletion { .. } => "insert_completion",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::DeleteRecurring { .. } => "delete_recurring",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectPricePreview { .. } => "select_price_preview",
        Command::SelectBookingPreview { .. } => "select_booking_preview",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectRecurring { .. } => "select_recurring",
        Command::SelectRevenue { .. } => "select_revenue",
    }
}
