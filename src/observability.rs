use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reservad_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reservad_query_duration_seconds";

/// Counter: writes refused by a conflict rule. Labels: reason.
pub const CONFLICTS_TOTAL: &str = "reservad_conflicts_total";

/// Counter: requests refused by the permission table. Labels: entity.
pub const DENIALS_TOTAL: &str = "reservad_denials_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservad_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservad_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservad_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "reservad_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "reservad_auth_failures_total";

/// Counter: lock waits that ran past the configured timeout. Labels: lock.
pub const LOCK_TIMEOUTS_TOTAL: &str = "reservad_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservad_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservad_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser(_) => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertCourse(_) => "insert_course",
        Command::UpdateCourse { .. } => "update_course",
        Command::DeleteCourse { .. } => "delete_course",
        Command::InsertRoom(_) => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertReservation(_) => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectUsers { .. } => "select_users",
        Command::SelectCourses { .. } => "select_courses",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectOwnRooms => "select_own_rooms",
        Command::SelectOwnCourses => "select_own_courses",
        Command::SelectOwnReservations => "select_own_reservations",
        Command::SelectPeriods => "select_periods",
    }
}
