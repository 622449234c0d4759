use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "staybook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "staybook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "staybook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "staybook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "staybook_connections_rejected_total";

/// Counter: rejected logins (wrong email or password). Labels: role.
pub const LOGIN_FAILURES_TOTAL: &str = "staybook_login_failures_total";

/// Gauge: number of open sites (loaded engines).
pub const SITES_ACTIVE: &str = "staybook_sites_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "staybook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "staybook_wal_flush_batch_size";

// ── Business metrics ────────────────────────────────────────────

/// Counter: orders placed.
pub const ORDERS_PLACED_TOTAL: &str = "staybook_orders_placed_total";

/// Counter: orders cancelled. Labels: reason (user, tenant, expired).
pub const ORDERS_CANCELLED_TOTAL: &str = "staybook_orders_cancelled_total";

/// Counter: orders confirmed by the tenant.
pub const ORDERS_COMPLETED_TOTAL: &str = "staybook_orders_completed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::RegisterTenant { .. } => "register_tenant",
        Command::RegisterUser { .. } => "register_user",
        Command::Login { .. } => "login",
        Command::Logout => "logout",
        Command::SetSession { .. } => "set_session",
        Command::ResetSession => "reset_session",
        Command::VerifyUser { .. } => "verify_user",
        Command::ResendOtp { .. } => "resend_otp",
        Command::RequestPasswordReset { .. } => "request_password_reset",
        Command::ResetPassword { .. } => "reset_password",
        Command::ChangePassword { .. } => "change_password",
        Command::UpdateProfile { .. } => "update_profile",
        Command::SelectProfile { .. } => "select_profile",
        Command::InsertCategory { .. } => "insert_category",
        Command::UpdateCategory { .. } => "update_category",
        Command::DeleteCategory { .. } => "delete_category",
        Command::SelectCategories { .. } => "select_categories",
        Command::InsertProperty { .. } => "insert_property",
        Command::UpdateProperty { .. } => "update_property",
        Command::DeleteProperty { .. } => "delete_property",
        Command::SelectProperties { .. } => "select_properties",
        Command::SelectPropertyPrices => "select_property_prices",
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::SelectRooms { .. } => "select_rooms",
        Command::OpenDates { .. } => "open_dates",
        Command::CloseDate { .. } => "close_date",
        Command::SelectDates { .. } => "select_dates",
        Command::InsertImage { .. } => "insert_image",
        Command::SelectImage { .. } => "select_image",
        Command::PlaceOrder { .. } => "place_order",
        Command::UploadPaymentProof { .. } => "upload_payment_proof",
        Command::SetOrderStatus { .. } => "set_order_status",
        Command::SelectOrders { .. } => "select_orders",
        Command::SelectOrderReport => "select_order_report",
        Command::SubmitReview { .. } => "submit_review",
        Command::SelectReviews { .. } => "select_reviews",
        Command::SelectQuote { .. } => "select_quote",
        Command::SearchAvailability { .. } => "search_availability",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
