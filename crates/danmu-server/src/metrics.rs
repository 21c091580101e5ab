//! Metrics collection and export for the danmu relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use danmu_core::DeliveryReport;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "danmu_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "danmu_connections_active";
    pub const MESSAGES_ACCEPTED: &str = "danmu_messages_accepted_total";
    pub const MESSAGES_REJECTED: &str = "danmu_messages_rejected_total";
    pub const DELIVERIES_TOTAL: &str = "danmu_deliveries_total";
    pub const DELIVERIES_FAILED: &str = "danmu_deliveries_failed_total";
    pub const ROOMS_ACTIVE: &str = "danmu_rooms_active";
    pub const LATENCY_SECONDS: &str = "danmu_latency_seconds";
    pub const ERRORS_TOTAL: &str = "danmu_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_ACCEPTED, "Danmu accepted and broadcast");
    metrics::describe_counter!(names::MESSAGES_REJECTED, "Danmu rejected, by reason");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Frames queued to room members");
    metrics::describe_counter!(
        names::DELIVERIES_FAILED,
        "Frames that could not be queued to a room member"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of occupied rooms");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound danmu processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of transport errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an accepted danmu and its fan-out.
pub fn record_accepted(delivery: &DeliveryReport) {
    counter!(names::MESSAGES_ACCEPTED).increment(1);
    record_delivery(delivery);
}

/// Record a rejected danmu.
pub fn record_rejection(kind: &'static str) {
    counter!(names::MESSAGES_REJECTED, "reason" => kind).increment(1);
}

/// Record the outcome of one fan-out.
pub fn record_delivery(report: &DeliveryReport) {
    counter!(names::DELIVERIES_TOTAL).increment(report.delivered as u64);
    counter!(names::DELIVERIES_FAILED).increment(report.failed() as u64);
}

/// Record inbound processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
