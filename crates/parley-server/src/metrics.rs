//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const HANDSHAKES_REJECTED: &str = "parley_handshakes_rejected_total";
    pub const EVENTS_TOTAL: &str = "parley_events_total";
    pub const FRAMES_TOTAL: &str = "parley_frames_total";
    pub const FRAMES_BYTES: &str = "parley_frames_bytes";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const LATENCY_SECONDS: &str = "parley_event_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of authenticated connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of authenticated connections"
    );
    metrics::describe_counter!(
        names::HANDSHAKES_REJECTED,
        "Total number of handshakes rejected as unauthenticated"
    );
    metrics::describe_counter!(
        names::EVENTS_TOTAL,
        "Total number of inbound events by kind and outcome"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by direction");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total frame bytes by direction");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of non-empty rooms");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("Invalid metrics address")?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a rejected handshake.
pub fn record_rejected_handshake() {
    counter!(names::HANDSHAKES_REJECTED).increment(1);
}

/// Record a handled inbound event.
pub fn record_event(kind: &'static str, success: bool) {
    let outcome = if success { "ok" } else { "failed" };
    counter!(names::EVENTS_TOTAL, "event" => kind, "outcome" => outcome).increment(1);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record event handling latency.
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

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder is installed; recording must still be a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_event("sendMessage", true);
        record_frame(12, "outbound");
    }

    #[test]
    fn test_metric_names_are_namespaced() {
        for name in [
            names::CONNECTIONS_TOTAL,
            names::EVENTS_TOTAL,
            names::FRAMES_BYTES,
            names::ROOMS_ACTIVE,
        ] {
            assert!(name.starts_with("parley_"));
        }
    }
}
