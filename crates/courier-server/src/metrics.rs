//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Each worker serves its own exporter.

use courier_core::{Delivery, EventStage, HubStats};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const HANDSHAKE_REJECTIONS: &str = "courier_handshake_rejections_total";
    pub const EVENTS_TOTAL: &str = "courier_events_total";
    pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
    pub const OFFLINE_DELIVERIES: &str = "courier_offline_deliveries_total";
    pub const PERSIST_FAILURES: &str = "courier_persist_failures_total";
    pub const BUS_ERRORS: &str = "courier_bus_errors_total";
    pub const GROUPS_ACTIVE: &str = "courier_groups_active";
    pub const ROUTE_SECONDS: &str = "courier_route_seconds";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of joined connections since worker start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of joined connections"
    );
    metrics::describe_counter!(
        names::HANDSHAKE_REJECTIONS,
        "Handshakes refused, by reason"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Inbound client events, by name");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Fan-out deliveries, by path");
    metrics::describe_counter!(
        names::OFFLINE_DELIVERIES,
        "User deliveries that found no live connection"
    );
    metrics::describe_counter!(names::PERSIST_FAILURES, "Events whose persistence failed");
    metrics::describe_counter!(names::BUS_ERRORS, "Events persisted but not published");
    metrics::describe_gauge!(names::GROUPS_ACTIVE, "Current number of local groups");
    metrics::describe_histogram!(names::ROUTE_SECONDS, "Event routing latency in seconds");

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

pub fn record_handshake_rejected(kind: &'static str) {
    counter!(names::HANDSHAKE_REJECTIONS, "reason" => kind).increment(1);
}

/// Record one routed event.
pub fn record_event(
    name: &'static str,
    path: &'static str,
    stage: EventStage,
    delivery: Option<Delivery>,
    elapsed: Duration,
) {
    counter!(names::EVENTS_TOTAL, "event" => name).increment(1);
    histogram!(names::ROUTE_SECONDS, "event" => name).record(elapsed.as_secs_f64());

    match stage {
        EventStage::Acked => {
            counter!(names::DELIVERIES_TOTAL, "path" => path).increment(1);
        }
        EventStage::PersistFailed => counter!(names::PERSIST_FAILURES).increment(1),
        // Persisted but not fanned out
        EventStage::Persisted => counter!(names::BUS_ERRORS).increment(1),
        _ => {}
    }
    if delivery.is_some_and(|d| d.is_unreachable()) {
        counter!(names::OFFLINE_DELIVERIES).increment(1);
    }
}

/// Update hub gauges.
pub fn set_hub_stats(stats: &HubStats) {
    gauge!(names::CONNECTIONS_ACTIVE).set(stats.connection_count as f64);
    gauge!(names::GROUPS_ACTIVE).set(stats.group_count as f64);
}

/// Metrics guard that records a joined connection until dropped.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
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
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
