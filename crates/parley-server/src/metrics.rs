//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::{Dispatched, DropReason, FanOut, RouteOutcome};
use parley_protocol::EnvelopeKind;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const ENVELOPES_TOTAL: &str = "parley_envelopes_total";
    pub const ENVELOPES_BYTES: &str = "parley_envelopes_bytes";
    pub const PAYLOADS_DROPPED: &str = "parley_payloads_dropped_total";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const LATENCY_SECONDS: &str = "parley_latency_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
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
    metrics::describe_counter!(names::ENVELOPES_TOTAL, "Total number of envelopes processed");
    metrics::describe_counter!(names::ENVELOPES_BYTES, "Total bytes of envelopes processed");
    metrics::describe_counter!(
        names::PAYLOADS_DROPPED,
        "Payloads not delivered, by reason"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of call rooms");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Envelope processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

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

/// Record one envelope.
pub fn record_envelope(kind: EnvelopeKind, bytes: usize, direction: &'static str) {
    counter!(names::ENVELOPES_TOTAL, "kind" => kind.as_str(), "direction" => direction)
        .increment(1);
    counter!(names::ENVELOPES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record one payload written to a connection.
pub fn record_outbound(bytes: usize) {
    counter!(names::ENVELOPES_BYTES, "direction" => "outbound").increment(bytes as u64);
}

/// Record dropped payloads.
pub fn record_dropped(reason: &'static str, count: usize) {
    if count > 0 {
        counter!(names::PAYLOADS_DROPPED, "reason" => reason).increment(count as u64);
    }
}

/// Record what became of a dispatched envelope.
pub fn record_dispatched(dispatched: &Dispatched) {
    match dispatched {
        Dispatched::Chat(RouteOutcome::Delivered { recipients, .. }) => record_fan_out(recipients),
        Dispatched::Chat(RouteOutcome::Dropped(reason)) => {
            record_dropped(reason.as_str(), 1);
            if *reason == DropReason::StoreFailure {
                record_error("store");
            }
        }
        Dispatched::Signal(fan_out) => record_fan_out(fan_out),
        Dispatched::Ignored => record_dropped("unknown_type", 1),
    }
}

fn record_fan_out(fan_out: &FanOut) {
    record_dropped("queue_full", fan_out.dropped);
    record_dropped("offline", fan_out.offline.len());
}

/// Record processing latency.
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
