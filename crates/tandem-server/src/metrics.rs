//! Metrics collection and export for Tandem.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tandem_core::{Delivery, Dispatch, SwitchboardStats};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tandem_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tandem_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "tandem_connections_rejected_total";
    pub const MESSAGES_TOTAL: &str = "tandem_messages_total";
    pub const MESSAGES_BYTES: &str = "tandem_messages_bytes";
    pub const SIGNALS_RELAYED: &str = "tandem_signals_relayed_total";
    pub const SIGNALS_DROPPED: &str = "tandem_signals_dropped_total";
    pub const ONLINE_IDENTITIES: &str = "tandem_online_identities";
    pub const WAITING_PARTICIPANTS: &str = "tandem_waiting_participants";
    pub const PAIRING_SESSIONS: &str = "tandem_pairing_sessions";
    pub const LATENCY_SECONDS: &str = "tandem_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tandem_errors_total";
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
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Upgrade requests refused before admission"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(names::SIGNALS_RELAYED, "Messages delivered to a peer");
    metrics::describe_counter!(names::SIGNALS_DROPPED, "Messages dropped by reason");
    metrics::describe_gauge!(
        names::ONLINE_IDENTITIES,
        "Identities holding a direct-call connection"
    );
    metrics::describe_gauge!(
        names::WAITING_PARTICIPANTS,
        "Random-call participants waiting for a partner"
    );
    metrics::describe_gauge!(names::PAIRING_SESSIONS, "Active random-call pairings");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Message processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

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

/// Record a new connection on `endpoint`.
pub fn record_connection(endpoint: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "endpoint" => endpoint).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE, "endpoint" => endpoint).increment(1.0);
}

/// Record a disconnection from `endpoint`.
pub fn record_disconnection(endpoint: &'static str) {
    gauge!(names::CONNECTIONS_ACTIVE, "endpoint" => endpoint).decrement(1.0);
}

/// Record a refused upgrade.
pub fn record_rejection(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record an inbound message and what became of it.
pub fn record_dispatch(bytes: usize, dispatch: &Dispatch) {
    counter!(names::MESSAGES_TOTAL, "direction" => "inbound").increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => "inbound").increment(bytes as u64);

    match dispatch {
        Dispatch::Forwarded(Delivery::Delivered) => {
            counter!(names::SIGNALS_RELAYED).increment(1);
        }
        Dispatch::Forwarded(Delivery::Dropped(reason)) => {
            counter!(names::SIGNALS_DROPPED, "reason" => reason.as_str()).increment(1);
        }
        Dispatch::Malformed => record_error("malformed"),
        Dispatch::Heartbeat | Dispatch::Ignored => {}
    }
}

/// Record an outbound message.
pub fn record_outbound(bytes: usize) {
    counter!(names::MESSAGES_TOTAL, "direction" => "outbound").increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => "outbound").increment(bytes as u64);
}

/// Record message latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update the relay gauges.
pub fn set_switchboard_stats(stats: &SwitchboardStats) {
    gauge!(names::ONLINE_IDENTITIES).set(stats.online as f64);
    gauge!(names::WAITING_PARTICIPANTS).set(stats.waiting as f64);
    gauge!(names::PAIRING_SESSIONS).set(stats.sessions as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    endpoint: &'static str,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(endpoint: &'static str) -> Self {
        record_connection(endpoint);
        Self { endpoint }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection(self.endpoint);
    }
}
