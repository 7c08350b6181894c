//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (connections, streams, handshakes, dials)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `vsock2http2_connections_accepted_total` (counter): inbound connections by transport
//! - `vsock2http2_active_connections` (gauge): inbound connections being served
//! - `vsock2http2_handshake_failures_total` (counter): by side (inbound/outbound)
//! - `vsock2http2_active_streams` (gauge): paired streams in flight
//! - `vsock2http2_streams_total` (counter): finished streams by outcome
//! - `vsock2http2_stream_duration_seconds` (histogram): stream lifetime
//! - `vsock2http2_backend_dials_total` (counter): by outcome
//! - `vsock2http2_pooled_connections` (gauge): open backend connections
//!
//! # Design Decisions
//! - Low-overhead metric updates through the `metrics` facade
//! - Recording before an exporter is installed is a no-op

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter and its HTTP scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_accepted(transport: &'static str) {
    counter!("vsock2http2_connections_accepted_total", "transport" => transport).increment(1);
    gauge!("vsock2http2_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("vsock2http2_active_connections").decrement(1.0);
}

pub fn record_handshake_failure(side: &'static str) {
    counter!("vsock2http2_handshake_failures_total", "side" => side).increment(1);
}

pub fn record_stream_started() {
    gauge!("vsock2http2_active_streams").increment(1.0);
}

pub fn record_stream_finished(outcome: &'static str, started: Instant) {
    gauge!("vsock2http2_active_streams").decrement(1.0);
    counter!("vsock2http2_streams_total", "outcome" => outcome).increment(1);
    histogram!("vsock2http2_stream_duration_seconds", "outcome" => outcome)
        .record(started.elapsed().as_secs_f64());
}

pub fn record_backend_dial(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("vsock2http2_backend_dials_total", "outcome" => outcome).increment(1);
}

pub fn record_pooled_connection_opened() {
    gauge!("vsock2http2_pooled_connections").increment(1.0);
}

pub fn record_pooled_connection_closed() {
    gauge!("vsock2http2_pooled_connections").decrement(1.0);
}
