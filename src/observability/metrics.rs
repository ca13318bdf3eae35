//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status, phase
//! - `proxy_request_duration_seconds` (histogram): time to terminal phase
//! - `proxy_relayed_bytes_total` (counter): response bytes relayed to clients
//!
//! # Design Decisions
//! - Recorded through the `metrics` facade; without an installed exporter
//!   every call is a no-op
//! - Prometheus exporter is opt-in via `observability.metrics_enabled`

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Count one finished request.
pub fn record_request(method: &str, status: u16, phase: &'static str, start: Instant) {
    ::metrics::counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "phase" => phase
    )
    .increment(1);
    ::metrics::histogram!(
        "proxy_request_duration_seconds",
        "method" => method.to_string(),
        "phase" => phase
    )
    .record(start.elapsed().as_secs_f64());
}

/// Count bytes delivered to clients.
pub fn record_relayed_bytes(bytes: u64) {
    ::metrics::counter!("proxy_relayed_bytes_total").increment(bytes);
}
