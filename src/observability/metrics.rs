//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status, service
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_retries_total` (counter): retry attempts by service, class
//! - `gateway_circuit_transitions_total` (counter): breaker transitions
//! - `gateway_circuit_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `gateway_instance_health` (gauge): health score per instance
//! - `gateway_degraded_selections_total` (counter): below-floor fallbacks
//! - `gateway_registry_stale_total` (counter): stale cache reads
//! - `gateway_ws_connections_total` / `gateway_ws_rejections_total` (counters)
//! - `gateway_ws_active_connections` (gauge)

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::context::PriorityClass;
use crate::error::LimitScope;
use crate::resilience::CircuitState;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus metrics server started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start Prometheus exporter"),
    }
}

pub fn record_request(method: &str, status: u16, service: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("service", service.to_string()),
    ];
    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}

pub fn record_retry(service: &str, class: PriorityClass) {
    counter!(
        "gateway_retries_total",
        "service" => service.to_string(),
        "class" => class.as_str()
    )
    .increment(1);
}

pub fn record_circuit_transition(instance: &str, class: PriorityClass, to: CircuitState) {
    counter!(
        "gateway_circuit_transitions_total",
        "instance" => instance.to_string(),
        "class" => class.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
    gauge!(
        "gateway_circuit_state",
        "instance" => instance.to_string(),
        "class" => class.as_str()
    )
    .set(to.severity() as f64);
}

pub fn record_instance_health(service: &str, instance: &str, score: f64) {
    gauge!(
        "gateway_instance_health",
        "service" => service.to_string(),
        "instance" => instance.to_string()
    )
    .set(score);
}

pub fn record_degraded_selection(service: &str) {
    counter!("gateway_degraded_selections_total", "service" => service.to_string()).increment(1);
}

pub fn record_registry_stale(service: &str) {
    counter!("gateway_registry_stale_total", "service" => service.to_string()).increment(1);
}

pub fn record_ws_admitted(service: &str) {
    counter!("gateway_ws_connections_total", "service" => service.to_string()).increment(1);
}

pub fn record_ws_rejected(scope: LimitScope) {
    let scope = match scope {
        LimitScope::Global => "global",
        LimitScope::User => "user",
    };
    counter!("gateway_ws_rejections_total", "scope" => scope).increment(1);
}

pub fn record_ws_active(count: usize) {
    gauge!("gateway_ws_active_connections").set(count as f64);
}
