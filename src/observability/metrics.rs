//! Metrics collection and exposition.
//!
//! # Metrics
//! - `shield_requests_total` (counter): requests by method, status, route
//! - `shield_request_duration_seconds` (histogram): end-to-end latency
//! - `shield_decisions_total` (counter): limiter / ban-check outcomes
//! - `shield_bans_total`, `shield_bans_expired_total` (counters)
//! - `shield_active_bans` (gauge): size of the last rendered ban artifact
//! - `shield_chain_errors_total` (counter): failures by phase and middleware
//! - `shield_artifact_writes_total` (counter): artifact writes by result
//!
//! # Design Decisions
//! - Recording without an installed recorder is a no-op, so library code
//!   and tests never need to care whether the exporter is running

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::pipeline::Phase;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, route: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("route", route.to_string()),
    ];
    metrics::counter!("shield_requests_total", &labels).increment(1);
    metrics::histogram!("shield_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_decision(decision: &'static str) {
    metrics::counter!("shield_decisions_total", "decision" => decision).increment(1);
}

pub fn record_ban() {
    metrics::counter!("shield_bans_total").increment(1);
}

pub fn record_bans_expired(count: usize) {
    metrics::counter!("shield_bans_expired_total").increment(count as u64);
}

pub fn record_active_bans(count: usize) {
    metrics::gauge!("shield_active_bans").set(count as f64);
}

pub fn record_chain_error(phase: Phase, middleware: &str) {
    metrics::counter!(
        "shield_chain_errors_total",
        "phase" => phase.as_str(),
        "middleware" => middleware.to_string()
    )
    .increment(1);
}

pub fn record_artifact_write(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    metrics::counter!("shield_artifact_writes_total", "result" => result).increment(1);
}
