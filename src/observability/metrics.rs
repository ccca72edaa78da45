//! Metrics collection and exposition.
//!
//! # Metrics
//! - `guard_requests_total` (counter): admission decisions by outcome
//! - `guard_rate_limited_total` (counter): denials by reason
//! - `guard_blocked_ips` (gauge): live blocklist size
//! - `guard_two_factor_attempts_total` (counter): 2FA attempts by method and result
//! - `guard_audit_events_total` (counter): recorded events by severity
//! - `guard_audit_write_failures_total` (counter): swallowed audit I/O failures
//! - `guard_integrity_issues` (gauge): issues found by the last integrity sweep
//!
//! Recording is a no-op until a recorder is installed, so library users
//! and tests pay nothing when metrics are disabled.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder with an HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_admission(outcome: &'static str) {
    counter!("guard_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_rate_limited(reason: &'static str) {
    counter!("guard_rate_limited_total", "reason" => reason).increment(1);
}

pub fn record_blocked_ips(count: usize) {
    gauge!("guard_blocked_ips").set(count as f64);
}

pub fn record_two_factor_attempt(method: &'static str, success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("guard_two_factor_attempts_total", "method" => method, "result" => result)
        .increment(1);
}

pub fn record_audit_event(severity: &'static str) {
    counter!("guard_audit_events_total", "severity" => severity).increment(1);
}

pub fn record_audit_write_failure() {
    counter!("guard_audit_write_failures_total").increment(1);
}

pub fn record_integrity_issues(count: usize) {
    gauge!("guard_integrity_issues").set(count as f64);
}
