//! Prometheus metrics.
//!
//! Naming follows Prometheus conventions: `live_` prefix, `_total` for
//! counters, `_seconds` for durations.
//!
//! # Cardinality
//!
//! - `verb`: bounded by the module registry; unknown verbs are recorded as
//!   `unknown`
//! - `prefix`: bounded by the module registry
//! - `status`, `outcome`: a handful of fixed values

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Label used for verbs not in the registry.
pub const UNKNOWN_VERB: &str = "unknown";

/// A WebSocket connection was accepted.
pub fn connection_opened() {
    gauge!("live_connections_active").increment(1.0);
}

/// A WebSocket connection ended.
pub fn connection_closed() {
    gauge!("live_connections_active").decrement(1.0);
}

/// Metric: `live_auth_total{outcome}`.
///
/// `outcome` is `success` or the error code (`auth.invalid_token`, ...).
pub fn record_auth(outcome: &str) {
    counter!("live_auth_total", "outcome" => outcome.to_string()).increment(1);
}

/// Metric: `live_commands_total{verb,status}` and
/// `live_command_latency_seconds{prefix}`.
pub fn record_command(verb: &str, prefix: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };
    counter!("live_commands_total",
        "verb" => verb.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("live_command_latency_seconds", "prefix" => prefix.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `live_evictions_total`.
pub fn record_evictions(count: usize) {
    counter!("live_evictions_total").increment(u64::try_from(count).unwrap_or(u64::MAX));
}

/// Metric: `live_bbb_cost_refresh_total{status}`.
pub fn record_bbb_cost_refresh(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("live_bbb_cost_refresh_total", "status" => status).increment(1);
}
