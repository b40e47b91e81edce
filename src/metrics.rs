//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Registry registrations and CAS conflicts
//! - Upstream health and reads
//! - Local apply progress and cursor flushes
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `pipe_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use pipe_replication::metrics;
//! use std::time::Duration;
//!
//! // In the pull loop after a batch was applied
//! metrics::record_upstream_read("http://10.0.4.10:8080/", 42, Duration::from_millis(12));
//! metrics::record_messages_applied(42);
//! ```

use crate::circuit_breaker::CircuitState;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Registry Metrics
// =============================================================================

/// Record a successful registration and the attempt it landed on.
pub fn record_registration(group_id: &str, attempt: usize) {
    counter!("pipe_registrations_total", "group" => group_id.to_string()).increment(1);
    histogram!("pipe_registration_attempts", "group" => group_id.to_string()).record(attempt as f64);
}

/// Record a lost compare-and-swap on a group row.
pub fn record_cas_conflict(group_id: &str) {
    counter!("pipe_registry_cas_conflicts_total", "group" => group_id.to_string()).increment(1);
}

/// Record a registration that gave up after its retry budget.
pub fn record_registration_exhausted(group_id: &str) {
    counter!("pipe_registrations_exhausted_total", "group" => group_id.to_string()).increment(1);
}

/// Record nodes demoted to offline during a registration.
pub fn record_offline_demoted(group_id: &str, count: usize) {
    counter!("pipe_nodes_demoted_offline_total", "group" => group_id.to_string()).increment(count as u64);
}

/// Record an administrative node removal.
pub fn record_node_deleted(group_id: &str) {
    counter!("pipe_nodes_deleted_total", "group" => group_id.to_string()).increment(1);
}

/// Record a bootstrap instruction handed to (or run by) a node.
pub fn record_bootstrap(kind: &str) {
    counter!("pipe_bootstraps_total", "type" => kind.to_string()).increment(1);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_sqlite_retry(operation: &str) {
    counter!("pipe_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Node Registration Metrics
// =============================================================================

/// Record a node-side registration call outcome.
pub fn record_registration_call(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("pipe_registration_calls_total", "status" => status).increment(1);
    histogram!("pipe_registration_call_duration_seconds").record(duration.as_secs_f64());
}

/// Gauge for the length of the follow chain in use.
pub fn set_follow_chain_len(len: usize) {
    gauge!("pipe_follow_chain_length").set(len as f64);
}

// =============================================================================
// Upstream Metrics
// =============================================================================

/// Record an upstream going up or down.
pub fn record_upstream_state(url: &str, up: bool) {
    let state = if up { "up" } else { "down" };
    counter!("pipe_upstream_transitions_total", "upstream" => url.to_string(), "state" => state).increment(1);
    gauge!("pipe_upstream_up", "upstream" => url.to_string()).set(if up { 1.0 } else { 0.0 });
}

/// Record an upstream read.
pub fn record_upstream_read(url: &str, count: usize, duration: Duration) {
    counter!("pipe_upstream_reads_total", "upstream" => url.to_string()).increment(1);
    if count > 0 {
        counter!("pipe_upstream_messages_read_total", "upstream" => url.to_string()).increment(count as u64);
    }
    histogram!("pipe_upstream_read_duration_seconds", "upstream" => url.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed upstream read by error type.
pub fn record_upstream_error(url: &str, error_type: &str) {
    counter!(
        "pipe_upstream_errors_total",
        "upstream" => url.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a health probe result.
pub fn record_health_probe(url: &str, success: bool, latency: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("pipe_health_probes_total", "upstream" => url.to_string(), "status" => status).increment(1);
    histogram!("pipe_health_probe_duration_seconds", "upstream" => url.to_string())
        .record(latency.as_secs_f64());
}

/// Record a read rejected by the serving-side rate limiter.
pub fn record_read_throttled() {
    counter!("pipe_reads_throttled_total").increment(1);
}

// =============================================================================
// Apply Metrics
// =============================================================================

/// Record messages written to the local pipe.
pub fn record_messages_applied(count: usize) {
    counter!("pipe_messages_applied_total").increment(count as u64);
}

/// Gauge for the local offset of a cursor.
pub fn set_cursor_offset(location: &str, offset: u64) {
    gauge!("pipe_cursor_offset", "location" => location.to_string()).set(offset as f64);
}

/// Gauge for how far the local pipe is behind the global head.
pub fn set_replication_lag(lag: u64) {
    gauge!("pipe_replication_lag_offsets").set(lag as f64);
}

/// Record cursor flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize) {
    counter!("pipe_cursor_flushes_total").increment(1);
    counter!("pipe_cursor_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("pipe_cursor_flush_errors_total").increment(errors as u64);
    }
}

/// Gauge for node state.
pub fn set_node_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("pipe_node_state").set(value);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "pipe_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: CircuitState) {
    gauge!("pipe_circuit_state", "circuit" => circuit_name.to_string()).set(state as i32 as f64);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!("pipe_circuit_rejections_total", "circuit" => circuit_name.to_string()).increment(1);
}
