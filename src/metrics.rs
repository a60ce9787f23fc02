//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Session lifecycle and state transitions
//! - Reconciliation outcomes (imported / evicted / skipped / errors)
//! - Transport deliveries and historical sync progress
//! - Bus publishing and dropped messages
//! - Federation index writes
//! - Checkpoint persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `federation_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions (duration, size).
//!
//! # Usage
//!
//! ```rust,no_run
//! use federation_engine::metrics;
//! use std::time::Duration;
//!
//! // After a reconcile pass
//! metrics::record_reconcile("edge-1", 12, 0, 3, 0, Duration::from_millis(40));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record the engine state (for dashboards).
pub fn set_engine_state(state: &str) {
    gauge!("federation_engine_state", "state" => state.to_string()).set(1.0);
}

/// Record the number of live sessions.
pub fn set_session_count(count: usize) {
    gauge!("federation_sessions").set(count as f64);
}

/// Record a session state transition.
pub fn record_session_state(edge_id: &str, state: &str) {
    counter!("federation_session_transitions_total", "edge_id" => edge_id.to_string(), "state" => state.to_string()).increment(1);
}

/// Record a session connect attempt outcome.
pub fn record_session_connect(edge_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("federation_session_connects_total", "edge_id" => edge_id.to_string(), "status" => status).increment(1);
}

/// Record a delivery received from a transport.
pub fn record_delivery(edge_id: &str, added: usize, removed: usize, realtime: bool) {
    let mode = if realtime { "live" } else { "historical" };
    counter!("federation_deliveries_total", "edge_id" => edge_id.to_string(), "mode" => mode.to_string()).increment(1);
    counter!("federation_delivered_items_total", "edge_id" => edge_id.to_string()).increment((added + removed) as u64);
}

/// Record a reconcile pass outcome.
pub fn record_reconcile(
    edge_id: &str,
    imported: usize,
    evicted: usize,
    skipped: usize,
    errors: usize,
    duration: Duration,
) {
    counter!("federation_items_imported_total", "edge_id" => edge_id.to_string()).increment(imported as u64);
    counter!("federation_items_evicted_total", "edge_id" => edge_id.to_string()).increment(evicted as u64);
    counter!("federation_items_skipped_total", "edge_id" => edge_id.to_string()).increment(skipped as u64);
    if errors > 0 {
        counter!("federation_reconcile_errors_total", "edge_id" => edge_id.to_string()).increment(errors as u64);
    }
    histogram!("federation_reconcile_duration_seconds", "edge_id" => edge_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record one historical sync poll.
pub fn record_historical_poll(edge_id: &str, items: usize) {
    counter!("federation_historical_polls_total", "edge_id" => edge_id.to_string()).increment(1);
    counter!("federation_historical_items_total", "edge_id" => edge_id.to_string()).increment(items as u64);
}

/// Record a bus publish and how many receivers saw it.
pub fn record_bus_publish(topic: &str, receivers: usize) {
    counter!("federation_bus_publishes_total", "topic" => topic.to_string()).increment(1);
    histogram!("federation_bus_receivers", "topic" => topic.to_string()).record(receivers as f64);
}

/// Record an inbound bus message dropped before reconciliation.
pub fn record_bus_message_dropped(edge_id: &str, reason: &str) {
    counter!("federation_bus_messages_dropped_total", "edge_id" => edge_id.to_string(), "reason" => reason.to_string()).increment(1);
}

/// Record a federation index insert decision.
pub fn record_index_insert(allowed: bool) {
    let status = if allowed { "allowed" } else { "denied" };
    counter!("federation_index_inserts_total", "status" => status).increment(1);
}

/// Record a federation index removal.
pub fn record_index_remove() {
    counter!("federation_index_removes_total").increment(1);
}

/// Record an index read that degraded to empty results.
pub fn record_index_degraded_read(query: &str) {
    counter!("federation_index_degraded_reads_total", "query" => query.to_string()).increment(1);
}

/// Record checkpoint flush batch (debounced writes).
pub fn record_checkpoint_flush(flushed: usize, errors: usize) {
    counter!("federation_checkpoint_flushes_total").increment(1);
    counter!("federation_checkpoint_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("federation_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_checkpoint_retry(operation: &str) {
    counter!("federation_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}
