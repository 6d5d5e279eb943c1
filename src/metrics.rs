//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Batch cursor progress and cold starts
//! - Sync state transitions
//! - Verification attempts and checksum mismatches
//! - Batch claim queries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `registry_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a handed-out cursor range and its width.
pub fn record_next_range(batcher_key: &str, len: u64) {
    counter!("registry_batcher_ranges_total", "key" => batcher_key.to_string()).increment(1);
    counter!("registry_batcher_ids_total", "key" => batcher_key.to_string()).increment(len);
}

/// Record a cursor cold start (cache miss or eviction).
pub fn record_cursor_cold_start(batcher_key: &str) {
    counter!("registry_batcher_cold_starts_total", "key" => batcher_key.to_string()).increment(1);
}

/// Record a sync state transition.
pub fn record_sync_transition(to: &str) {
    counter!("registry_sync_transitions_total", "to" => to.to_string()).increment(1);
}

/// Record a verification state transition.
pub fn record_verification_transition(to: &str) {
    counter!("registry_verification_transitions_total", "to" => to.to_string()).increment(1);
}

/// Record a checksum mismatch (content divergence, not a computation error).
pub fn record_checksum_mismatch() {
    counter!("registry_checksum_mismatches_total").increment(1);
}

/// Record a batch claim query: how many rows were claimed and how long the
/// claim took.
pub fn record_batch_claim(method: &str, count: usize, duration: Duration) {
    counter!("registry_batch_claims_total", "method" => method.to_string()).increment(1);
    counter!("registry_batch_claimed_rows_total", "method" => method.to_string())
        .increment(count as u64);
    histogram!("registry_batch_claim_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Record rows recovered by a timeout reaper.
pub fn record_timeout_recovery(kind: &str, count: u64) {
    counter!("registry_timeout_recoveries_total", "kind" => kind.to_string()).increment(count);
}

/// Record the current needs-verification backlog (bounded sample).
pub fn record_needs_verification(count: i64) {
    gauge!("registry_needs_verification").set(count as f64);
}
