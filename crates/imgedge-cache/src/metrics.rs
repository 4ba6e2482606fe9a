//! Cache metrics.
//!
//! Counters are emitted through the `metrics` facade; the host process
//! installs whichever recorder it exports with. Without a recorder every
//! call is a no-op.

use metrics::{counter, histogram};
use std::time::Duration;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_REQUESTS_TOTAL: &str = "imgedge_cache_requests_total";
    pub const CACHE_STORE_TOTAL: &str = "imgedge_cache_store_total";
    pub const CACHE_STORE_DURATION_SECONDS: &str = "imgedge_cache_store_duration_seconds";
    pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "imgedge_circuit_transitions_total";
    pub const CACHE_FALLBACK_TOTAL: &str = "imgedge_cache_fallback_total";
}

// =============================================================================
// Request Metrics
// =============================================================================

/// Record the cache status of a served response, bucketed by path prefix.
pub fn record_cache_request(status: &str, bucket: &str) {
    counter!(
        names::CACHE_REQUESTS_TOTAL,
        "status" => status.to_string(),
        "bucket" => bucket.to_string()
    )
    .increment(1);
}

// =============================================================================
// Store Metrics
// =============================================================================

/// Record the outcome of a store operation (`edge`/`transform`, `ok`/`error`).
pub fn record_store_operation(store: &'static str, outcome: &'static str, duration: Duration) {
    counter!(
        names::CACHE_STORE_TOTAL,
        "store" => store,
        "outcome" => outcome
    )
    .increment(1);

    histogram!(names::CACHE_STORE_DURATION_SECONDS, "store" => store)
        .record(duration.as_secs_f64());
}

// =============================================================================
// Resilience Metrics
// =============================================================================

/// Record a circuit breaker state change.
pub fn record_circuit_transition(operation: &str, state: &'static str) {
    counter!(
        names::CIRCUIT_TRANSITIONS_TOTAL,
        "operation" => operation.to_string(),
        "state" => state
    )
    .increment(1);
}

/// Record a fallback to an uncached response, labelled by error code.
pub fn record_fallback(reason: &'static str) {
    counter!(names::CACHE_FALLBACK_TOTAL, "reason" => reason).increment(1);
}

/// Collapse a path to its first three segments to bound label cardinality.
///
/// `/images/products/2024/shoe.jpg` becomes `/images/products/2024`.
pub fn path_bucket(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).take(3).collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}
