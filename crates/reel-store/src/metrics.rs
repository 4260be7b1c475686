//! Job store metrics.
//!
//! - Operation counters by outcome
//! - Fan-in trigger and duplicate counters
//! - Retry counters

use metrics::counter;

/// Metric name constants for consistency.
pub mod names {
    /// Store operations by operation and outcome.
    pub const OPERATIONS_TOTAL: &str = "job_store_operations_total";

    /// Fan-in transitions (exactly one per composed job).
    pub const FAN_IN_TRIGGERS_TOTAL: &str = "job_store_fan_in_triggers_total";

    /// Scene completions that were already counted.
    pub const DUPLICATE_INCREMENTS_TOTAL: &str = "job_store_duplicate_increments_total";

    /// Retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "job_store_retries_total";

    /// Jobs removed by the retention sweep.
    pub const EXPIRED_TOTAL: &str = "job_store_expired_total";
}

/// Record the outcome of a store operation.
pub fn record_operation(operation: &'static str, outcome: &'static str) {
    counter!(
        names::OPERATIONS_TOTAL,
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_fan_in() {
    counter!(names::FAN_IN_TRIGGERS_TOTAL).increment(1);
}

pub fn record_duplicate_increment() {
    counter!(names::DUPLICATE_INCREMENTS_TOTAL).increment(1);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_expired(count: usize) {
    counter!(names::EXPIRED_TOTAL).increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::OPERATIONS_TOTAL.starts_with("job_store_"));
        assert!(names::FAN_IN_TRIGGERS_TOTAL.contains("fan_in"));
        assert!(names::RETRIES_TOTAL.contains("retries"));
    }
}
