//! Metrics instrumentation.
//!
//! Uses the `metrics` crate facade; the host application chooses the
//! exporter. All metrics carry the `distd_cache_` prefix, counters end in
//! `_total`.

use metrics::counter;

/// A mutation applied to the local bucket (any source).
pub(crate) fn record_edit(cache: &str, op: &str, source_kind: &str) {
    counter!(
        "distd_cache_edits_total",
        "cache" => cache.to_string(),
        "op" => op.to_string(),
        "source" => source_kind.to_string()
    )
    .increment(1);
}

/// An item dropped because an internal queue was full or stopped.
pub(crate) fn record_queue_drop(queue: &'static str) {
    counter!("distd_cache_queue_dropped_total", "queue" => queue).increment(1);
}

/// A pub/sub payload that failed to parse or validate.
pub(crate) fn record_malformed_message() {
    counter!("distd_cache_malformed_messages_total").increment(1);
}

/// A PUBLISH that failed (the reconciler will repair).
pub(crate) fn record_publish_failure(cache: &str) {
    counter!("distd_cache_publish_failures_total", "cache" => cache.to_string()).increment(1);
}

/// A bucket pulled from Redis because its ETag diverged.
pub(crate) fn record_bucket_sync(cache: &str) {
    counter!("distd_cache_bucket_syncs_total", "cache" => cache.to_string()).increment(1);
}

/// One completed reconciliation pass over a cache.
pub(crate) fn record_sync_check(cache: &str) {
    counter!("distd_cache_sync_checks_total", "cache" => cache.to_string()).increment(1);
}
