// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = ($name, $value $(, $label, $label_value)*);
    }};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = ($name $(, $label, $label_value)*);
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = ($name, $value $(, $label, $label_value)*);
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {{
        let _ = ($name, $unit, $desc);
    }};
    ($name:expr, $desc:expr) => {{
        let _ = ($name, $desc);
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {{
        let _ = ($name, $desc);
    }};
}

// The exported stubs live at the crate root; unused ones are fine.
#[cfg(not(feature = "observability"))]
#[allow(unused_imports)]
use crate::{counter, describe_counter, describe_gauge, gauge};

/// Initializes the descriptions for all the metrics in the application.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "notifications_received_total",
        Unit::Count,
        "Log notifications forwarded from the feed to the pipeline."
    );
    describe_counter!(
        "messages_dropped_total",
        Unit::Count,
        "Feed messages dropped before reaching the pipeline, labeled by reason."
    );
    describe_counter!(
        "addresses_extracted_total",
        Unit::Count,
        "Valid addresses extracted from resolved transactions."
    );
    describe_counter!(
        "market_data_requests_total",
        Unit::Count,
        "Batched market data lookups, labeled by result (ok, http_error, malformed)."
    );
    describe_counter!(
        "pairs_cached_total",
        Unit::Count,
        "Market pair records written to the cache."
    );
    describe_counter!(
        "cache_write_failures_total",
        Unit::Count,
        "Per-pair cache writes that failed."
    );
    describe_counter!(
        "reconnect_attempts_total",
        Unit::Count,
        "Feed reconnection attempts."
    );
    describe_gauge!("tracked_addresses", "Addresses currently in the tracked set.");
}

pub fn increment_notifications_received() {
    counter!("notifications_received_total", 1);
}

pub fn increment_messages_dropped(reason: &'static str) {
    counter!("messages_dropped_total", 1, "reason" => reason);
}

pub fn increment_addresses_extracted(count: u64) {
    counter!("addresses_extracted_total", count);
}

pub fn increment_market_data_requests(result: &'static str) {
    counter!("market_data_requests_total", 1, "result" => result);
}

pub fn increment_pairs_cached(count: u64) {
    counter!("pairs_cached_total", count);
}

pub fn increment_cache_write_failures() {
    counter!("cache_write_failures_total", 1);
}

pub fn increment_reconnect_attempts() {
    counter!("reconnect_attempts_total", 1);
}

pub fn set_tracked_addresses(size: f64) {
    gauge!("tracked_addresses", size);
}
