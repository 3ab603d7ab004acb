// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the runtime core.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Fetch retry telemetry ---
    /// The total number of fetch retries performed after a transient error.
    pub static ref FETCH_RETRY_ATTEMPTS_TOTAL: Counter =
        register_counter!("kubedeck_fetch_retry_attempts_total", "Total number of fetch retries after transient errors.").unwrap();
    /// The total number of fetches that succeeded after at least one retry.
    pub static ref FETCH_RETRY_SUCCESSES_TOTAL: Counter =
        register_counter!("kubedeck_fetch_retry_successes_total", "Total number of fetches that eventually succeeded after retrying.").unwrap();
    /// The total number of fetches that exhausted their retry budget.
    pub static ref FETCH_RETRY_EXHAUSTED_TOTAL: Counter =
        register_counter!("kubedeck_fetch_retry_exhausted_total", "Total number of fetches that exhausted all retry attempts.").unwrap();
    /// Response cache lookups, labeled by result.
    pub static ref RESPONSE_CACHE_LOOKUPS_TOTAL: CounterVec =
        register_counter_vec!("kubedeck_response_cache_lookups_total", "Response cache lookups, labeled by result.", &["result"]).unwrap();

    // --- Cluster health ---
    /// Heartbeat probe outcomes, labeled ok / auth / connectivity.
    pub static ref HEARTBEAT_PROBES_TOTAL: CounterVec =
        register_counter_vec!("kubedeck_heartbeat_probes_total", "Heartbeat probe outcomes per tick.", &["outcome"]).unwrap();
    /// The total number of transport-failure-driven cluster rebuilds launched.
    pub static ref TRANSPORT_REBUILDS_TOTAL: Counter =
        register_counter!("kubedeck_transport_rebuilds_total", "Total number of transport-failure-driven cluster rebuilds.").unwrap();
    /// The number of clusters with a live refresh subsystem.
    pub static ref LIVE_CLUSTERS: Gauge =
        register_gauge!("kubedeck_live_clusters", "Number of clusters with a live refresh subsystem.").unwrap();

    // --- Selection coordinator ---
    /// Selection mutation outcomes, labeled ok / failed / canceled / superseded.
    pub static ref SELECTION_MUTATIONS_TOTAL: CounterVec =
        register_counter_vec!("kubedeck_selection_mutations_total", "Selection mutation outcomes.", &["status"]).unwrap();

    // --- Aggregation ---
    /// Entries delivered on aggregate event streams.
    pub static ref EVENT_STREAM_ENTRIES_TOTAL: Counter =
        register_counter!("kubedeck_event_stream_entries_total", "Entries delivered on aggregate event streams.").unwrap();
    /// Aggregate manual refresh jobs enqueued.
    pub static ref MANUAL_REFRESH_JOBS_TOTAL: Counter =
        register_counter!("kubedeck_manual_refresh_jobs_total", "Aggregate manual refresh jobs enqueued.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
