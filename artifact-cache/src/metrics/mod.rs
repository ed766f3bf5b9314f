//! Prometheus Metrics for the artifact cache
//!
//! - Operations by class, name and status
//! - Removals by class and reason
//! - Byte usage and entry counts per cache instance
//! - Load latency

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder, register_histogram_vec,
    register_int_counter_vec, register_int_gauge_vec,
};

lazy_static! {
    /// Cache operations by class (image, volume, cache), operation and status
    pub static ref CACHE_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "artifact_cache_operations_total",
        "Total number of artifact cache operations",
        &["class", "operation", "status"]
    ).unwrap();

    /// Entries removed from the cache (explicit, evicted, purged)
    pub static ref CACHE_REMOVALS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "artifact_cache_removals_total",
        "Total number of entries removed from the cache by reason",
        &["class", "reason"]
    ).unwrap();

    /// Byte usage (used, max) per cache instance
    pub static ref CACHE_BYTES: IntGaugeVec = register_int_gauge_vec!(
        "artifact_cache_bytes",
        "Artifact cache size in bytes",
        &["cache", "kind"]
    ).unwrap();

    /// Current number of entries per cache instance
    pub static ref CACHE_ENTRIES: IntGaugeVec = register_int_gauge_vec!(
        "artifact_cache_entries",
        "Current number of entries per artifact class",
        &["cache", "class"]
    ).unwrap();

    /// Time from insertion to completion of a load
    pub static ref LOAD_DURATION: HistogramVec = register_histogram_vec!(
        "artifact_cache_load_duration_seconds",
        "Artifact load latency in seconds",
        &["class"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();
}

/// Encode all registered metrics in the Prometheus text format
pub fn encode_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a cache operation
pub fn record_cache_op(class: &str, operation: &str, status: &str) {
    CACHE_OPS_TOTAL
        .with_label_values(&[class, operation, status])
        .inc();
}

/// Record an entry leaving the cache
pub fn record_removal(class: &str, reason: &str) {
    CACHE_REMOVALS_TOTAL
        .with_label_values(&[class, reason])
        .inc();
}

/// Record a finished load
pub fn record_load_duration(class: &str, duration_secs: f64) {
    LOAD_DURATION.with_label_values(&[class]).observe(duration_secs);
}

/// Update size and entry gauges of the named cache
pub fn update_cache_usage(cache: &str, used: u64, max: u64, images: usize, volumes: usize) {
    CACHE_BYTES
        .with_label_values(&[cache, "used"])
        .set(i64::try_from(used).unwrap_or(i64::MAX));
    CACHE_BYTES
        .with_label_values(&[cache, "max"])
        .set(i64::try_from(max).unwrap_or(i64::MAX));
    CACHE_ENTRIES
        .with_label_values(&[cache, "image"])
        .set(images as i64);
    CACHE_ENTRIES
        .with_label_values(&[cache, "volume"])
        .set(volumes as i64);
}
