//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("gaggle_activities_received_total", "Inbound activities by type"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("gaggle_activities_sent_total", "Outbound activities by type"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("gaggle_signature_failures_total", "Inbound signature rejections by reason"),
        &["reason"]
    ).expect("metric can be created");

    // Delivery metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gaggle_deliveries_total", "Delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_PENDING: IntGauge = IntGauge::new(
        "gaggle_deliveries_pending",
        "Delivery records parked in the retry queue"
    ).expect("metric can be created");

    // Fetch cache metrics
    pub static ref FETCH_CACHE_HITS: IntCounterVec = IntCounterVec::new(
        Opts::new("gaggle_fetch_cache_hits_total", "Single-flight cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref FETCH_CACHE_MISSES: IntCounterVec = IntCounterVec::new(
        Opts::new("gaggle_fetch_cache_misses_total", "Single-flight cache fills"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gaggle_errors_total", "Errors surfaced to HTTP responses"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
///
/// Call once at startup; repeated registration is ignored.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVITIES_RECEIVED.clone()),
        Box::new(ACTIVITIES_SENT.clone()),
        Box::new(SIGNATURE_FAILURES.clone()),
        Box::new(DELIVERIES_TOTAL.clone()),
        Box::new(DELIVERIES_PENDING.clone()),
        Box::new(FETCH_CACHE_HITS.clone()),
        Box::new(FETCH_CACHE_MISSES.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::debug!(%error, "metric already registered");
        }
    }
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(%error, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
