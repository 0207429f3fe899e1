//! Prometheus metrics.
//!
//! Thin wrappers over the `metrics` facade. Without an installed recorder
//! (tests, `METRICS_ENABLED=false`) every call is a no-op.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;
use tracing::{info, warn};

/// Install the global Prometheus recorder.
///
/// Returns `None` if a recorder is already installed.
pub fn install() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics recorder installed");
            Some(handle)
        }
        Err(e) => {
            warn!("Metrics recorder not installed: {}", e);
            None
        }
    }
}

pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "tailcast_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("tailcast_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("tailcast_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_production_started() {
    counter!("tailcast_productions_started_total").increment(1);
}

pub fn record_production_failed() {
    counter!("tailcast_productions_failed_total").increment(1);
}

pub fn record_produced_bytes(bytes: u64) {
    counter!("tailcast_produced_bytes_total").increment(bytes);
}

pub fn record_append_error() {
    counter!("tailcast_append_errors_total").increment(1);
}

/// `outcome` is one of `complete`, `abandoned`, `disconnected`.
pub fn record_tail(outcome: &'static str) {
    counter!("tailcast_tails_total", "outcome" => outcome).increment(1);
}
