//! Metrics collection and exposition.
//!
//! # Metrics
//! - `engine_calls_total` (counter): completed calls by key and outcome
//! - `engine_call_duration_seconds` (histogram): latency of executed calls
//! - `engine_rejections_total` (counter): admission rejections by key and kind
//! - `engine_fallbacks_total` (counter): degraded results by key and kind
//! - `engine_breaker_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `engine_detached_operations` (gauge): abandoned operations still running
//!
//! # Design Decisions
//! - Emitted through the `metrics` facade; without an installed recorder
//!   every call is a no-op
//! - Prometheus exporter is optional and installed by the binary
//! - The `key` label is the dependency name for configured keys only; every
//!   unconfigured key reports under [`UNCONFIGURED_KEY_LABEL`] and exports no
//!   breaker gauge, so label cardinality is fixed by the config

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::ErrorKind;
use crate::resilience::circuit_breaker::CircuitState;

/// `key` label shared by every dependency without a config entry.
pub const UNCONFIGURED_KEY_LABEL: &str = "_unconfigured";

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_outcome(key: &str, outcome: Option<ErrorKind>, elapsed: Duration) {
    let outcome = outcome.map_or("success", |kind| kind.as_str());
    counter!("engine_calls_total", "key" => key.to_string(), "outcome" => outcome).increment(1);
    histogram!("engine_call_duration_seconds", "key" => key.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_rejection(key: &str, kind: ErrorKind) {
    counter!("engine_rejections_total", "key" => key.to_string(), "kind" => kind.as_str())
        .increment(1);
}

pub fn record_fallback(key: &str, kind: ErrorKind) {
    counter!("engine_fallbacks_total", "key" => key.to_string(), "kind" => kind.as_str())
        .increment(1);
}

pub fn record_breaker_state(key: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("engine_breaker_state", "key" => key.to_string()).set(value);
}

pub fn record_detached(in_flight: usize) {
    gauge!("engine_detached_operations").set(in_flight as f64);
}
