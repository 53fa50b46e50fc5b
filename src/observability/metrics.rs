//! # Metrics
//!
//! Gateway metrics recorded through the `metrics` facade and exported in
//! Prometheus text format:
//!
//! - `gateway_requests_total{service,status}`
//! - `gateway_request_duration_seconds{service}`
//! - `gateway_rate_limited_total{scope}`
//! - `gateway_circuit_rejections_total{service}`
//! - `gateway_upstream_retries_total{service}`
//! - `gateway_service_health{service}` (1 healthy, 0.5 degraded, 0 unhealthy)
//!
//! Recording is free when no recorder is installed, so components call these
//! helpers unconditionally.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::time::Duration;

use crate::core::config::MetricsConfig;
use crate::core::error::{GatewayError, GatewayResult};

const REQUEST_DURATION: &str = "gateway_request_duration_seconds";

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> GatewayResult<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), LATENCY_BUCKETS)
        .map_err(|e| GatewayError::internal(format!("Failed to set histogram buckets: {}", e)))
}

/// Install the global Prometheus recorder when enabled
pub fn install_recorder(config: &MetricsConfig) -> GatewayResult<Option<PrometheusHandle>> {
    if !config.prometheus_enabled {
        return Ok(None);
    }
    let handle = builder()?
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("Failed to install metrics recorder: {}", e)))?;
    Ok(Some(handle))
}

/// A recorder that is not installed globally, for tests and embedding
pub fn local_recorder() -> GatewayResult<PrometheusRecorder> {
    Ok(builder()?.build_recorder())
}

/// One finished proxied request
pub fn record_request(service: &str, status: u16, elapsed: Duration) {
    metrics::counter!(
        "gateway_requests_total",
        "service" => service.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION, "service" => service.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_rate_limited(scope: &'static str) {
    metrics::counter!("gateway_rate_limited_total", "scope" => scope).increment(1);
}

pub fn record_circuit_rejection(service: &str) {
    metrics::counter!("gateway_circuit_rejections_total", "service" => service.to_string())
        .increment(1);
}

pub fn record_retry(service: &str) {
    metrics::counter!("gateway_upstream_retries_total", "service" => service.to_string())
        .increment(1);
}

pub fn record_service_health(service: &str, value: f64) {
    metrics::gauge!("gateway_service_health", "service" => service.to_string()).set(value);
}
