//! # Metrics Collection
//!
//! Metric names and recording helpers for the dispatcher, plus installation of the
//! Prometheus exporter used by `GET /metrics`.
//!
//! Recording goes through the `metrics` facade; without an installed recorder every
//! call is a no-op, which keeps library users and tests free of global state.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::core::config::MetricsConfig;
use crate::core::error::{MeshError, MeshResult};
use crate::core::types::HealthStatus;

pub const PROXY_REQUESTS_TOTAL: &str = "mesh_proxy_requests_total";
pub const PROXY_ERRORS_TOTAL: &str = "mesh_proxy_errors_total";
pub const PROXY_DURATION_SECONDS: &str = "mesh_proxy_duration_seconds";
pub const LB_SELECTIONS_TOTAL: &str = "mesh_lb_selections_total";
pub const HEALTH_TRANSITIONS_TOTAL: &str = "mesh_health_transitions_total";
pub const INSTANCE_HEALTH: &str = "mesh_instance_health";

/// Latency buckets for proxied calls, in seconds
const PROXY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Install the Prometheus recorder and return the handle that renders it.
///
/// Must be called at most once per process.
pub fn install_prometheus(config: &MetricsConfig, mesh_name: &str) -> MeshResult<PrometheusHandle> {
    let builder = PrometheusBuilder::new()
        .add_global_label("mesh", mesh_name.to_string())
        .set_buckets_for_metric(Matcher::Full(PROXY_DURATION_SECONDS.to_string()), PROXY_BUCKETS)
        .map_err(|e| MeshError::config(format!("Failed to set histogram buckets: {}", e)))?;

    let handle = builder
        .install_recorder()
        .map_err(|e| MeshError::internal(format!("Failed to install metrics recorder: {}", e)))?;

    tracing::info!(endpoint = ?config.endpoint, "Prometheus metrics recorder installed");
    Ok(handle)
}

/// Record one proxied request
pub fn record_proxy_request(service: &str, status: u16, duration: Duration) {
    let service = service.to_string();
    metrics::counter!(PROXY_REQUESTS_TOTAL, "service" => service.clone(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!(PROXY_DURATION_SECONDS, "service" => service).record(duration.as_secs_f64());
}

/// Record a routing failure by error type
pub fn record_proxy_error(service: &str, error_type: &'static str) {
    metrics::counter!(PROXY_ERRORS_TOTAL, "service" => service.to_string(), "type" => error_type)
        .increment(1);
}

/// Record one load balancer selection
pub fn record_selection(algorithm: &'static str, instance_id: &str) {
    metrics::counter!(LB_SELECTIONS_TOTAL, "algorithm" => algorithm, "instance" => instance_id.to_string())
        .increment(1);
}

/// Gauge value for a health state: 1 healthy, 0 unhealthy, -1 unknown
pub fn health_gauge_value(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Healthy => 1.0,
        HealthStatus::Unhealthy => 0.0,
        HealthStatus::Unknown => -1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_gauge_value() {
        assert_eq!(health_gauge_value(HealthStatus::Healthy), 1.0);
        assert_eq!(health_gauge_value(HealthStatus::Unhealthy), 0.0);
        assert_eq!(health_gauge_value(HealthStatus::Unknown), -1.0);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_proxy_request("orders", 200, Duration::from_millis(5));
        record_proxy_error("orders", "upstream_unavailable");
        record_selection("round_robin", "orders-1");
    }
}
