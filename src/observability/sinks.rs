//! Health event sinks.
//!
//! The mesh server subscribes to the prober's broadcast bus and hands every
//! [`HealthChanged`] to each configured sink. Sinks only re-emit; nothing is persisted.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::ObservabilityConfig;
use crate::observability::health::{HealthChanged, HealthEventReceiver};
use crate::observability::metrics::{health_gauge_value, HEALTH_TRANSITIONS_TOTAL, INSTANCE_HEALTH};

/// Consumer of health transitions
#[async_trait]
pub trait HealthEventSink: Send + Sync {
    async fn on_health_changed(&self, event: &HealthChanged);

    fn name(&self) -> &'static str;
}

/// Re-emits transitions as metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsSink {
    endpoint: Option<String>,
}

impl MetricsSink {
    pub fn new(endpoint: Option<String>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl HealthEventSink for MetricsSink {
    async fn on_health_changed(&self, event: &HealthChanged) {
        metrics::counter!(
            HEALTH_TRANSITIONS_TOTAL,
            "service" => event.service.clone(),
            "to" => event.new_status.to_string()
        )
        .increment(1);
        metrics::gauge!(
            INSTANCE_HEALTH,
            "service" => event.service.clone(),
            "instance" => event.instance_id.clone()
        )
        .set(health_gauge_value(event.new_status));

        debug!(instance_id = %event.instance_id, endpoint = ?self.endpoint, "Health transition recorded in metrics");
    }

    fn name(&self) -> &'static str {
        "metrics"
    }
}

/// Re-emits transitions as structured tracing events for the collector
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    endpoint: Option<String>,
}

impl TracingSink {
    pub fn new(endpoint: Option<String>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl HealthEventSink for TracingSink {
    async fn on_health_changed(&self, event: &HealthChanged) {
        info!(
            target: "mesh::health",
            instance_id = %event.instance_id,
            service = %event.service,
            old_status = %event.old_status,
            new_status = %event.new_status,
            changed_at = %event.changed_at.to_rfc3339(),
            collector = ?self.endpoint,
            "healthChanged"
        );
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// Sinks enabled by the observability configuration
pub fn sinks_from_config(config: &ObservabilityConfig) -> Vec<Arc<dyn HealthEventSink>> {
    let mut sinks: Vec<Arc<dyn HealthEventSink>> = Vec::new();
    if config.metrics.enabled {
        sinks.push(Arc::new(MetricsSink::new(config.metrics.endpoint.clone())));
    }
    if config.tracing.enabled {
        sinks.push(Arc::new(TracingSink::new(config.tracing.endpoint.clone())));
    }
    sinks
}

/// Drain `receiver` into `sinks` until the bus closes
pub fn forward_health_events(
    mut receiver: HealthEventReceiver,
    sinks: Vec<Arc<dyn HealthEventSink>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let names: Vec<&'static str> = sinks.iter().map(|sink| sink.name()).collect();
        debug!(sinks = ?names, "Forwarding health events");

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    for sink in &sinks {
                        sink.on_health_changed(&event).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Health event forwarder lagged behind the prober");
                }
                Err(RecvError::Closed) => {
                    debug!("Health event bus closed");
                    break;
                }
            }
        }
    })
}
