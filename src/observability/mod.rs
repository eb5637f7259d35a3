// Per-instance health probing and the health event bus
pub mod health;

// Structured logging
pub mod logging;

// Metric names, helpers and Prometheus export
pub mod metrics;

// Consumers of health transitions
pub mod sinks;

// Re-export commonly used types for convenience
pub use health::{HealthChanged, HealthEventReceiver, HealthEventSender, HealthProber};
pub use logging::init_logging;
pub use sinks::{forward_health_events, HealthEventSink, MetricsSink, TracingSink};
