//! # Configuration Module
//!
//! Immutable configuration for the mesh dispatcher.
//!
//! ## Key Features
//! - YAML configuration parsing with serde
//! - Humantime durations (`10s`, `1m 30s`)
//! - `MESH_*` environment variable overrides
//! - Validation with every problem reported at once

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::error::{MeshError, MeshResult};
use crate::core::types::ServiceInstance;

/// Path roots served by the management API
pub const RESERVED_ROUTE_ROOTS: [&str; 4] = ["/health", "/services", "/balancer", "/metrics"];

/// Why `prefix` cannot be mounted next to the management routes, if it cannot
fn proxy_prefix_conflict(prefix: &str) -> Option<&'static str> {
    if prefix.contains(':') || prefix.contains('*') {
        return Some("must not contain route parameters (':' or '*')");
    }
    if prefix.contains("//") {
        return Some("must not contain empty segments");
    }
    let clashes = RESERVED_ROUTE_ROOTS.iter().any(|root| {
        prefix == *root
            || prefix
                .strip_prefix(root)
                .map_or(false, |rest| rest.starts_with('/'))
    });
    if clashes {
        return Some("must not overlap /health, /services, /balancer or /metrics");
    }
    None
}

/// Main mesh configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Mesh identity (name and namespace)
    pub mesh: MeshIdentity,

    /// Listener and proxy settings
    pub server: ServerConfig,

    /// Instance selection policy
    pub load_balancing: LoadBalancingConfig,

    /// Periodic probe settings
    pub health_check: HealthCheckConfig,

    /// Directory settings
    pub discovery: DiscoveryConfig,

    /// Logging, metrics and tracing toggles
    pub observability: ObservabilityConfig,
}

impl MeshConfig {
    /// Load configuration from a YAML file, apply environment overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MeshError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without overrides or validation
    pub fn from_yaml(content: &str) -> MeshResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| MeshError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply overrides from the process environment
    ///
    /// Variables follow the pattern `MESH_<SECTION>_<FIELD>`, e.g. `MESH_SERVER_PORT=9000`.
    pub fn apply_env_overrides(&mut self) -> MeshResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> MeshResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("MESH_NAME") {
            self.mesh.name = name;
        }

        if let Some(namespace) = lookup("MESH_NAMESPACE") {
            self.mesh.namespace = namespace;
        }

        if let Some(addr) = lookup("MESH_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(port) = lookup("MESH_SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| MeshError::config(format!("Invalid MESH_SERVER_PORT: {}", e)))?;
        }

        if let Some(prefix) = lookup("MESH_PROXY_PREFIX") {
            self.server.proxy_prefix = prefix;
        }

        if let Some(timeout) = lookup("MESH_PROXY_TIMEOUT") {
            self.server.proxy_timeout = parse_duration("MESH_PROXY_TIMEOUT", &timeout)?;
        }

        if let Some(strategy) = lookup("MESH_LB_STRATEGY") {
            self.load_balancing.strategy = strategy.parse()?;
        }

        if let Some(interval) = lookup("MESH_HEALTH_INTERVAL") {
            self.health_check.interval = parse_duration("MESH_HEALTH_INTERVAL", &interval)?;
        }

        if let Some(timeout) = lookup("MESH_HEALTH_TIMEOUT") {
            self.health_check.timeout = parse_duration("MESH_HEALTH_TIMEOUT", &timeout)?;
        }

        if let Some(retries) = lookup("MESH_HEALTH_RETRIES") {
            self.health_check.retries = retries
                .parse()
                .map_err(|e| MeshError::config(format!("Invalid MESH_HEALTH_RETRIES: {}", e)))?;
        }

        if let Some(level) = lookup("MESH_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Some(format) = lookup("MESH_LOG_FORMAT") {
            self.observability.logging.format = format;
        }

        if let Some(enabled) = lookup("MESH_METRICS_ENABLED") {
            self.observability.metrics.enabled = parse_bool("MESH_METRICS_ENABLED", &enabled)?;
        }

        if let Some(enabled) = lookup("MESH_TRACING_ENABLED") {
            self.observability.tracing.enabled = parse_bool("MESH_TRACING_ENABLED", &enabled)?;
        }

        Ok(())
    }

    /// Validate the configuration, collecting every problem into one error
    pub fn validate(&self) -> MeshResult<()> {
        let mut errors = Vec::new();

        if self.mesh.name.trim().is_empty() {
            errors.push("mesh.name cannot be empty".to_string());
        }

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }

        if !self.server.proxy_prefix.starts_with('/') || self.server.proxy_prefix.len() < 2 {
            errors.push(format!(
                "server.proxy_prefix must start with '/' and name a segment, got '{}'",
                self.server.proxy_prefix
            ));
        } else if self.server.proxy_prefix.ends_with('/') {
            errors.push("server.proxy_prefix must not end with '/'".to_string());
        } else if let Some(problem) = proxy_prefix_conflict(&self.server.proxy_prefix) {
            errors.push(format!("server.proxy_prefix {}, got '{}'", problem, self.server.proxy_prefix));
        }

        if self.server.proxy_timeout.is_zero() {
            errors.push("server.proxy_timeout must be greater than 0".to_string());
        }

        if self.server.max_body_size == 0 {
            errors.push("server.max_body_size must be greater than 0".to_string());
        }

        if self.health_check.interval.is_zero() {
            errors.push("health_check.interval must be greater than 0".to_string());
        }

        if self.health_check.timeout.is_zero() {
            errors.push("health_check.timeout must be greater than 0".to_string());
        }

        if self.health_check.timeout > self.health_check.interval {
            errors.push("health_check.timeout cannot exceed health_check.interval".to_string());
        }

        if !self.health_check.path.starts_with('/') {
            errors.push("health_check.path must start with '/'".to_string());
        }

        if let Some(refresh) = self.discovery.refresh_interval {
            if refresh.is_zero() {
                errors.push("discovery.refresh_interval must be greater than 0".to_string());
            }
        }

        for (index, instance) in self.discovery.static_instances.iter().enumerate() {
            if let Err(e) = instance.validate() {
                errors.push(format!("discovery.static_instances[{}]: {}", index, e));
            }
        }

        match self.observability.logging.format.as_str() {
            "json" | "pretty" => {}
            other => errors.push(format!(
                "observability.logging.format must be 'json' or 'pretty', got '{}'",
                other
            )),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MeshError::config(errors.join("; ")))
        }
    }
}

fn parse_duration(key: &str, value: &str) -> MeshResult<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| MeshError::config(format!("Invalid {}: {}", key, e)))
}

fn parse_bool(key: &str, value: &str) -> MeshResult<bool> {
    value
        .parse()
        .map_err(|e| MeshError::config(format!("Invalid {}: {}", key, e)))
}

/// Mesh identity reported by `/health` and attached to telemetry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshIdentity {
    pub name: String,
    pub namespace: String,
}

impl Default for MeshIdentity {
    fn default() -> Self {
        Self {
            name: "mesh".to_string(),
            namespace: "default".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener to
    pub bind_address: String,

    pub port: u16,

    /// Path prefix of the proxy route, e.g. `/api`
    pub proxy_prefix: String,

    /// Timeout for proxied upstream calls
    #[serde(with = "humantime_serde")]
    pub proxy_timeout: Duration,

    /// Largest request body accepted on the proxy route (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            proxy_prefix: "/api".to_string(),
            proxy_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Load balancing strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
        }
    }
}

impl std::str::FromStr for LoadBalancingStrategy {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            other => Err(MeshError::config(format!(
                "Unknown load balancing strategy: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub strategy: LoadBalancingStrategy,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe path appended to `protocol://host:port`
    pub path: String,

    /// Time between probe ticks
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Per-attempt timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra attempts inside one tick before classifying unhealthy
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            retries: 2,
        }
    }
}

/// Directory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Period of the background full refresh; disabled when unset
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<Duration>,

    /// Seed records for the built-in static directory
    pub static_instances: Vec<ServiceInstance>,
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub tracing: TracingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// `json` or `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,

    /// Collector endpoint handed to the metrics sink
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
        }
    }
}

/// Tracing export configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,

    /// Collector endpoint handed to the tracing sink
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}
