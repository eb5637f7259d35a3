//! # Core Types Module
//!
//! Data structures shared by the registry, prober, load balancers and forwarder:
//! service instances, their health, registration payloads and the request/response
//! pair that flows through the proxy path.

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::core::error::{MeshError, MeshResult};

/// Header carrying the distributed trace identifier
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Metadata key read by the least-connections strategy.
///
/// The forwarder increments it before each proxied call and decrements it afterwards.
/// Every other metadata key is opaque passthrough.
pub const ACTIVE_CONNECTIONS_KEY: &str = "activeConnections";

/// Protocol spoken by a backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    /// URL scheme for this protocol
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Health of a service instance.
///
/// Instances start as `Unknown`; only the health prober moves them to `Healthy`
/// or `Unhealthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One running endpoint of a named service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance identifier (assigned on registration when empty)
    #[serde(default)]
    pub id: String,

    /// Service name; many instances share one name
    pub name: String,

    pub host: String,

    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    /// Set exclusively by the health prober
    #[serde(default)]
    pub health: HealthStatus,

    /// Open key/value map, see [`ACTIVE_CONNECTIONS_KEY`]
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Time of the most recent health transition
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,

    /// Weight used by weighted strategies, always >= 1
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

fn default_weight() -> u32 {
    1
}

impl ServiceInstance {
    /// Create a new instance in the `Unknown` health state
    pub fn new<N: Into<String>, H: Into<String>>(name: N, host: H, port: u16) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            host: host.into(),
            port,
            protocol: Protocol::Http,
            health: HealthStatus::Unknown,
            metadata: HashMap::new(),
            last_health_check: None,
            weight: 1,
            zone: None,
            version: None,
        }
    }

    /// Builder-style id setter
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    /// Builder-style weight setter
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Builder-style protocol setter
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Builder-style metadata setter
    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthStatus::Healthy
    }

    /// Base URL of the instance, e.g. `http://10.0.0.4:8080`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }

    /// Current in-flight proxied calls; a missing or unparsable value counts as 0
    pub fn active_connections(&self) -> u64 {
        self.metadata
            .get(ACTIVE_CONNECTIONS_KEY)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Check the fields registration requires
    pub fn validate(&self) -> MeshResult<()> {
        if self.name.trim().is_empty() {
            return Err(MeshError::validation("name", "service name is required"));
        }
        if self.host.trim().is_empty() {
            return Err(MeshError::validation("host", "host is required"));
        }
        if self.port == 0 {
            return Err(MeshError::validation("port", "port must be between 1 and 65535"));
        }
        if self.weight == 0 {
            return Err(MeshError::validation("weight", "weight must be at least 1"));
        }
        Ok(())
    }
}

/// Registration payload accepted by `POST /services/{name}/register`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceRegistration {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl InstanceRegistration {
    /// Turn the payload into an instance of `service_name`.
    ///
    /// Missing `host` or `port` is a validation error; everything else has a default.
    pub fn into_instance(self, service_name: &str) -> MeshResult<ServiceInstance> {
        let host = self
            .host
            .filter(|host| !host.trim().is_empty())
            .ok_or_else(|| MeshError::validation("host", "host is required"))?;
        let port = self
            .port
            .ok_or_else(|| MeshError::validation("port", "port is required"))?;

        let instance = ServiceInstance {
            id: self.id.unwrap_or_default(),
            name: service_name.to_string(),
            host,
            port,
            protocol: self.protocol.unwrap_or_default(),
            health: HealthStatus::Unknown,
            metadata: self.metadata.unwrap_or_default(),
            last_health_check: None,
            weight: self.weight.unwrap_or(1),
            zone: self.zone,
            version: self.version,
        };

        instance.validate()?;
        Ok(instance)
    }
}

/// A request arriving on the proxy route, buffered and ready to forward
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,

    /// Original URI including the proxy prefix and query string
    pub uri: Uri,

    pub headers: HeaderMap,

    pub body: Bytes,

    /// Address of the calling client, when the listener exposes it
    pub remote_addr: Option<SocketAddr>,

    /// Trace id taken from the inbound headers or freshly generated
    pub trace_id: String,
}

impl IncomingRequest {
    /// Build a request, reusing the inbound trace id when one is present
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let trace_id = headers
            .get(TRACE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            method,
            uri,
            headers,
            body,
            remote_addr,
            trace_id,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Upstream response relayed verbatim to the caller
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Attach the trace id unless the upstream already set one
    pub fn ensure_trace_id(&mut self, trace_id: &str) {
        if self.headers.contains_key(TRACE_ID_HEADER) {
            return;
        }
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            self.headers.insert(TRACE_ID_HEADER, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_instance_defaults() {
        let instance = ServiceInstance::new("orders", "10.0.0.1", 8080);

        assert_eq!(instance.health, HealthStatus::Unknown);
        assert_eq!(instance.weight, 1);
        assert_eq!(instance.base_url(), "http://10.0.0.1:8080");
        assert!(!instance.is_healthy());
    }

    #[test]
    fn test_active_connections_parsing() {
        let instance = ServiceInstance::new("orders", "10.0.0.1", 8080);
        assert_eq!(instance.active_connections(), 0);

        let instance = instance.with_metadata(ACTIVE_CONNECTIONS_KEY, "7");
        assert_eq!(instance.active_connections(), 7);

        let instance = instance.with_metadata(ACTIVE_CONNECTIONS_KEY, "garbage");
        assert_eq!(instance.active_connections(), 0);
    }

    #[test]
    fn test_validation() {
        assert!(ServiceInstance::new("", "10.0.0.1", 80).validate().is_err());
        assert!(ServiceInstance::new("orders", " ", 80).validate().is_err());
        assert!(ServiceInstance::new("orders", "10.0.0.1", 0).validate().is_err());
        assert!(ServiceInstance::new("orders", "10.0.0.1", 80)
            .with_weight(0)
            .validate()
            .is_err());
        assert!(ServiceInstance::new("orders", "10.0.0.1", 80).validate().is_ok());
    }

    #[test]
    fn test_registration_requires_host_and_port() {
        let missing_host = InstanceRegistration {
            port: Some(8080),
            ..Default::default()
        };
        let err = missing_host.into_instance("orders").unwrap_err();
        assert!(matches!(err, MeshError::Validation { ref field, .. } if field == "host"));

        let missing_port = InstanceRegistration {
            host: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        let err = missing_port.into_instance("orders").unwrap_err();
        assert!(matches!(err, MeshError::Validation { ref field, .. } if field == "port"));
    }

    #[test]
    fn test_registration_applies_defaults() {
        let registration: InstanceRegistration =
            serde_json::from_str(r#"{"host": "10.0.0.9", "port": 9000}"#).unwrap();
        let instance = registration.into_instance("billing").unwrap();

        assert_eq!(instance.name, "billing");
        assert_eq!(instance.protocol, Protocol::Http);
        assert_eq!(instance.weight, 1);
        assert!(instance.id.is_empty());
    }

    #[test]
    fn test_incoming_request_trace_id() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, "abc-123".parse().unwrap());
        let request = IncomingRequest::new(
            Method::GET,
            "/api/orders/list".parse().unwrap(),
            headers,
            Bytes::new(),
            None,
        );
        assert_eq!(request.trace_id, "abc-123");

        let request = IncomingRequest::new(
            Method::GET,
            "/api/orders/list".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            None,
        );
        assert!(!request.trace_id.is_empty());
    }
}
