//! # Router Module
//!
//! Resolves `{prefix}/{name}/{rest}` to a service, asks the registry for its
//! instances, lets the load balancer pick one and forwards the request.
//!
//! - no instances under `name` → `ServiceNotFound`
//! - instances but none selectable → `NoHealthyInstance`
//! - selected instance unreachable → `UpstreamUnavailable`
//!
//! There is no automatic failover; callers wanting retries must route again.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

use crate::core::error::{MeshError, MeshResult};
use crate::core::types::{IncomingRequest, ServiceInstance, UpstreamResponse};
use crate::discovery::registry::ServiceRegistry;
use crate::load_balancing::LoadBalancer;
use crate::observability::metrics::{record_proxy_error, record_proxy_request};
use crate::routing::forwarder::Forwarder;

/// Service name and remaining path extracted from a proxied request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub service: String,
    /// Path after the service segment, without its leading slash
    pub rest: String,
}

/// Request router for the proxy prefix
pub struct MeshRouter {
    registry: Arc<ServiceRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    forwarder: Forwarder,
    prefix: String,
}

impl MeshRouter {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        balancer: Arc<dyn LoadBalancer>,
        forwarder: Forwarder,
        prefix: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        Self {
            registry,
            balancer,
            forwarder,
            prefix,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    /// Split `{prefix}/{name}/{rest}`; a missing service segment is a validation error
    pub fn resolve(&self, path: &str) -> MeshResult<ResolvedPath> {
        let remainder = path
            .strip_prefix(self.prefix.as_str())
            .filter(|remainder| remainder.is_empty() || remainder.starts_with('/'))
            .ok_or_else(|| {
                MeshError::validation("path", format!("path must start with {}", self.prefix))
            })?;

        let remainder = remainder.trim_start_matches('/');
        let (service, rest) = match remainder.split_once('/') {
            Some((service, rest)) => (service, rest),
            None => (remainder, ""),
        };

        if service.is_empty() {
            return Err(MeshError::validation("path", "service name is missing"));
        }

        Ok(ResolvedPath {
            service: service.to_string(),
            rest: rest.to_string(),
        })
    }

    /// Pick an instance of `service` with the configured strategy
    pub async fn select_instance(&self, service: &str) -> MeshResult<ServiceInstance> {
        let instances = self.registry.discover(service).await;
        if instances.is_empty() {
            return Err(MeshError::service_not_found(service));
        }

        self.balancer
            .select(&instances)
            .ok_or_else(|| MeshError::no_healthy_instance(service))
    }

    /// Route one request end to end
    #[instrument(skip(self, request), fields(trace_id = %request.trace_id, method = %request.method, path = %request.path()))]
    pub async fn route(&self, request: IncomingRequest) -> MeshResult<UpstreamResponse> {
        let start = Instant::now();
        let resolved = self.resolve(request.path())?;

        let result = self.dispatch(&resolved, &request).await;
        match &result {
            Ok(response) => {
                record_proxy_request(&resolved.service, response.status.as_u16(), start.elapsed());
                debug!(service = %resolved.service, status = %response.status, elapsed = ?start.elapsed(), "Request proxied");
            }
            Err(e) => {
                record_proxy_error(&resolved.service, e.error_type());
                debug!(service = %resolved.service, error = %e, "Request routing failed");
            }
        }
        result
    }

    async fn dispatch(&self, resolved: &ResolvedPath, request: &IncomingRequest) -> MeshResult<UpstreamResponse> {
        let instance = self.select_instance(&resolved.service).await?;

        // Counted for least-connections until the upstream call completes
        let _connection = self.registry.track_connection(&instance.id);
        self.forwarder.forward(&instance, request, &resolved.rest).await
    }
}
