//! # Mesh Dispatcher Library
//!
//! A service mesh dispatcher: a live registry of backend service instances, one
//! periodic health probe per instance, pluggable load balancing and a reverse proxy
//! that forwards `{prefix}/{service}/{rest}` to the selected instance.
//!
//! ## Data Flow
//!
//! registration → registry cache → prober starts watching → probe results update
//! health → router filters by health → load balancer selects → forwarder proxies.

/// Error types, configuration and the shared data model
pub mod core;

/// Instance cache, directory abstraction and the service registry
pub mod discovery;

/// HTTP surface composing registry, balancer and router
pub mod gateway;

/// Selection strategies: round robin, weighted round robin, least connections
pub mod load_balancing;

/// Health probing, logging, metrics and health event sinks
pub mod observability;

/// Path resolution and request forwarding
pub mod routing;

// Re-export commonly used types for easier access
pub use crate::core::config::{LoadBalancingStrategy, MeshConfig};
pub use crate::core::error::{MeshError, MeshResult};
pub use crate::core::types::{HealthStatus, IncomingRequest, Protocol, ServiceInstance, UpstreamResponse};
pub use crate::discovery::{InstanceDirectory, ServiceRegistry, StaticDirectory};
pub use crate::gateway::server::MeshServer;
pub use crate::load_balancing::{create_load_balancer, LoadBalancer};
pub use crate::observability::health::{HealthChanged, HealthProber};
pub use crate::routing::{Forwarder, MeshRouter};
