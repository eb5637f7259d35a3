//! External instance directory abstraction.
//!
//! The registry only needs three operations from a discovery backend. Any concrete
//! store (consensus cluster, DNS, static configuration) implements
//! [`InstanceDirectory`] without touching the registry.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::core::error::{MeshError, MeshResult};
use crate::core::types::ServiceInstance;

/// Discovery backend consulted by the registry on cache misses and refreshes
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Publish an instance to the backend
    async fn register(&self, instance: &ServiceInstance) -> MeshResult<()>;

    /// Remove an instance from the backend; unknown ids are not an error
    async fn deregister(&self, instance_id: &str) -> MeshResult<()>;

    /// Instances the backend currently lists for `service_name`
    async fn list_healthy(&self, service_name: &str) -> MeshResult<Vec<ServiceInstance>>;

    /// Backend name for logs and error messages
    fn backend_name(&self) -> &'static str;
}

/// In-memory directory seeded from configuration.
///
/// It can be switched offline to simulate an unreachable backend; every call then
/// fails with `DirectoryUnavailable`.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    /// Instances indexed by id
    instances: DashMap<String, ServiceInstance>,
    offline: AtomicBool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory pre-populated with `instances`
    pub fn with_instances<I>(instances: I) -> Self
    where
        I: IntoIterator<Item = ServiceInstance>,
    {
        let directory = Self::new();
        for instance in instances {
            directory.insert(instance);
        }
        directory
    }

    /// Insert a record directly, bypassing the registry
    pub fn insert(&self, mut instance: ServiceInstance) {
        if instance.id.is_empty() {
            instance.id = format!("{}-{}-{}", instance.name, instance.host, instance.port);
        }
        self.instances.insert(instance.id.clone(), instance);
    }

    /// Remove a record directly, bypassing the registry
    pub fn remove(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.instances.remove(instance_id).map(|(_, instance)| instance)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn ensure_online(&self) -> MeshResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MeshError::directory_unavailable(
                self.backend_name(),
                "directory is offline",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceDirectory for StaticDirectory {
    async fn register(&self, instance: &ServiceInstance) -> MeshResult<()> {
        self.ensure_online()?;
        self.insert(instance.clone());
        debug!(instance_id = %instance.id, service = %instance.name, "Registered instance in static directory");
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> MeshResult<()> {
        self.ensure_online()?;
        self.remove(instance_id);
        Ok(())
    }

    async fn list_healthy(&self, service_name: &str) -> MeshResult<Vec<ServiceInstance>> {
        self.ensure_online()?;
        let mut instances: Vec<ServiceInstance> = self
            .instances
            .iter()
            .filter(|entry| entry.value().name == service_name)
            .map(|entry| entry.value().clone())
            .collect();
        // DashMap iteration order is arbitrary; keep list order stable for balancers
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    fn backend_name(&self) -> &'static str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_lists_by_name() {
        let directory = StaticDirectory::with_instances(vec![
            ServiceInstance::new("orders", "10.0.0.1", 80).with_id("o-2"),
            ServiceInstance::new("orders", "10.0.0.2", 80).with_id("o-1"),
            ServiceInstance::new("billing", "10.0.0.3", 80),
        ]);

        let orders = directory.list_healthy("orders").await.unwrap();
        let ids: Vec<&str> = orders.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["o-1", "o-2"]);

        let billing = directory.list_healthy("billing").await.unwrap();
        assert_eq!(billing[0].id, "billing-10.0.0.3-80");
    }

    #[tokio::test]
    async fn test_offline_directory_fails() {
        let directory = StaticDirectory::new();
        directory.set_offline(true);

        let err = directory.list_healthy("orders").await.unwrap_err();
        assert!(matches!(err, MeshError::DirectoryUnavailable { .. }));

        directory.set_offline(false);
        assert!(directory.list_healthy("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let directory = StaticDirectory::new();
        let instance = ServiceInstance::new("orders", "10.0.0.1", 80).with_id("a");

        directory.register(&instance).await.unwrap();
        assert_eq!(directory.len(), 1);

        directory.deregister("a").await.unwrap();
        directory.deregister("a").await.unwrap();
        assert!(directory.is_empty());
    }
}
