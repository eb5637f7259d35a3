//! # Service Registry
//!
//! In-memory cache of service instances kept in sync with an [`InstanceDirectory`].
//!
//! - `register` validates, assigns an id when absent, upserts, writes through to the
//!   directory and starts a health probe.
//! - `deregister` removes the instance everywhere and waits for its probe to stop.
//! - `discover` serves the cache and falls back to the directory on a miss.
//! - When the directory cannot be reached the last known list is served instead
//!   (stale but available). Directory errors never reach the caller.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::HealthCheckConfig;
use crate::core::error::MeshResult;
use crate::core::types::{HealthStatus, ServiceInstance};
use crate::discovery::cache::InstanceCache;
use crate::discovery::directory::InstanceDirectory;
use crate::observability::health::{
    HealthEventReceiver, HealthEventSender, HealthProber, HEALTH_EVENT_CAPACITY,
};

/// Registry of live service instances
pub struct ServiceRegistry {
    cache: Arc<InstanceCache>,
    directory: Arc<dyn InstanceDirectory>,
    prober: HealthProber,
    events: HealthEventSender,
}

impl ServiceRegistry {
    /// Create a registry backed by `directory`, probing with `health_config`
    pub fn new(directory: Arc<dyn InstanceDirectory>, health_config: HealthCheckConfig) -> MeshResult<Self> {
        let (events, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);
        let cache = Arc::new(InstanceCache::new());
        let prober = HealthProber::new(health_config, cache.clone(), events.clone())?;

        Ok(Self {
            cache,
            directory,
            prober,
            events,
        })
    }

    /// Register or update an instance and start probing it.
    ///
    /// Idempotent on id: re-registering keeps the probed health and the running probe.
    pub async fn register(&self, mut instance: ServiceInstance) -> MeshResult<ServiceInstance> {
        instance.validate()?;

        if instance.id.trim().is_empty() {
            instance.id = Uuid::new_v4().to_string();
        }
        // Health belongs to the prober
        instance.health = HealthStatus::Unknown;
        instance.last_health_check = None;

        let upserted = self.cache.upsert(instance);
        let stored = upserted.instance;

        if let Err(e) = self.directory.register(&stored).await {
            warn!(
                instance_id = %stored.id,
                backend = self.directory.backend_name(),
                error = %e,
                "Directory write-through failed, instance is cached locally only"
            );
        }

        self.prober.watch(&stored.id);

        metrics::counter!("mesh_registrations_total").increment(1);
        info!(
            instance_id = %stored.id,
            service = %stored.name,
            address = %stored.base_url(),
            new = upserted.inserted,
            "Registered service instance"
        );

        Ok(stored)
    }

    /// Remove an instance and stop its probe. Returns `false` for unknown ids.
    ///
    /// The probe task has stopped by the time this returns.
    pub async fn deregister(&self, instance_id: &str) -> bool {
        let removed = self.cache.remove(instance_id);
        self.prober.unwatch(instance_id).await;

        if let Err(e) = self.directory.deregister(instance_id).await {
            warn!(
                instance_id = %instance_id,
                backend = self.directory.backend_name(),
                error = %e,
                "Directory deregistration failed"
            );
        }

        match removed {
            Some(instance) => {
                metrics::counter!("mesh_deregistrations_total").increment(1);
                info!(instance_id = %instance_id, service = %instance.name, "Deregistered service instance");
                true
            }
            None => {
                debug!(instance_id = %instance_id, "Deregistration of unknown instance ignored");
                false
            }
        }
    }

    /// Instances of `name`, from the cache or, on a miss, from the directory
    pub async fn discover(&self, name: &str) -> Vec<ServiceInstance> {
        if let Some(instances) = self.cache.snapshot(name) {
            metrics::counter!("mesh_discovery_cache_hits_total").increment(1);
            return instances;
        }

        metrics::counter!("mesh_discovery_cache_misses_total").increment(1);
        self.refresh(name).await
    }

    /// Re-populate one service from the directory.
    ///
    /// Probes start for newly listed instances and stop for discovered instances the
    /// directory dropped. Locally registered instances stay until deregistered and
    /// are written back when the directory lost them. On directory failure the
    /// cached list is returned unchanged.
    pub async fn refresh(&self, name: &str) -> Vec<ServiceInstance> {
        let listed = match self.directory.list_healthy(name).await {
            Ok(listed) => listed,
            Err(e) => {
                metrics::counter!("mesh_directory_errors_total").increment(1);
                warn!(
                    service = %name,
                    backend = self.directory.backend_name(),
                    error = %e,
                    "Directory unavailable, serving cached instances"
                );
                return self.cache.snapshot(name).unwrap_or_default();
            }
        };

        let listed: Vec<ServiceInstance> = listed
            .into_iter()
            .filter_map(|mut instance| {
                instance.name = name.to_string();
                if instance.id.trim().is_empty() {
                    instance.id = format!("{}-{}-{}", instance.name, instance.host, instance.port);
                }
                match instance.validate() {
                    Ok(()) => Some(instance),
                    Err(e) => {
                        warn!(service = %name, instance_id = %instance.id, error = %e, "Skipping invalid directory record");
                        None
                    }
                }
            })
            .collect();

        let merged = self.cache.merge_service(name, listed);

        for id in &merged.added {
            self.prober.watch(id);
        }
        for instance in &merged.dropped {
            self.prober.unwatch(&instance.id).await;
        }
        for instance in &merged.unlisted {
            self.republish(instance).await;
        }

        debug!(
            service = %name,
            instances = merged.instances.len(),
            added = merged.added.len(),
            dropped = merged.dropped.len(),
            unlisted = merged.unlisted.len(),
            "Refreshed service from directory"
        );

        merged.instances
    }

    /// Write a locally registered instance back to the directory, best effort
    async fn republish(&self, instance: &ServiceInstance) {
        match self.directory.register(instance).await {
            Ok(()) => debug!(
                instance_id = %instance.id,
                service = %instance.name,
                backend = self.directory.backend_name(),
                "Republished registered instance missing from directory"
            ),
            Err(e) => warn!(
                instance_id = %instance.id,
                backend = self.directory.backend_name(),
                error = %e,
                "Directory republish failed, instance stays cached locally"
            ),
        }
    }

    /// Snapshot of every service, refreshing each known name first
    pub async fn list_all(&self) -> BTreeMap<String, Vec<ServiceInstance>> {
        let names = self.cache.names();
        join_all(names.iter().map(|name| self.refresh(name))).await;
        self.cache.all()
    }

    /// Snapshot of every service without contacting the directory
    pub fn snapshot(&self) -> BTreeMap<String, Vec<ServiceInstance>> {
        self.cache.all()
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.cache.get(instance_id)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.cache.names()
    }

    pub fn stats(&self) -> RegistryStats {
        let (healthy, unhealthy, unknown) = self.cache.health_counts();
        RegistryStats {
            total_services: self.cache.service_count(),
            total_instances: self.cache.instance_count(),
            healthy,
            unhealthy,
            unknown,
            probes: self.prober.watched().len(),
            directory: self.directory.backend_name().to_string(),
        }
    }

    /// Subscribe to health transitions
    pub fn subscribe_health(&self) -> HealthEventReceiver {
        self.events.subscribe()
    }

    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    /// Count one in-flight proxied call against an instance until the guard drops
    pub fn track_connection(&self, instance_id: &str) -> ConnectionGuard {
        self.cache.adjust_active_connections(instance_id, 1);
        ConnectionGuard {
            cache: self.cache.clone(),
            instance_id: instance_id.to_string(),
        }
    }

    /// Periodically run [`ServiceRegistry::list_all`] until `shutdown` fires
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let services = self.list_all().await;
                        debug!(services = services.len(), "Periodic registry refresh complete");
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Registry refresh loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Stop every probe task
    pub async fn shutdown(&self) {
        self.prober.shutdown().await;
        info!("Service registry shut down");
    }
}

/// Decrements the instance's `activeConnections` when dropped
pub struct ConnectionGuard {
    cache: Arc<InstanceCache>,
    instance_id: String,
}

impl ConnectionGuard {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.cache.adjust_active_connections(&self.instance_id, -1);
    }
}

/// Service registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    /// Running probe tasks
    pub probes: usize,
    /// Directory backend name
    pub directory: String,
}
