//! In-memory instance cache shared by the registry and the health prober.
//!
//! Instances are kept in per-service lists (`DashMap<String, Vec<ServiceInstance>>`)
//! plus an id index. Every mutation of a list happens while holding that list's
//! entry guard, so readers always clone a complete list. Health transitions are
//! published while the guard is held: once an instance has been removed, no later
//! event can reference it.
//!
//! Instances registered through the registry are remembered as local. A directory
//! listing never drops them; only deregistration does.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::core::types::{HealthStatus, ServiceInstance, ACTIVE_CONNECTIONS_KEY};
use crate::observability::health::{HealthChanged, HealthEventSender};

/// Outcome of an upsert
#[derive(Debug, Clone)]
pub struct Upserted {
    /// Stored record, carrying any state preserved from a previous registration
    pub instance: ServiceInstance,
    /// True when the id was not cached before
    pub inserted: bool,
}

/// Outcome of a directory merge
#[derive(Debug, Clone, Default)]
pub struct Merged {
    /// The list now cached for the service
    pub instances: Vec<ServiceInstance>,
    /// Ids that were not cached before
    pub added: Vec<String>,
    /// Discovered instances the listing no longer contains
    pub dropped: Vec<ServiceInstance>,
    /// Locally registered instances missing from the listing, kept in the cache
    pub unlisted: Vec<ServiceInstance>,
}

/// Thread-safe cache of service instances
#[derive(Debug, Default)]
pub struct InstanceCache {
    /// Instances indexed by service name, in registration order
    services: DashMap<String, Vec<ServiceInstance>>,
    /// Service name indexed by instance id
    index: DashMap<String, String>,
    /// Ids registered locally rather than discovered
    local: DashSet<String>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a locally registered instance, keyed by id.
    ///
    /// Replacing keeps the probed health, the last transition time and the live
    /// connection counter, so re-registration never resets prober state.
    pub fn upsert(&self, mut instance: ServiceInstance) -> Upserted {
        // Marked before it becomes visible so a concurrent merge cannot drop it
        self.local.insert(instance.id.clone());

        let previous_name = self.index.get(&instance.id).map(|name| name.value().clone());

        // Moving an id to another service name drops it from the old list first
        if let Some(old_name) = previous_name.as_deref() {
            if old_name != instance.name {
                self.remove_from_list(old_name, &instance.id);
            }
        }

        let mut inserted = true;
        {
            let mut list = self.services.entry(instance.name.clone()).or_default();
            if let Some(existing) = list.iter_mut().find(|existing| existing.id == instance.id) {
                instance.health = existing.health;
                instance.last_health_check = existing.last_health_check;
                if let Some(active) = existing.metadata.get(ACTIVE_CONNECTIONS_KEY) {
                    instance
                        .metadata
                        .insert(ACTIVE_CONNECTIONS_KEY.to_string(), active.clone());
                }
                *existing = instance.clone();
                inserted = false;
            } else {
                list.push(instance.clone());
            }
        }

        self.index.insert(instance.id.clone(), instance.name.clone());
        debug!(instance_id = %instance.id, service = %instance.name, inserted, "Cached service instance");

        Upserted { instance, inserted }
    }

    /// Remove an instance from every list it appears in
    pub fn remove(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.index.remove(instance_id);
        self.local.remove(instance_id);

        let mut removed = None;
        self.services.retain(|_, list| {
            if let Some(position) = list.iter().position(|instance| instance.id == instance_id) {
                removed = Some(list.remove(position));
            }
            !list.is_empty()
        });

        if removed.is_some() {
            debug!(instance_id = %instance_id, "Removed service instance from cache");
        }
        removed
    }

    fn remove_from_list(&self, name: &str, instance_id: &str) {
        if let Some(mut list) = self.services.get_mut(name) {
            list.retain(|instance| instance.id != instance_id);
        }
        self.services.remove_if(name, |_, list| list.is_empty());
    }

    /// Replace the list of one service with a directory listing.
    ///
    /// Instances already cached keep their probed health, last transition time and
    /// connection counter; new ones start as `Unknown`. Locally registered instances
    /// missing from the listing stay cached and are reported as `unlisted`. The merge
    /// happens under the list guard so a concurrent probe result is never lost.
    pub fn merge_service(&self, name: &str, listed: Vec<ServiceInstance>) -> Merged {
        let (instances, added, dropped, unlisted) = {
            let mut list = self.services.entry(name.to_string()).or_default();

            let mut added = Vec::new();
            let mut merged: Vec<ServiceInstance> = listed
                .into_iter()
                .map(|mut fresh| {
                    match list.iter().find(|cached| cached.id == fresh.id) {
                        Some(cached) => {
                            fresh.health = cached.health;
                            fresh.last_health_check = cached.last_health_check;
                            if let Some(active) = cached.metadata.get(ACTIVE_CONNECTIONS_KEY) {
                                fresh
                                    .metadata
                                    .insert(ACTIVE_CONNECTIONS_KEY.to_string(), active.clone());
                            }
                        }
                        None => {
                            fresh.health = HealthStatus::Unknown;
                            fresh.last_health_check = None;
                            added.push(fresh.id.clone());
                        }
                    }
                    fresh
                })
                .collect();

            let (unlisted, dropped): (Vec<ServiceInstance>, Vec<ServiceInstance>) = list
                .iter()
                .filter(|cached| !merged.iter().any(|fresh| fresh.id == cached.id))
                .cloned()
                .partition(|cached| self.local.contains(&cached.id));

            merged.extend(unlisted.iter().cloned());
            *list = merged.clone();
            (merged, added, dropped, unlisted)
        };

        self.services.remove_if(name, |_, list| list.is_empty());

        for instance in &dropped {
            self.index.remove_if(&instance.id, |_, cached_name| cached_name == name);
        }
        for instance in &instances {
            self.index.insert(instance.id.clone(), name.to_string());
        }

        Merged {
            instances,
            added,
            dropped,
            unlisted,
        }
    }

    /// Snapshot of one service list
    pub fn snapshot(&self, name: &str) -> Option<Vec<ServiceInstance>> {
        self.services.get(name).map(|list| list.value().clone())
    }

    pub fn get(&self, instance_id: &str) -> Option<ServiceInstance> {
        let name = self.index.get(instance_id).map(|name| name.value().clone())?;
        self.services
            .get(&name)
            .and_then(|list| list.iter().find(|instance| instance.id == instance_id).cloned())
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.index.contains_key(instance_id)
    }

    /// True when the instance was registered locally rather than discovered
    pub fn is_local(&self, instance_id: &str) -> bool {
        self.local.contains(instance_id)
    }

    /// Known service names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot of the full cache
    pub fn all(&self) -> BTreeMap<String, Vec<ServiceInstance>> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Apply one probe result.
    ///
    /// Health and `last_health_check` change only when `observed` differs from the
    /// cached state; in that case exactly one [`HealthChanged`] is published.
    pub fn record_probe(
        &self,
        instance_id: &str,
        observed: HealthStatus,
        events: &HealthEventSender,
    ) -> Option<HealthChanged> {
        let name = self.index.get(instance_id).map(|name| name.value().clone())?;
        let mut list = self.services.get_mut(&name)?;
        let instance = list.iter_mut().find(|instance| instance.id == instance_id)?;

        if instance.health == observed {
            return None;
        }

        let changed_at = Utc::now();
        let event = HealthChanged {
            instance_id: instance.id.clone(),
            service: instance.name.clone(),
            old_status: instance.health,
            new_status: observed,
            changed_at,
        };
        instance.health = observed;
        instance.last_health_check = Some(changed_at);

        // No subscribers is not an error
        let _ = events.send(event.clone());
        Some(event)
    }

    /// Shift the `activeConnections` counter of an instance, saturating at zero
    pub fn adjust_active_connections(&self, instance_id: &str, delta: i64) {
        let Some(name) = self.index.get(instance_id).map(|name| name.value().clone()) else {
            return;
        };
        let Some(mut list) = self.services.get_mut(&name) else {
            return;
        };
        let Some(instance) = list.iter_mut().find(|instance| instance.id == instance_id) else {
            warn!(instance_id = %instance_id, "Connection counter update for unindexed instance");
            return;
        };

        let current = instance.active_connections() as i64;
        let next = (current + delta).max(0);
        instance
            .metadata
            .insert(ACTIVE_CONNECTIONS_KEY.to_string(), next.to_string());
    }

    /// Counts per health state: (healthy, unhealthy, unknown)
    pub fn health_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for entry in self.services.iter() {
            for instance in entry.value() {
                match instance.health {
                    HealthStatus::Healthy => counts.0 += 1,
                    HealthStatus::Unhealthy => counts.1 += 1,
                    HealthStatus::Unknown => counts.2 += 1,
                }
            }
        }
        counts
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn instance_count(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }
}
