//! # Load Balancer Module
//!
//! Interchangeable selection strategies over a slice of service instances.
//!
//! Every strategy first keeps only `Healthy` instances and returns `None` when that
//! leaves nothing; the router turns `None` into `NoHealthyInstance`.
//!
//! ## Load Balancing Algorithms
//!
//! 1. **Round Robin**: one atomic cursor per balancer, `healthy[cursor % len]`. The
//!    cursor is never reset when the healthy set changes size, so strict fairness
//!    only holds between membership changes.
//! 2. **Weighted Round Robin**: weighted random pick over an `(instance, weight)`
//!    table per service, built from the first non-empty healthy set seen for that
//!    service. The table is reused afterwards even if membership changes; only
//!    [`LoadBalancer::reset`] clears it.
//! 3. **Least Connections**: minimum `metadata.activeConnections` (missing = 0),
//!    ties go to the first instance in list order.

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::config::LoadBalancingStrategy;
use crate::core::types::ServiceInstance;
use crate::observability::metrics::record_selection;

/// Core trait for load balancing algorithms.
///
/// Implementations hold their own mutable state and must tolerate concurrent calls.
pub trait LoadBalancer: Send + Sync {
    /// Pick one healthy instance, or `None` when no instance is healthy
    fn select(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance>;

    /// Algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;

    fn stats(&self) -> LoadBalancerStats;

    /// Reset internal state (cursor, weight table, statistics)
    fn reset(&self);
}

/// Load balancer statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub algorithm: String,
    pub total_requests: u64,
    pub total_selections: u64,
    pub failed_selections: u64,
    pub instance_stats: HashMap<String, InstanceStats>,
}

/// Per-instance statistics
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub selections: u64,
    pub last_selected: Option<chrono::DateTime<chrono::Utc>>,
}

/// Selection counters shared by every strategy
#[derive(Debug, Default)]
struct SelectionStats {
    instances: DashMap<String, InstanceStats>,
    total_requests: AtomicU64,
    failed_selections: AtomicU64,
}

impl SelectionStats {
    fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_selections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mesh_lb_failed_selections_total").increment(1);
    }

    fn record_selection(&self, algorithm: &'static str, instance: &ServiceInstance) {
        let mut stats = self
            .instances
            .entry(instance.id.clone())
            .or_insert_with(|| InstanceStats {
                selections: 0,
                last_selected: None,
            });
        stats.selections += 1;
        stats.last_selected = Some(chrono::Utc::now());
        drop(stats);

        record_selection(algorithm, &instance.id);
        debug!(
            instance_id = %instance.id,
            address = %instance.base_url(),
            algorithm,
            "Selected instance"
        );
    }

    fn snapshot(&self, algorithm: &'static str) -> LoadBalancerStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let failed_selections = self.failed_selections.load(Ordering::Relaxed);
        LoadBalancerStats {
            algorithm: algorithm.to_string(),
            total_requests,
            total_selections: total_requests.saturating_sub(failed_selections),
            failed_selections,
            instance_stats: self
                .instances
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        }
    }

    fn clear(&self) {
        self.instances.clear();
        self.total_requests.store(0, Ordering::Relaxed);
        self.failed_selections.store(0, Ordering::Relaxed);
    }
}

fn healthy(instances: &[ServiceInstance]) -> Vec<&ServiceInstance> {
    instances.iter().filter(|instance| instance.is_healthy()).collect()
}

/// Round-robin load balancer with atomic counter
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    cursor: AtomicUsize,
    stats: SelectionStats,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        self.stats.record_request();

        let healthy = healthy(instances);
        if healthy.is_empty() {
            self.stats.record_failure();
            return None;
        }

        // fetch_add is the whole critical section: read, increment and index
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        let selected = healthy[index].clone();

        self.stats.record_selection(self.algorithm_name(), &selected);
        Some(selected)
    }

    fn algorithm_name(&self) -> &'static str {
        "round_robin"
    }

    fn stats(&self) -> LoadBalancerStats {
        self.stats.snapshot(self.algorithm_name())
    }

    fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
        self.stats.clear();
    }
}

/// Weighted random balancer over lazily built, never refreshed weight tables.
///
/// One table per service name. Instances of a service added after its table is
/// built are never selected, and removed ones stay selectable, until
/// [`LoadBalancer::reset`] is called.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinBalancer {
    /// Service name -> weight table
    tables: DashMap<String, Vec<(ServiceInstance, u32)>>,
    stats: SelectionStats,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance ids in the cached table of `service`, if built
    pub fn table_ids(&self, service: &str) -> Option<Vec<String>> {
        self.tables
            .get(service)
            .map(|table| table.iter().map(|(instance, _)| instance.id.clone()).collect())
    }

    fn pick(table: &[(ServiceInstance, u32)]) -> Option<ServiceInstance> {
        let total: u64 = table.iter().map(|(_, weight)| u64::from(*weight)).sum();
        let mut remaining = rand::thread_rng().gen::<f64>() * total as f64;

        for (instance, weight) in table {
            remaining -= f64::from(*weight);
            if remaining <= 0.0 {
                return Some(instance.clone());
            }
        }

        // Floating point leftovers fall back to the first entry
        table.first().map(|(instance, _)| instance.clone())
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn select(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        self.stats.record_request();

        let healthy = healthy(instances);
        if healthy.is_empty() {
            self.stats.record_failure();
            return None;
        }

        // A slice handed in by the router holds one service's instances
        let service = healthy[0].name.clone();
        let selected = {
            let table = self.tables.entry(service.clone()).or_insert_with(|| {
                debug!(service = %service, entries = healthy.len(), "Built weighted selection table");
                healthy
                    .iter()
                    .map(|instance| ((*instance).clone(), instance.weight.max(1)))
                    .collect()
            });
            Self::pick(&table)
        };

        match selected {
            Some(instance) => {
                self.stats.record_selection(self.algorithm_name(), &instance);
                Some(instance)
            }
            None => {
                self.stats.record_failure();
                None
            }
        }
    }

    fn algorithm_name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn stats(&self) -> LoadBalancerStats {
        self.stats.snapshot(self.algorithm_name())
    }

    fn reset(&self) {
        self.tables.clear();
        self.stats.clear();
    }
}

/// Least connections load balancer driven by `metadata.activeConnections`
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer {
    stats: SelectionStats,
}

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        self.stats.record_request();

        let mut best: Option<(&ServiceInstance, u64)> = None;
        for instance in instances.iter().filter(|instance| instance.is_healthy()) {
            let connections = instance.active_connections();
            // Strictly lower wins, so ties keep the first occurrence
            if best.map_or(true, |(_, min)| connections < min) {
                best = Some((instance, connections));
            }
        }

        match best {
            Some((instance, _)) => {
                let selected = instance.clone();
                self.stats.record_selection(self.algorithm_name(), &selected);
                Some(selected)
            }
            None => {
                self.stats.record_failure();
                None
            }
        }
    }

    fn algorithm_name(&self) -> &'static str {
        "least_connections"
    }

    fn stats(&self) -> LoadBalancerStats {
        self.stats.snapshot(self.algorithm_name())
    }

    fn reset(&self) {
        self.stats.clear();
    }
}

/// Factory for the configured strategy
pub fn create_load_balancer(strategy: LoadBalancingStrategy) -> Arc<dyn LoadBalancer> {
    match strategy {
        LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalancingStrategy::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::new()),
        LoadBalancingStrategy::LeastConnections => Arc::new(LeastConnectionsBalancer::new()),
    }
}
