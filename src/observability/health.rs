//! # Health Prober Module
//!
//! One independent periodic probe task per instance. Each tick issues
//! `GET {protocol}://{host}:{port}{path}` with the configured timeout and classifies
//! the result: any 2xx is healthy, anything else (other status, timeout, connection
//! error) is unhealthy after `retries` extra attempts.
//!
//! The cached health only changes on a transition, and each transition publishes
//! exactly one [`HealthChanged`] on the broadcast bus. Repeated identical results
//! publish nothing; flapping publishes one event per flip.
//!
//! Tasks are tracked in a map from instance id to `JoinHandle`. [`HealthProber::unwatch`]
//! aborts the task and waits for it to finish before returning.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::config::HealthCheckConfig;
use crate::core::error::{MeshError, MeshResult};
use crate::core::types::{HealthStatus, ServiceInstance};
use crate::discovery::cache::InstanceCache;

/// Published once per health transition of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthChanged {
    pub instance_id: String,
    pub service: String,
    pub old_status: HealthStatus,
    pub new_status: HealthStatus,
    pub changed_at: DateTime<Utc>,
}

/// Type aliases for health event channels
pub type HealthEventSender = broadcast::Sender<HealthChanged>;
pub type HealthEventReceiver = broadcast::Receiver<HealthChanged>;

/// Capacity of the health event bus
pub const HEALTH_EVENT_CAPACITY: usize = 1024;

/// Everything a probe task needs, cheap to clone into each task
#[derive(Clone)]
struct ProbeRunner {
    client: HttpClient,
    config: Arc<HealthCheckConfig>,
    cache: Arc<InstanceCache>,
    events: HealthEventSender,
}

impl ProbeRunner {
    fn probe_url(&self, instance: &ServiceInstance) -> String {
        format!("{}{}", instance.base_url(), self.config.path)
    }

    /// Classify one tick: 1 + `retries` attempts, healthy on the first 2xx
    async fn probe(&self, instance: &ServiceInstance) -> HealthStatus {
        let url = self.probe_url(instance);
        let attempts = self.config.retries.saturating_add(1);
        let start = Instant::now();

        for attempt in 1..=attempts {
            match timeout(self.config.timeout, self.client.get(&url).send()).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    histogram!("mesh_health_probe_duration_seconds")
                        .record(start.elapsed().as_secs_f64());
                    return HealthStatus::Healthy;
                }
                Ok(Ok(response)) => {
                    debug!(instance_id = %instance.id, attempt, status = %response.status(), "Health probe returned non-success status");
                }
                Ok(Err(e)) => {
                    debug!(instance_id = %instance.id, attempt, error = %e, "Health probe request failed");
                }
                Err(_) => {
                    debug!(instance_id = %instance.id, attempt, timeout = ?self.config.timeout, "Health probe timed out");
                }
            }
        }

        histogram!("mesh_health_probe_duration_seconds").record(start.elapsed().as_secs_f64());
        HealthStatus::Unhealthy
    }

    /// Probe and apply the result to the cache
    async fn tick(&self, instance: &ServiceInstance) -> Option<HealthChanged> {
        let observed = self.probe(instance).await;
        counter!("mesh_health_probes_total", "result" => observed.to_string()).increment(1);

        let change = self.cache.record_probe(&instance.id, observed, &self.events);
        if let Some(ref event) = change {
            info!(
                instance_id = %event.instance_id,
                service = %event.service,
                old_status = %event.old_status,
                new_status = %event.new_status,
                "Instance health changed"
            );
        }
        change
    }
}

/// Schedules and cancels per-instance health probes
pub struct HealthProber {
    runner: ProbeRunner,
    /// Active probe tasks: instance id -> task handle
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl HealthProber {
    /// Create a prober sharing `cache` with the registry and publishing on `events`
    pub fn new(
        config: HealthCheckConfig,
        cache: Arc<InstanceCache>,
        events: HealthEventSender,
    ) -> MeshResult<Self> {
        // Redirects count as non-2xx answers
        let client = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| MeshError::internal(format!("Failed to create probe client: {}", e)))?;

        Ok(Self {
            runner: ProbeRunner {
                client,
                config: Arc::new(config),
                cache,
                events,
            },
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Start the periodic probe for a cached instance.
    ///
    /// The first tick fires one interval after the call. Returns `false` when a
    /// live task already watches the instance.
    pub fn watch(&self, instance_id: &str) -> bool {
        let mut tasks = self.tasks.lock();
        if let Some(handle) = tasks.get(instance_id) {
            if !handle.is_finished() {
                return false;
            }
        }

        let runner = self.runner.clone();
        let id = instance_id.to_string();
        let period = runner.config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(instance) = runner.cache.get(&id) else {
                    debug!(instance_id = %id, "Instance left the cache, stopping probe");
                    break;
                };
                runner.tick(&instance).await;
            }
        });

        tasks.insert(instance_id.to_string(), handle);
        gauge!("mesh_health_probe_tasks").set(tasks.len() as f64);
        debug!(instance_id = %instance_id, interval = ?period, "Health probe started");
        true
    }

    /// Cancel the probe of an instance and wait until the task has stopped
    pub async fn unwatch(&self, instance_id: &str) -> bool {
        let handle = {
            let mut tasks = self.tasks.lock();
            let handle = tasks.remove(instance_id);
            gauge!("mesh_health_probe_tasks").set(tasks.len() as f64);
            handle
        };

        match handle {
            Some(handle) => {
                handle.abort();
                // A cancelled task resolves to a JoinError; either outcome means it stopped
                let _ = handle.await;
                debug!(instance_id = %instance_id, "Health probe stopped");
                true
            }
            None => false,
        }
    }

    /// Run one probe tick immediately, outside the schedule
    pub async fn check_now(&self, instance_id: &str) -> MeshResult<Option<HealthChanged>> {
        let instance = self.runner.cache.get(instance_id).ok_or_else(|| {
            MeshError::validation("instance_id", format!("unknown instance: {}", instance_id))
        })?;
        Ok(self.runner.tick(&instance).await)
    }

    /// Classify an instance without touching the cache
    pub async fn probe(&self, instance: &ServiceInstance) -> HealthStatus {
        self.runner.probe(instance).await
    }

    pub fn is_watching(&self, instance_id: &str) -> bool {
        self.tasks
            .lock()
            .get(instance_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Ids of instances with a live probe task, sorted.
    ///
    /// Tasks that stopped on their own (instance left the cache) are pruned here.
    pub fn watched(&self) -> Vec<String> {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        gauge!("mesh_health_probe_tasks").set(tasks.len() as f64);

        let mut ids: Vec<String> = tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscribe(&self) -> HealthEventReceiver {
        self.runner.events.subscribe()
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.runner.config
    }

    /// Stop every probe task
    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = self.tasks.lock().drain().collect();
        let count = handles.len();

        for (_, handle) in &handles {
            handle.abort();
        }
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(instance_id = %id, error = %e, "Health probe task failed");
                }
            }
        }

        gauge!("mesh_health_probe_tasks").set(0.0);
        info!(stopped = count, "All health probes stopped");
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}
