//! # Health Prober Tests
//!
//! Probes run against wiremock backends. Each test checks how many health
//! transitions a sequence of probe outcomes publishes.

use mesh_dispatcher::core::config::HealthCheckConfig;
use mesh_dispatcher::core::types::{HealthStatus, ServiceInstance};
use mesh_dispatcher::discovery::{ServiceRegistry, StaticDirectory};
use mesh_dispatcher::observability::HealthEventReceiver;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn health_config(interval: Duration) -> HealthCheckConfig {
    HealthCheckConfig {
        path: "/health".to_string(),
        interval,
        timeout: Duration::from_millis(300),
        retries: 0,
    }
}

async fn mount_health(server: &MockServer, status: u16) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

fn instance_for(server: &MockServer, id: &str) -> ServiceInstance {
    ServiceInstance::new("inventory", "127.0.0.1", server.address().port()).with_id(id)
}

fn drain(receiver: &mut HealthEventReceiver) -> usize {
    let mut count = 0;
    while receiver.try_recv().is_ok() {
        count += 1;
    }
    count
}

/// Test that the first successful probe publishes exactly one transition
#[tokio::test]
async fn test_healthy_probe_publishes_single_transition() {
    let backend = MockServer::start().await;
    mount_health(&backend, 200).await;

    let registry = ServiceRegistry::new(
        Arc::new(StaticDirectory::new()),
        health_config(Duration::from_secs(3600)),
    )
    .unwrap();
    let mut events = registry.subscribe_health();
    registry.register(instance_for(&backend, "inv-1")).await.unwrap();

    let change = registry.prober().check_now("inv-1").await.unwrap().unwrap();
    assert_eq!(change.old_status, HealthStatus::Unknown);
    assert_eq!(change.new_status, HealthStatus::Healthy);

    let instance = registry.get_instance("inv-1").unwrap();
    assert_eq!(instance.health, HealthStatus::Healthy);
    assert_eq!(instance.last_health_check, Some(change.changed_at));

    // Repeated identical outcomes publish nothing
    for _ in 0..3 {
        assert!(registry.prober().check_now("inv-1").await.unwrap().is_none());
    }
    assert_eq!(drain(&mut events), 1);
}

/// Test that a failing backend is marked unhealthy once
#[tokio::test]
async fn test_failing_probe_marks_unhealthy() {
    let backend = MockServer::start().await;
    mount_health(&backend, 500).await;

    let registry = ServiceRegistry::new(
        Arc::new(StaticDirectory::new()),
        health_config(Duration::from_secs(3600)),
    )
    .unwrap();
    let mut events = registry.subscribe_health();
    registry.register(instance_for(&backend, "inv-1")).await.unwrap();

    let change = registry.prober().check_now("inv-1").await.unwrap().unwrap();
    assert_eq!(change.new_status, HealthStatus::Unhealthy);
    assert!(registry.prober().check_now("inv-1").await.unwrap().is_none());
    assert_eq!(drain(&mut events), 1);
}

/// Test that every flip of the observed status publishes one event
#[tokio::test]
async fn test_flapping_backend_publishes_one_event_per_flip() {
    let backend = MockServer::start().await;
    let registry = ServiceRegistry::new(
        Arc::new(StaticDirectory::new()),
        health_config(Duration::from_secs(3600)),
    )
    .unwrap();
    let mut events = registry.subscribe_health();
    registry.register(instance_for(&backend, "inv-1")).await.unwrap();

    let sequence = [200, 200, 503, 503, 200, 500, 500];
    for status in sequence {
        mount_health(&backend, status).await;
        registry.prober().check_now("inv-1").await.unwrap();
    }

    let mut observed = Vec::new();
    while let Ok(event) = events.try_recv() {
        observed.push(event.new_status);
    }
    assert_eq!(
        observed,
        vec![
            HealthStatus::Healthy,
            HealthStatus::Unhealthy,
            HealthStatus::Healthy,
            HealthStatus::Unhealthy,
        ]
    );
}

/// Test that a slow backend counts as a failed attempt
#[tokio::test]
async fn test_probe_timeout_is_unhealthy() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&backend)
        .await;

    let registry = ServiceRegistry::new(
        Arc::new(StaticDirectory::new()),
        health_config(Duration::from_secs(3600)),
    )
    .unwrap();
    let instance = registry.register(instance_for(&backend, "inv-1")).await.unwrap();

    assert_eq!(registry.prober().probe(&instance).await, HealthStatus::Unhealthy);
}

/// Test that a retry inside one tick can still classify the instance healthy
#[tokio::test]
async fn test_retries_within_a_tick() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&backend)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let config = HealthCheckConfig {
        retries: 1,
        ..health_config(Duration::from_secs(3600))
    };
    let registry = ServiceRegistry::new(Arc::new(StaticDirectory::new()), config).unwrap();
    let instance = registry.register(instance_for(&backend, "inv-1")).await.unwrap();

    assert_eq!(registry.prober().probe(&instance).await, HealthStatus::Healthy);
}

/// Test that the periodic schedule drives transitions without manual checks
#[tokio::test]
async fn test_periodic_probe_transitions_instance() {
    let backend = MockServer::start().await;
    mount_health(&backend, 200).await;

    let registry = ServiceRegistry::new(
        Arc::new(StaticDirectory::new()),
        health_config(Duration::from_millis(50)),
    )
    .unwrap();
    let mut events = registry.subscribe_health();
    registry.register(instance_for(&backend, "inv-1")).await.unwrap();

    let change = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no transition within timeout")
        .unwrap();
    assert_eq!(change.instance_id, "inv-1");
    assert_eq!(change.new_status, HealthStatus::Healthy);

    registry.shutdown().await;
}

/// Test that no events are published for an instance after it is deregistered
#[tokio::test]
async fn test_no_events_after_deregistration() {
    let backend = MockServer::start().await;
    mount_health(&backend, 200).await;

    let registry = ServiceRegistry::new(
        Arc::new(StaticDirectory::new()),
        health_config(Duration::from_millis(20)),
    )
    .unwrap();
    let mut events = registry.subscribe_health();
    registry.register(instance_for(&backend, "inv-1")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no transition within timeout")
        .unwrap();

    assert!(registry.deregister("inv-1").await);
    assert!(!registry.prober().is_watching("inv-1"));

    // The backend now fails; a surviving probe would report it
    mount_health(&backend, 500).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(drain(&mut events), 0);
    assert!(registry.get_instance("inv-1").is_none());
}

/// Test that manual checks reject instances the registry does not know
#[tokio::test]
async fn test_check_now_unknown_instance() {
    let registry = ServiceRegistry::new(
        Arc::new(StaticDirectory::new()),
        health_config(Duration::from_secs(3600)),
    )
    .unwrap();

    assert!(registry.prober().check_now("ghost").await.is_err());
}
