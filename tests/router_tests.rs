//! # Router Tests
//!
//! End-to-end routing through the registry, a load balancer and the forwarder, with
//! wiremock standing in for service instances.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use mesh_dispatcher::core::config::HealthCheckConfig;
use mesh_dispatcher::core::error::MeshError;
use mesh_dispatcher::core::types::{ServiceInstance, TRACE_ID_HEADER};
use mesh_dispatcher::discovery::{ServiceRegistry, StaticDirectory};
use mesh_dispatcher::load_balancing::{
    LeastConnectionsBalancer, LoadBalancer, RoundRobinBalancer, WeightedRoundRobinBalancer,
};
use mesh_dispatcher::routing::{Forwarder, MeshRouter};
use mesh_dispatcher::IncomingRequest;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registry() -> Arc<ServiceRegistry> {
    let config = HealthCheckConfig {
        interval: Duration::from_secs(3600),
        timeout: Duration::from_millis(500),
        retries: 0,
        ..HealthCheckConfig::default()
    };
    Arc::new(ServiceRegistry::new(Arc::new(StaticDirectory::new()), config).unwrap())
}

fn router_with(
    registry: Arc<ServiceRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    proxy_timeout: Duration,
) -> MeshRouter {
    MeshRouter::new(registry, balancer, Forwarder::new(proxy_timeout).unwrap(), "/api")
}

async fn healthy_backend() -> MockServer {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;
    backend
}

/// Register an instance whose listener answers one health check and then closes
async fn register_then_close(registry: &ServiceRegistry, name: &str, id: &str) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
    });

    registry
        .register(ServiceInstance::new(name, "127.0.0.1", port).with_id(id))
        .await
        .unwrap();
    registry.prober().check_now(id).await.unwrap();
    assert!(registry.get_instance(id).unwrap().is_healthy());

    // The listener is dropped with the task
    serving.await.unwrap();
}

/// Register an instance pointing at `backend` and probe it once
async fn register_healthy(registry: &ServiceRegistry, name: &str, id: &str, backend: &MockServer) {
    registry
        .register(ServiceInstance::new(name, "127.0.0.1", backend.address().port()).with_id(id))
        .await
        .unwrap();
    registry.prober().check_now(id).await.unwrap();
    assert!(registry.get_instance(id).unwrap().is_healthy());
}

fn request(method: Method, uri: &str, headers: &[(&str, &str)], body: &'static str) -> IncomingRequest {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    IncomingRequest::new(
        method,
        uri.parse().unwrap(),
        map,
        Bytes::from_static(body.as_bytes()),
        Some("10.0.0.9:51000".parse().unwrap()),
    )
}

/// Test that an unknown service name is reported as not found
#[tokio::test]
async fn test_unknown_service_is_not_found() {
    let router = router_with(registry(), Arc::new(RoundRobinBalancer::new()), Duration::from_secs(1));

    let err = router
        .route(request(Method::GET, "/api/ghost/items", &[], ""))
        .await
        .unwrap_err();

    assert!(matches!(err, MeshError::ServiceNotFound { ref service } if service == "ghost"));
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
}

/// Test that a service with only unprobed instances has no healthy instance
#[tokio::test]
async fn test_unprobed_instances_are_not_selected() {
    let registry = registry();
    registry
        .register(ServiceInstance::new("orders", "127.0.0.1", 9100).with_id("orders-1"))
        .await
        .unwrap();
    let router = router_with(registry, Arc::new(RoundRobinBalancer::new()), Duration::from_secs(1));

    let err = router
        .route(request(Method::GET, "/api/orders/items", &[], ""))
        .await
        .unwrap_err();

    assert!(matches!(err, MeshError::NoHealthyInstance { .. }));
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}

/// Test that the request reaches the upstream with prefix stripped and headers injected
#[tokio::test]
async fn test_forwarding_rewrites_path_and_injects_headers() {
    let backend = healthy_backend().await;
    Mock::given(method("POST"))
        .and(path("/items/42"))
        .and(query_param("page", "2"))
        .and(header("x-trace-id", "trace-abc"))
        .and(header("x-forwarded-for", "10.0.0.9"))
        .and(header("x-forwarded-host", "mesh.local"))
        .and(header("x-tenant", "acme"))
        .and(body_string("{\"qty\":3}"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-upstream", "inventory")
                .set_body_string("created"),
        )
        .expect(1)
        .mount(&backend)
        .await;

    let registry = registry();
    register_healthy(&registry, "orders", "orders-1", &backend).await;
    let router = router_with(registry.clone(), Arc::new(RoundRobinBalancer::new()), Duration::from_secs(2));

    let response = router
        .route(request(
            Method::POST,
            "/api/orders/items/42?page=2",
            &[
                (TRACE_ID_HEADER, "trace-abc"),
                ("host", "mesh.local"),
                ("x-tenant", "acme"),
                ("connection", "keep-alive"),
            ],
            "{\"qty\":3}",
        ))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body, Bytes::from_static(b"created"));
    assert_eq!(response.headers.get("x-upstream").unwrap(), "inventory");
    assert_eq!(response.headers.get(TRACE_ID_HEADER).unwrap(), "trace-abc");

    // The connection counter is released once the call completes
    assert_eq!(registry.get_instance("orders-1").unwrap().active_connections(), 0);
}

/// Test that upstream error statuses are relayed, not converted
#[tokio::test]
async fn test_upstream_errors_are_relayed() {
    let backend = healthy_backend().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&backend)
        .await;

    let registry = registry();
    register_healthy(&registry, "orders", "orders-1", &backend).await;
    let router = router_with(registry, Arc::new(RoundRobinBalancer::new()), Duration::from_secs(2));

    let response = router
        .route(request(Method::GET, "/api/orders/broken", &[], ""))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.body, Bytes::from_static(b"boom"));
    assert!(response.headers.contains_key(TRACE_ID_HEADER));
}

/// Test that an upstream slower than the proxy timeout is unavailable
#[tokio::test]
async fn test_upstream_timeout_is_unavailable() {
    let backend = healthy_backend().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&backend)
        .await;

    let registry = registry();
    register_healthy(&registry, "orders", "orders-1", &backend).await;
    let router = router_with(registry.clone(), Arc::new(RoundRobinBalancer::new()), Duration::from_millis(200));

    let err = router
        .route(request(Method::GET, "/api/orders/slow", &[], ""))
        .await
        .unwrap_err();

    assert!(matches!(err, MeshError::UpstreamUnavailable { .. }));
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(registry.get_instance("orders-1").unwrap().active_connections(), 0);
}

/// Test that round-robin routing spreads requests over every healthy instance
#[tokio::test]
async fn test_round_robin_routing_spreads_requests() {
    let registry = registry();
    let mut backends = Vec::new();
    for i in 0..3 {
        let backend = healthy_backend().await;
        Mock::given(method("GET"))
            .and(path("/whoami"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("backend-{}", i)))
            .mount(&backend)
            .await;
        register_healthy(&registry, "orders", &format!("orders-{}", i), &backend).await;
        backends.push(backend);
    }
    let router = router_with(registry, Arc::new(RoundRobinBalancer::new()), Duration::from_secs(2));

    let mut seen = HashSet::new();
    for _ in 0..3 {
        let response = router
            .route(request(Method::GET, "/api/orders/whoami", &[], ""))
            .await
            .unwrap();
        seen.insert(String::from_utf8(response.body.to_vec()).unwrap());
    }

    assert_eq!(seen.len(), 3);
}

/// Test that least-connections prefers the idle instance while another is busy
#[tokio::test]
async fn test_least_connections_avoids_busy_instance() {
    let registry = registry();
    let busy = healthy_backend().await;
    let idle = healthy_backend().await;
    for backend in [&busy, &idle] {
        Mock::given(method("GET"))
            .and(path("/work"))
            .respond_with(ResponseTemplate::new(200))
            .mount(backend)
            .await;
    }
    register_healthy(&registry, "orders", "orders-a", &busy).await;
    register_healthy(&registry, "orders", "orders-b", &idle).await;

    let router = router_with(
        registry.clone(),
        Arc::new(LeastConnectionsBalancer::new()),
        Duration::from_secs(2),
    );

    let _in_flight = registry.track_connection("orders-a");
    let selected = router.select_instance("orders").await.unwrap();
    assert_eq!(selected.id, "orders-b");

    router
        .route(request(Method::GET, "/api/orders/work", &[], ""))
        .await
        .unwrap();
    let served = idle
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|received| received.url.path() == "/work")
        .count();
    assert_eq!(served, 1);
}

/// Test that a healthy instance refusing connections is reported as unavailable
#[tokio::test]
async fn test_refused_connection_is_unavailable() {
    let registry = registry();
    register_then_close(&registry, "orders", "orders-1").await;
    let router = router_with(registry.clone(), Arc::new(RoundRobinBalancer::new()), Duration::from_secs(2));

    let err = router
        .route(request(Method::GET, "/api/orders/items", &[], ""))
        .await
        .unwrap_err();

    assert!(
        matches!(err, MeshError::UpstreamUnavailable { ref instance, .. } if instance == "orders-1"),
        "unexpected error: {}",
        err
    );
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(registry.get_instance("orders-1").unwrap().active_connections(), 0);
}

/// Test that weighted routing keeps each service on its own instances
#[tokio::test]
async fn test_weighted_routing_stays_within_service() {
    let registry = registry();
    let orders = healthy_backend().await;
    let billing = healthy_backend().await;
    for (backend, body) in [(&orders, "orders"), (&billing, "billing")] {
        Mock::given(method("GET"))
            .and(path("/whoami"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(backend)
            .await;
    }
    register_healthy(&registry, "orders", "orders-1", &orders).await;
    register_healthy(&registry, "billing", "billing-1", &billing).await;

    let router = router_with(
        registry,
        Arc::new(WeightedRoundRobinBalancer::new()),
        Duration::from_secs(2),
    );

    for service in ["orders", "billing", "orders", "billing"] {
        let response = router
            .route(request(Method::GET, &format!("/api/{}/whoami", service), &[], ""))
            .await
            .unwrap();
        assert_eq!(response.body, Bytes::from(service));
    }
}
