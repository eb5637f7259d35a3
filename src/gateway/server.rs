//! # HTTP Server Module
//!
//! Composition root of the dispatcher. The server owns the registry (and with it the
//! prober), the configured load balancer and the router, and exposes them over HTTP:
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/health` | mesh self-health, always 200 |
//! | GET | `/services` | full registry snapshot |
//! | GET | `/services/stats` | registry counters |
//! | GET | `/services/:name` | instances of one service |
//! | POST | `/services/:name/register` | register an instance |
//! | DELETE | `/services/:name/:id` | deregister an instance |
//! | GET | `/balancer/stats` | selection statistics |
//! | GET | `/metrics` | Prometheus exposition |
//! | any | `{prefix}/*path` | proxy through the router |
//!
//! Every response carries `x-trace-id`, reusing the inbound value when present.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, delete, get, post},
    Json, Router as AxumRouter,
};
use chrono::{DateTime, Utc};
use http_body_util::LengthLimitError;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::config::MeshConfig;
use crate::core::error::{MeshError, MeshResult};
use crate::core::types::{IncomingRequest, InstanceRegistration, UpstreamResponse, TRACE_ID_HEADER};
use crate::discovery::directory::InstanceDirectory;
use crate::discovery::registry::ServiceRegistry;
use crate::load_balancing::create_load_balancer;
use crate::observability::sinks::{forward_health_events, sinks_from_config};
use crate::routing::{Forwarder, MeshRouter};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct MeshState {
    pub config: Arc<MeshConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub router: Arc<MeshRouter>,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: DateTime<Utc>,
}

/// Mesh HTTP server
pub struct MeshServer {
    state: MeshState,
}

impl MeshServer {
    /// Wire registry, prober, balancer and router from `config`
    pub fn new(config: MeshConfig, directory: Arc<dyn InstanceDirectory>) -> MeshResult<Self> {
        config.validate()?;

        let registry = Arc::new(ServiceRegistry::new(directory, config.health_check.clone())?);
        let balancer = create_load_balancer(config.load_balancing.strategy);
        let forwarder = Forwarder::new(config.server.proxy_timeout)?;
        let router = Arc::new(MeshRouter::new(
            registry.clone(),
            balancer,
            forwarder,
            config.server.proxy_prefix.clone(),
        ));

        info!(
            mesh = %config.mesh.name,
            namespace = %config.mesh.namespace,
            strategy = %config.load_balancing.strategy,
            prefix = %config.server.proxy_prefix,
            "Mesh server initialized"
        );

        Ok(Self {
            state: MeshState {
                config: Arc::new(config),
                registry,
                router,
                metrics: None,
                started_at: Utc::now(),
            },
        })
    }

    /// Expose an installed Prometheus recorder on `GET /metrics`
    pub fn with_metrics_handle(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.state.registry.clone()
    }

    pub fn router(&self) -> Arc<MeshRouter> {
        self.state.router.clone()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.state.config
    }

    /// Build the axum application
    pub fn app(&self) -> AxumRouter {
        let proxy_route = format!("{}/*path", self.state.router.prefix());

        AxumRouter::new()
            .route("/health", get(health_check))
            .route("/services", get(list_services))
            .route("/services/stats", get(registry_stats))
            .route("/services/:name", get(get_service))
            .route("/services/:name/register", post(register_instance))
            .route("/services/:name/:id", delete(deregister_instance))
            .route("/balancer/stats", get(balancer_stats))
            .route("/metrics", get(metrics_export))
            .route(&proxy_route, any(proxy_request))
            .layer(middleware::from_fn(trace_id_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Re-emit health transitions to the sinks enabled in config
    pub fn forward_health_events(&self) -> JoinHandle<()> {
        let sinks = sinks_from_config(&self.state.config.observability);
        forward_health_events(self.state.registry.subscribe_health(), sinks)
    }

    /// Serve until `shutdown` is cancelled, then stop every probe task
    #[instrument(skip(self, shutdown))]
    pub async fn start(self, shutdown: CancellationToken) -> MeshResult<()> {
        let server = &self.state.config.server;
        let bind_addr = format!("{}:{}", server.bind_address, server.port);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| MeshError::internal(format!("Failed to bind mesh server to {}: {}", bind_addr, e)))?;
        info!("Mesh server listening on {}", bind_addr);

        let forwarder = self.forward_health_events();
        let refresher = self.state.config.discovery.refresh_interval.map(|period| {
            self.state
                .registry
                .clone()
                .spawn_refresh_loop(period, shutdown.clone())
        });

        let app = self.app();
        let signal = shutdown.clone();
        let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
            .map_err(|e| MeshError::internal(format!("Mesh server error: {}", e)));

        info!("Mesh server stopped accepting requests, shutting down");
        self.state.registry.shutdown().await;
        forwarder.abort();
        if let Some(refresher) = refresher {
            refresher.abort();
        }

        result
    }
}

/// Stamp `x-trace-id` on the request (when missing) and on the response
async fn trace_id_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = match request.headers().get(TRACE_ID_HEADER) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => {
            let generated = HeaderValue::from_str(&Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
            request.headers_mut().insert(TRACE_ID_HEADER, generated.clone());
            generated
        }
    };

    let mut response = next.run(request).await;
    if !response.headers().contains_key(TRACE_ID_HEADER) {
        response.headers_mut().insert(TRACE_ID_HEADER, trace_id);
    }
    response
}

/// Mesh self-health
async fn health_check(State(state): State<MeshState>) -> impl IntoResponse {
    let uptime = Utc::now().signed_duration_since(state.started_at);
    Json(json!({
        "status": "healthy",
        "mesh": state.config.mesh.name,
        "namespace": state.config.mesh.namespace,
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_seconds": uptime.num_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_services(State(state): State<MeshState>) -> impl IntoResponse {
    Json(state.registry.list_all().await)
}

async fn get_service(State(state): State<MeshState>, Path(name): Path<String>) -> MeshResult<impl IntoResponse> {
    let instances = state.registry.discover(&name).await;
    if instances.is_empty() {
        return Err(MeshError::service_not_found(name));
    }
    Ok(Json(instances))
}

async fn register_instance(
    State(state): State<MeshState>,
    Path(name): Path<String>,
    payload: Result<Json<InstanceRegistration>, JsonRejection>,
) -> MeshResult<impl IntoResponse> {
    let Json(registration) = payload.map_err(|rejection| MeshError::validation("body", rejection.body_text()))?;
    let instance = registration.into_instance(&name)?;
    let stored = state.registry.register(instance).await?;
    Ok(Json(stored))
}

async fn deregister_instance(
    State(state): State<MeshState>,
    Path((name, id)): Path<(String, String)>,
) -> MeshResult<impl IntoResponse> {
    match state.registry.get_instance(&id) {
        Some(instance) if instance.name == name => {}
        _ => {
            return Err(MeshError::service_not_found(format!("{}/{}", name, id)));
        }
    }

    state.registry.deregister(&id).await;
    Ok(Json(json!({ "deregistered": id, "service": name })))
}

async fn registry_stats(State(state): State<MeshState>) -> impl IntoResponse {
    Json(state.registry.stats())
}

async fn balancer_stats(State(state): State<MeshState>) -> impl IntoResponse {
    Json(state.router.balancer().stats())
}

async fn metrics_export(State(state): State<MeshState>) -> Response {
    match state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter is not installed").into_response(),
    }
}

/// Proxy route: buffer the request and hand it to the router
async fn proxy_request(State(state): State<MeshState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let limit = state.config.server.max_body_size;
    let body = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) if exceeds_length_limit(&e) => {
            warn!(max_size = limit, "Request body exceeds maximum size");
            return MeshError::payload_too_large(limit).into_response();
        }
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return MeshError::validation("body", format!("failed to read request body: {}", e)).into_response();
        }
    };

    let incoming = IncomingRequest::new(parts.method, parts.uri, parts.headers, body, remote_addr);
    match state.router.route(incoming).await {
        Ok(upstream) => into_axum_response(upstream),
        Err(e) => e.into_response(),
    }
}

/// Whether a body read failed on the buffer limit rather than the transport
fn exceeds_length_limit(err: &axum::Error) -> bool {
    let mut source = StdError::source(err);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}

fn into_axum_response(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    response
}
