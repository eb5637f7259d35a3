//! Reverse-proxy forwarding to a selected instance.
//!
//! Method, body and query string are preserved. Hop-by-hop headers are stripped in
//! both directions, `x-trace-id`, `x-forwarded-for` and `x-forwarded-host` are set on
//! the upstream call, and upstream redirects are relayed rather than followed.
//!
//! axum speaks `http` 1.x types while reqwest 0.11 speaks `http` 0.2, so methods and
//! headers cross the boundary as strings and bytes.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use reqwest::Client as HttpClient;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::{MeshError, MeshResult};
use crate::core::types::{IncomingRequest, ServiceInstance, UpstreamResponse, TRACE_ID_HEADER};

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Build `protocol://host:port/{rest}?{query}` for an instance
pub fn target_url(instance: &ServiceInstance, rest: &str, query: Option<&str>) -> MeshResult<Url> {
    let mut target = format!("{}/{}", instance.base_url(), rest.trim_start_matches('/'));
    if let Some(query) = query.filter(|query| !query.is_empty()) {
        target.push('?');
        target.push_str(query);
    }

    Url::parse(&target).map_err(|e| {
        MeshError::upstream_unavailable(&instance.name, &instance.id, format!("invalid target URL {}: {}", target, e))
    })
}

/// `x-forwarded-for` value: any inbound chain plus the calling client
pub fn forwarded_for(request: &IncomingRequest) -> String {
    let client = request
        .remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match request.header(FORWARDED_FOR_HEADER).filter(|chain| !chain.is_empty()) {
        Some(chain) => format!("{}, {}", chain, client),
        None => client,
    }
}

/// HTTP forwarder with its own timeout, separate from the probe timeout
#[derive(Clone)]
pub struct Forwarder {
    client: HttpClient,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> MeshResult<Self> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| MeshError::internal(format!("Failed to create proxy client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward `request` to `instance`, replacing the routed prefix with `rest`.
    ///
    /// Connection failures and timeouts become `UpstreamUnavailable`; any upstream
    /// answer, including 4xx/5xx, is relayed as is.
    pub async fn forward(
        &self,
        instance: &ServiceInstance,
        request: &IncomingRequest,
        rest: &str,
    ) -> MeshResult<UpstreamResponse> {
        let url = target_url(instance, rest, request.query())?;

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes()).map_err(|e| {
            MeshError::validation("method", format!("unsupported method {}: {}", request.method, e))
        })?;

        let mut builder = self.client.request(method, url.clone());

        for (name, value) in request.headers.iter() {
            let name = name.as_str();
            if is_hop_by_hop(name)
                || name == "host"
                || name == "content-length"
                || name == TRACE_ID_HEADER
                || name == FORWARDED_FOR_HEADER
                || name == FORWARDED_HOST_HEADER
            {
                continue;
            }
            builder = builder.header(name, value.as_bytes());
        }

        builder = builder
            .header(TRACE_ID_HEADER, request.trace_id.as_str())
            .header(FORWARDED_FOR_HEADER, forwarded_for(request));

        if let Some(host) = request.header("host") {
            builder = builder.header(FORWARDED_HOST_HEADER, host);
        }

        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        debug!(
            trace_id = %request.trace_id,
            instance_id = %instance.id,
            method = %request.method,
            target = %url,
            "Forwarding request upstream"
        );

        let response = builder.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("timed out after {:?}", self.timeout)
            } else {
                e.to_string()
            };
            warn!(trace_id = %request.trace_id, instance_id = %instance.id, error = %reason, "Upstream request failed");
            MeshError::upstream_unavailable(&instance.name, &instance.id, reason)
        })?;

        let status = StatusCode::from_u16(response.status().as_u16()).map_err(|e| {
            MeshError::upstream_unavailable(&instance.name, &instance.id, format!("invalid status: {}", e))
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if is_hop_by_hop(name.as_str()) || name.as_str() == "content-length" {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(header = %name, "Dropping unconvertible upstream header"),
            }
        }

        let body = response.bytes().await.map_err(|e| {
            MeshError::upstream_unavailable(&instance.name, &instance.id, format!("failed to read body: {}", e))
        })?;

        let mut relayed = UpstreamResponse { status, headers, body };
        relayed.ensure_trace_id(&request.trace_id);
        Ok(relayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use bytes::Bytes;

    fn request(headers: &[(&str, &str)], remote: Option<&str>) -> IncomingRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(HeaderName::from_bytes(name.as_bytes()).unwrap(), value.parse().unwrap());
        }
        IncomingRequest::new(
            Method::GET,
            "/api/orders/items".parse().unwrap(),
            map,
            Bytes::new(),
            remote.map(|addr| addr.parse().unwrap()),
        )
    }

    #[test]
    fn test_target_url() {
        let instance = ServiceInstance::new("orders", "10.0.0.1", 8080);
        assert_eq!(
            target_url(&instance, "items/42", Some("page=2")).unwrap().as_str(),
            "http://10.0.0.1:8080/items/42?page=2"
        );
        assert_eq!(target_url(&instance, "", None).unwrap().as_str(), "http://10.0.0.1:8080/");
    }

    #[test]
    fn test_forwarded_for_appends_client() {
        let direct = request(&[], Some("192.168.1.7:5000"));
        assert_eq!(forwarded_for(&direct), "192.168.1.7");

        let chained = request(&[("x-forwarded-for", "203.0.113.9")], Some("10.1.1.1:443"));
        assert_eq!(forwarded_for(&chained), "203.0.113.9, 10.1.1.1");

        let anonymous = request(&[], None);
        assert_eq!(forwarded_for(&anonymous), "unknown");
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
