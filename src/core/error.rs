//! # Error Handling Module
//!
//! All failures the dispatcher can produce are variants of [`MeshError`]. Each variant
//! maps onto an HTTP status code so the HTTP surface can turn any error into a response
//! without extra plumbing.
//!
//! ## Propagation Policy
//!
//! - `Validation`, `PayloadTooLarge`, `ServiceNotFound` and `NoHealthyInstance` are
//!   returned synchronously to the HTTP layer and never retried.
//! - `UpstreamUnavailable` is reported per request as `502`; the dispatcher never fails
//!   over to another instance on its own.
//! - `DirectoryUnavailable` is absorbed by the registry (stale cache is served) and is
//!   never surfaced on the request path.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result type used throughout the dispatcher
pub type MeshResult<T> = Result<T, MeshError>;

/// Error taxonomy for the mesh dispatcher
#[derive(Debug, Error, Clone)]
pub enum MeshError {
    /// Malformed registration input; rejected before the cache is touched
    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// Request body larger than the configured buffer limit
    #[error("Payload too large: request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// No instance was ever registered or discovered under this name
    #[error("Service not found: {service}")]
    ServiceNotFound { service: String },

    /// Instances exist but none is currently healthy
    #[error("No healthy instance available for service: {service}")]
    NoHealthyInstance { service: String },

    /// The selected instance failed to answer a forwarded request
    #[error("Upstream unavailable: {service} ({instance}) - {reason}")]
    UpstreamUnavailable {
        service: String,
        instance: String,
        reason: String,
    },

    /// The external discovery backend could not be reached
    #[error("Directory unavailable ({backend}): {reason}")]
    DirectoryUnavailable { backend: String, reason: String },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// I/O errors (binding sockets, reading files, ...)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl MeshError {
    /// Create a validation error for a specific field
    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a payload-too-large error for a body over `limit` bytes
    pub fn payload_too_large(limit: usize) -> Self {
        Self::PayloadTooLarge { limit }
    }

    /// Create a service-not-found error
    pub fn service_not_found<S: Into<String>>(service: S) -> Self {
        Self::ServiceNotFound {
            service: service.into(),
        }
    }

    /// Create a no-healthy-instance error
    pub fn no_healthy_instance<S: Into<String>>(service: S) -> Self {
        Self::NoHealthyInstance {
            service: service.into(),
        }
    }

    /// Create an upstream-unavailable error
    pub fn upstream_unavailable<S, I, R>(service: S, instance: I, reason: R) -> Self
    where
        S: Into<String>,
        I: Into<String>,
        R: Into<String>,
    {
        Self::UpstreamUnavailable {
            service: service.into(),
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    /// Create a directory-unavailable error
    pub fn directory_unavailable<B: Into<String>, R: Into<String>>(backend: B, reason: R) -> Self {
        Self::DirectoryUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code returned to clients for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ServiceNotFound { .. } => StatusCode::NOT_FOUND,
            Self::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::DirectoryUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable string tag for API responses and metric labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::ServiceNotFound { .. } => "service_not_found",
            Self::NoHealthyInstance { .. } => "no_healthy_instance",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::DirectoryUnavailable { .. } => "directory_unavailable",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for MeshError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

/// Lets handlers return `MeshResult<T>` and have axum render the error body
impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
