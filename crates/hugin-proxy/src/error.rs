//! Error types for the proxy engine.

use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while proxying a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or invalid configuration (plugin prerequisites, dependency cycles).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The upstream call failed before a response arrived, or its body broke mid-stream.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// No upstream response headers within the request timeout.
    #[error("Upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// An interceptor hook returned an error.
    #[error("Interceptor {plugin} failed: {message}")]
    Interceptor { plugin: String, message: String },

    /// An interceptor hook exceeded the per-hook timeout.
    #[error("Interceptor {plugin} timed out in {hook}")]
    HookTimeout { plugin: String, hook: &'static str },

    /// The client went away while the response was streaming.
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Record store failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The inbound request could not be read.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status and error type reported to the client.
    pub fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            ProxyError::UpstreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
            ProxyError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ProxyError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            ProxyError::Interceptor { .. } | ProxyError::HookTimeout { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "interceptor_error")
            }
            ProxyError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence_error"),
            ProxyError::ClientDisconnected => (StatusCode::BAD_REQUEST, "client_disconnected"),
            ProxyError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl From<hugin_metrics::StoreError> for ProxyError {
    fn from(e: hugin_metrics::StoreError) -> Self {
        ProxyError::Persistence(e.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        });

        (status, Json(body)).into_response()
    }
}
