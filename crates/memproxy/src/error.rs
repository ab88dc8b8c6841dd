//! Error types for memproxy

use axum::{
    body::Body,
    http::{Response, StatusCode},
};
use thiserror::Error;

/// Main error type for memproxy operations
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Missing or invalid configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Detector resolved a provider that has no registered profile
    #[error("Provider '{provider}' not configured. Available providers: {available}")]
    ProviderNotConfigured { provider: String, available: String },

    /// Transport-level failure while talking to the upstream provider
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Snapshot read or write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Request body is present but is not valid JSON
    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    /// Memory engine errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Short machine-readable tag used in client-facing error bodies
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "configuration_error",
            ProxyError::ProviderNotConfigured { .. } => "provider_not_configured",
            ProxyError::Upstream(_) => "upstream_failure",
            ProxyError::Persistence(_) => "persistence_failure",
            ProxyError::MalformedBody(_) => "malformed_request_body",
            ProxyError::Memory(_) => "memory_error",
            ProxyError::Serialization(_) => "serialization_error",
            ProxyError::Io(_) => "io_error",
        }
    }

    /// Convert into the uniform gateway failure response.
    ///
    /// Every failure caught at the gateway boundary is reported with the same
    /// status so clients can tell proxy failures apart from upstream statuses,
    /// which are always relayed unchanged.
    pub fn into_response(self) -> Response<Body> {
        create_error_response(StatusCode::BAD_GATEWAY, self.error_type(), &self.to_string())
    }
}

/// Build a JSON error response of the form `{"error": {"type", "message"}}`
pub fn create_error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    response
}

/// Result type alias for memproxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
