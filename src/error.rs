use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the Veil service
#[derive(Error, Debug)]
pub enum VeilError {
    // Pool errors
    #[error("Proxy not found: {name}")]
    ProxyNotFound { name: String },

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy type: {0}")]
    UnsupportedProxyType(String),

    // Anonymity network control errors
    #[error("Control protocol error: {0}")]
    ControlProtocol(String),

    #[error("Control authentication failed: {0}")]
    ControlAuthentication(String),

    #[error("Anonymity network unavailable")]
    ControllerUnavailable,

    // Mediated request errors
    #[error("Upstream request failed: {0}")]
    UpstreamRequest(String),

    #[error("Upstream request timed out")]
    UpstreamTimeout,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Veil operations
pub type Result<T> = std::result::Result<T, VeilError>;

impl VeilError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            VeilError::InvalidRequest(_)
            | VeilError::InvalidProxyAddress(_)
            | VeilError::UnsupportedProxyType(_)
            | VeilError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            VeilError::ProxyNotFound { .. } => StatusCode::NOT_FOUND,

            // 502 Bad Gateway
            VeilError::UpstreamRequest(_)
            | VeilError::ControlProtocol(_)
            | VeilError::ControlAuthentication(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            VeilError::ControllerUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            VeilError::UpstreamTimeout | VeilError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            VeilError::Io(_) | VeilError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for VeilError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<reqwest::Error> for VeilError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VeilError::UpstreamTimeout
        } else {
            // Target URLs may carry credentials or tokens; keep them out of messages.
            let err = err.without_url();
            let mut reason = err.to_string();
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                reason.push_str(": ");
                reason.push_str(&cause.to_string());
                source = cause.source();
            }
            VeilError::UpstreamRequest(reason)
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for VeilError {
    fn from(err: url::ParseError) -> Self {
        VeilError::InvalidRequest(format!("invalid URL: {}", err))
    }
}
