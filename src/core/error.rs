//! # Error Handling Module
//!
//! Every failure the dispatch pipeline can produce is a variant of [`GatewayError`].
//! Component-level errors (`AuthError`, `RateLimitError`, `ForwardError`, ...) are
//! converted into it at the dispatcher boundary, and `IntoResponse` renders the one
//! standardized envelope clients see:
//!
//! ```json
//! {
//!   "success": false,
//!   "data": null,
//!   "error": { "code": "RATE_LIMITED", "message": "...", "details": null },
//!   "metadata": { "timestamp": "2024-01-01T00:00:00Z", "correlation_id": "..." }
//! }
//! ```
//!
//! ## Rust Error Handling Concepts (For Developers from Other Languages)
//!
//! ### No Exceptions - Results Instead
//! Rust has no exceptions. Fallible functions return `Result<T, E>`:
//! - `Ok(value)` represents success
//! - `Err(error)` represents failure
//! - the `?` operator returns early with the error, converting it through `From`
//!
//! ### Enum-Based Error Types
//! Each variant is one error condition. Pattern matching over the enum forces
//! every mapping (status code, machine code, retryability) to handle every case,
//! so adding a variant is a compile error until all of them are updated.
//!
//! ### `thiserror`
//! `#[derive(Error)]` generates `Display` from the `#[error("...")]` attributes and
//! implements `std::error::Error`, so the enum plugs into `?` and logging.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

use crate::observability::correlation;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Header carrying remaining quota on rate-limited routes
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-rate-limit-remaining";

/// Header carrying the quota reset instant (RFC 3339)
pub const RATE_LIMIT_RESET_HEADER: &str = "x-rate-limit-reset";

/// Comprehensive error types for the gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Missing, malformed, expired or badly signed credentials
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Valid credentials without the required role
    #[error("Authorization failed: {reason}")]
    Authorization { reason: String },

    /// No registered service owns the request path
    #[error("No route for path: {path}")]
    RouteNotFound { path: String },

    /// Request validation errors (invalid path, malformed body, etc.)
    #[error("Request validation failed: {field} - {reason}")]
    RequestValidation { field: String, reason: String },

    /// Request body exceeded the configured limit
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// A rate-limit scope is exhausted for the current window
    #[error("Rate limit exceeded for {scope} scope: {limit} requests per window")]
    RateLimitExceeded {
        scope: String,
        limit: u64,
        retry_after_secs: u64,
        reset_at: DateTime<Utc>,
    },

    /// Circuit breaker is open, the backend was not contacted
    #[error("Circuit breaker open for service: {service}")]
    CircuitBreakerOpen { service: String, retry_after_secs: u64 },

    /// A critical dependency is down and the request cannot be served
    #[error("Critical service down: {service}")]
    CriticalServiceDown { service: String },

    /// A dependency of the gateway itself is unavailable (key source, counter store)
    #[error("Service unavailable: {service} - {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// The backend could not be reached
    #[error("Upstream connection to {service} failed: {reason}")]
    UpstreamConnection { service: String, reason: String },

    /// The backend answered with a 5xx; only the status survives
    #[error("Upstream {service} responded with status {status}")]
    UpstreamStatus { service: String, status: u16 },

    /// The forwarded call exceeded the route's request timeout
    #[error("Request to {service} timed out after {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, sockets, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors outside of forwarding (probes, collaborators)
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },

    /// JWT decoding errors
    #[error("JWT error: {message}")]
    Jwt { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authentication error with a custom reason
    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Create an authorization error with a custom reason
    pub fn authz<S: Into<String>>(reason: S) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable<S: Into<String>, R: Into<String>>(service: S, reason: R) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a route-not-found error for a path
    pub fn not_found<S: Into<String>>(path: S) -> Self {
        Self::RouteNotFound { path: path.into() }
    }

    /// Create a validation error for a named field
    pub fn validation<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::RequestValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status code returned to the client
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } | Self::Jwt { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::RequestValidation { .. } | Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitBreakerOpen { .. }
            | Self::CriticalServiceDown { .. }
            | Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamConnection { .. } | Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code placed in the error envelope
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Authentication { .. } | Self::Jwt { .. } => "UNAUTHORIZED",
            Self::Authorization { .. } => "FORBIDDEN",
            Self::RouteNotFound { .. } => "NOT_FOUND",
            Self::RequestValidation { .. } | Self::PayloadTooLarge { .. } | Self::Json { .. } => {
                "INVALID_REQUEST"
            }
            Self::RateLimitExceeded { .. } => "RATE_LIMITED",
            Self::Timeout { .. } => "REQUEST_TIMEOUT",
            Self::UpstreamStatus { status, .. } => match *status {
                500 => "INTERNAL_SERVER_ERROR",
                504 => "REQUEST_TIMEOUT",
                _ => "SERVICE_UNAVAILABLE",
            },
            Self::CircuitBreakerOpen { .. }
            | Self::CriticalServiceDown { .. }
            | Self::ServiceUnavailable { .. }
            | Self::UpstreamConnection { .. }
            | Self::HttpClient { .. } => "SERVICE_UNAVAILABLE",
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Message safe to show to clients
    ///
    /// Internal faults never leak their detail; upstream failures only expose the
    /// mapped category, not what the backend said.
    pub fn public_message(&self) -> String {
        match self {
            Self::Configuration { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => "An unexpected error occurred".to_string(),
            Self::ServiceUnavailable { service, .. } => {
                format!("Service temporarily unavailable: {}", service)
            }
            Self::UpstreamConnection { service, .. } => {
                format!("Service temporarily unavailable: {}", service)
            }
            Self::UpstreamStatus { service, .. } => {
                format!("Upstream service error: {}", service)
            }
            Self::HttpClient { .. } => "Upstream request failed".to_string(),
            Self::Jwt { .. } => "Invalid or expired token".to_string(),
            other => other.to_string(),
        }
    }

    /// Seconds the client should wait before retrying, where a hint exists
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded {
                retry_after_secs, ..
            }
            | Self::CircuitBreakerOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Check if the client may retry this request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::CircuitBreakerOpen { .. }
                | Self::ServiceUnavailable { .. }
                | Self::UpstreamConnection { .. }
                | Self::Timeout { .. }
        )
    }

    /// Check if this error counts as a backend failure for the circuit breaker
    pub fn should_trigger_circuit_breaker(&self) -> bool {
        matches!(
            self,
            Self::UpstreamConnection { .. } | Self::UpstreamStatus { .. } | Self::Timeout { .. }
        )
    }

    /// Snake-case category used in logs and metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Authentication { .. } => "authentication_error",
            Self::Authorization { .. } => "authorization_error",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::RequestValidation { .. } => "request_validation_error",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::CriticalServiceDown { .. } => "critical_service_down",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::UpstreamConnection { .. } => "upstream_connection_error",
            Self::UpstreamStatus { .. } => "upstream_error",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
            Self::Jwt { .. } => "jwt_error",
        }
    }

    /// Render the standardized envelope for a known correlation id
    pub fn into_envelope(self, correlation_id: Option<&str>) -> Response {
        let status = self.status_code();
        let body = json!({
            "success": false,
            "data": null,
            "error": {
                "code": self.error_code(),
                "message": self.public_message(),
                "details": null,
            },
            "metadata": {
                "timestamp": Utc::now().to_rfc3339(),
                "correlation_id": correlation_id,
            }
        });

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();

        if let Some(secs) = self.retry_after_secs() {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let Self::RateLimitExceeded { reset_at, .. } = &self {
            headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from_static("0"));
            if let Ok(value) = HeaderValue::from_str(&reset_at.to_rfc3339()) {
                headers.insert(RATE_LIMIT_RESET_HEADER, value);
            }
        }
        if let Some(id) = correlation_id.and_then(|id| HeaderValue::from_str(id).ok()) {
            headers.insert(correlation::CORRELATION_HEADER, id);
        }

        response
    }
}

impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Jwt {
            message: err.to_string(),
        }
    }
}

/// Axum handlers can return `GatewayResult<T>` directly.
///
/// The correlation id is read from the task-local set by the request-context
/// middleware, so errors raised deep inside a handler still carry it.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let correlation_id = correlation::current();
        self.into_envelope(correlation_id.as_ref().map(|id| id.as_str()))
    }
}

/// Convenience macro for creating internal errors
///
/// Usage: `internal_error!("Failed to process request: {}", request_id)`
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::internal(format!($($arg)*))
    };
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid port: {}", port)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::config(format!($($arg)*))
    };
}
