//! Gateway error taxonomy
//!
//! Every failure surfaced by the engine is a [`GatewayError`]. Errors always convert
//! into a canonical [`ErrorResponse`] so callers never see a provider-specific shape.

use crate::protocol::types::{ErrorBody, ErrorResponse};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Transport-level failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused or reset
    Connect,
    /// Request or connect timeout
    Timeout,
    /// Host name could not be resolved
    Dns,
    /// Failure while reading the body or stream
    Body,
    /// Anything else reported by the HTTP stack
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Dns => "dns",
            Self::Body => "body",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Errors that can occur while routing, transforming or dispatching a request
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Bad or missing routing target or provider reference
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Upstream returned a non-success status
    #[error("API error from {provider}/{model} (status {status}): {message}")]
    Api {
        status: u16,
        provider: String,
        model: String,
        message: String,
        /// Parsed upstream error body, when it was JSON
        details: Option<Value>,
    },

    /// Transport failure before a status was received
    #[error("Network error ({kind}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Provider is currently unavailable (circuit open or every key rate limited)
    #[error("Provider '{provider}' is unavailable: {reason}")]
    CircuitBreaker { provider: String, reason: String },

    /// Provider payload did not match the shape a stage expected
    #[error("Transform error in stage '{stage}': {message}")]
    Transform { stage: String, message: String },

    /// The caller went away before the request finished
    #[error("Request cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a transform error attributed to a stage
    pub fn transform(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a circuit breaker error
    pub fn unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CircuitBreaker {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status code of the upstream failure, if there was one
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this failure reflects the health of the provider itself.
    ///
    /// Only these failures are fed to the circuit breaker.
    pub fn counts_against_provider(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status >= 500,
            Self::Network { .. } => true,
            _ => false,
        }
    }

    /// HTTP status the gateway should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration(_) => 400,
            Self::Api { status, .. } => *status,
            Self::Network { kind, .. } => match kind {
                NetworkErrorKind::Timeout => 504,
                _ => 502,
            },
            Self::CircuitBreaker { .. } => 503,
            Self::Transform { .. } => 502,
            Self::Cancelled => 499,
        }
    }

    /// Canonical error type label
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "invalid_request_error",
            Self::Api { status: 429, .. } => "rate_limit_error",
            Self::Api { status: 401, .. } | Self::Api { status: 403, .. } => {
                "authentication_error"
            }
            Self::Api { status, .. } if *status >= 500 => "api_error",
            Self::Api { .. } => "invalid_request_error",
            Self::Network { .. } => "api_error",
            Self::CircuitBreaker { .. } => "overloaded_error",
            Self::Transform { .. } => "api_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Convert into the canonical error body returned to callers
    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            kind: "error".to_string(),
            error: ErrorBody {
                kind: self.error_type().to_string(),
                message: self.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::transform("canonical", err.to_string())
    }
}
