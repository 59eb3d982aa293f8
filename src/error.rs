//! Error handling for the pool backend
//!
//! Error types covering collaborator failures (node RPC, persistence),
//! protocol violations and accounting invariants. Share classification
//! outcomes live in [`crate::share::ShareOutcome`].

use thiserror::Error;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the pool backend
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Malformed or out-of-sequence Stratum request
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The node answered with an error object
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Unusable block template
    #[error("Template error: {message}")]
    Template { message: String },

    /// Binary encoding errors (header layout, transactions)
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// Durable store failures
    #[error("Store error: {message}")]
    Store { message: String },

    /// Round accounting invariant violations
    #[error("Accounting error: {message}")]
    Accounting { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Network errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Invalid state errors
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an RPC error
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Create a template error
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    /// Create an encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create an accounting error
    pub fn accounting(message: impl Into<String>) -> Self {
        Self::Accounting {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Check if error is retryable
    ///
    /// Only transport-level failures qualify. An RPC error object means the
    /// node understood the request and refused it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            }
            Error::Network { .. } => true,
            Error::Timeout { .. } => true,
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::Protocol { .. } => "protocol",
            Error::Rpc { .. } => "rpc",
            Error::Template { .. } => "template",
            Error::Encoding { .. } => "encoding",
            Error::Store { .. } => "store",
            Error::Accounting { .. } => "accounting",
            Error::Timeout { .. } => "timeout",
            Error::Network { .. } => "network",
            Error::InvalidState { .. } => "invalid_state",
        }
    }
}
