//! MCP error types.

use std::sync::Arc;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur while talking to the remote endpoint.
///
/// Cloneable so every waiter on a shared connection attempt observes the
/// same failure.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The remote signaled unauthorized; re-authorization may fix it.
    #[error("Authentication required")]
    AuthRequired,

    /// Authorization could not be completed.
    #[error("Authorization failed: {0}")]
    AuthFailed(String),

    /// No transport could be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation was invoked before a session exists.
    #[error("Not connected to the remote server. Call connect() first.")]
    NotConnected,

    /// Local input validation rejected the parameters.
    #[error("Invalid parameters for tool {operation}: {}", violations.join(", "))]
    Validation {
        operation: String,
        violations: Vec<String>,
    },

    /// A remote call kept failing after all retries.
    #[error("{operation} failed after {attempts} attempts: {message}")]
    RemoteCall {
        operation: String,
        attempts: u32,
        message: String,
    },

    /// The remote answered with a JSON-RPC error.
    #[error("Remote error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Tool not found.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Request timeout.
    #[error("Request timeout")]
    Timeout,

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create an authorization failure.
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed(message.into())
    }

    /// Check if this error is an authentication challenge.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::AuthRequired)
    }
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(Arc::new(e))
    }
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(Arc::new(e))
    }
}
