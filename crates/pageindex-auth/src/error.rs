//! Error types for credential storage.

use thiserror::Error;

/// Errors that can occur while persisting credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Failed to read or write the credential file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize the credential record.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Could not determine the home directory.
    #[error("Could not determine home directory")]
    NoHomeDir,

    /// Failed to set file permissions.
    #[error("Failed to set file permissions: {0}")]
    Permissions(String),
}

/// Result type for credential storage operations.
pub type AuthResult<T> = Result<T, AuthError>;
