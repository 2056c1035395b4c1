//! Error types for the gateway authorization engine

use thiserror::Error;

/// Coarse error classification surfaced to callers
///
/// - `BadRequest`: malformed credential header, missing required header,
///   unparseable date. Never retried.
/// - `Unauthorized`: terminal rejection (bad token, bad signature, expired
///   request, unknown key, policy rejection).
/// - `Internal`: cache or metadata store unavailable. Treated as transient,
///   retry is left to the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Internal,
}

/// Authorization engine errors
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Malformed request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Credential or policy rejection
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Policy cache / metadata store fault
    #[error("Cache error: {0}")]
    Cache(String),

    /// Cached value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthzError {
    /// Create a bad request error
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        AuthzError::BadRequest(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        AuthzError::Unauthorized(msg.into())
    }

    /// Create a cache error
    pub fn cache<S: Into<String>>(msg: S) -> Self {
        AuthzError::Cache(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthzError::BadRequest(_) => ErrorKind::BadRequest,
            AuthzError::Unauthorized(_) => ErrorKind::Unauthorized,
            AuthzError::Cache(_)
            | AuthzError::Serialization(_)
            | AuthzError::Config(_)
            | AuthzError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error is an infrastructure fault rather than a verdict
    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
