//! Error types and handling
//!
//! Malformed relation data never surfaces here: it is logged and treated as
//! absent by the callers. These errors cover the cases a caller has to act on.

use serde::Serialize;
use thiserror::Error;

/// Library error types
#[derive(Debug, Error)]
pub enum TlsError {
    /// The relation an operation needs does not exist
    #[error("Relation not found: {0}")]
    RelationNotFound(String),

    /// A relation store refused a write
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Key, CSR or certificate generation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid argument to a generation function
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Encoding a relation document failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other relation or secret store failure
    #[error("Store error: {0}")]
    Store(String),
}

impl TlsError {
    /// Stable identifier for programmatic handling
    pub fn kind(&self) -> &'static str {
        match self {
            TlsError::RelationNotFound(_) => "relation_not_found",
            TlsError::PermissionDenied(_) => "permission_denied",
            TlsError::Crypto(_) => "crypto",
            TlsError::InvalidInput(_) => "invalid_input",
            TlsError::Serialization(_) => "serialization",
            TlsError::Store(_) => "store",
        }
    }

    /// Whether this is the missing-relation failure that renewal tolerates
    pub fn is_relation_not_found(&self) -> bool {
        matches!(self, TlsError::RelationNotFound(_))
    }
}

/// Serializable error summary for operator output
#[derive(Serialize, Debug)]
pub struct ErrorReport {
    /// Error type identifier
    pub error: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&TlsError> for ErrorReport {
    fn from(err: &TlsError) -> Self {
        Self {
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<openssl::error::ErrorStack> for TlsError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        TlsError::Crypto(err.to_string())
    }
}

impl From<serde_json::Error> for TlsError {
    fn from(err: serde_json::Error) -> Self {
        TlsError::Serialization(format!("JSON encoding error: {}", err))
    }
}

impl From<std::net::AddrParseError> for TlsError {
    fn from(err: std::net::AddrParseError) -> Self {
        TlsError::InvalidInput(format!("Invalid IP address: {}", err))
    }
}

/// Result type alias for library operations
pub type TlsResult<T> = Result<T, TlsError>;
