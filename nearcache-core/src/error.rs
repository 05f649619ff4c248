//! Error types for near cache operations

use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
///
/// Raised synchronously while building a store, a client or the
/// reconciliation scheduler. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Failures surfaced by the remote map collaborator.
///
/// The near cache never retries these. It only restores its own local
/// state before handing the error back to the caller unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote operation {operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("Remote operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Routing failed: {reason}")]
    Routing { reason: String },

    #[error("Server raised {class_name}: {message}")]
    ServerException { class_name: String, message: String },

    #[error("Operation not supported by the connected cluster: {operation}")]
    NotSupported { operation: String },
}

impl RemoteError {
    /// Shorthand for the common `OperationFailed` variant.
    pub fn failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Master error type for the near cache client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NearCacheError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Key cannot be serialized for routing: {0}")]
    KeySerialization(String),
}

impl NearCacheError {
    /// Returns true if this error came from the remote map collaborator.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

/// Result type alias for near cache operations.
pub type NearCacheResult<T> = Result<T, NearCacheError>;

/// Result type alias for remote collaborator calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

// =============================================================================
// TESTS
// =============================================================================
