//! Error types for the Courier core.
//!
//! One crate-wide error enum; relay-facing code deliberately collapses most
//! of these into `None` at the API boundary (transient failures are not
//! distinguishable by callers, only in logs).

use std::time::Duration;
use thiserror::Error;

/// Main error type for courier-core.
#[derive(Debug, Error)]
pub enum CourierError {
    // Relay / fabric errors
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Service unreachable: {service}")]
    ServiceUnreachable { service: String },

    #[error("Connection closed by peer: {service}")]
    ConnectionClosed { service: String },

    // Wire protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Coordination cache errors
    #[error("Re-entrant lock on key: {key}")]
    LockReentry { key: String },

    // Pipeline errors
    #[error("No handler registered for action: {action}")]
    UnknownAction { action: String },

    #[error("Handler failed for action {action}: {message}")]
    HandlerFailed { action: String, message: String },

    // Request validation
    #[error("Validation error on {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for CourierError {
    fn from(e: std::io::Error) -> Self {
        CourierError::Io {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Json {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

/// Convenience result type for courier-core.
pub type Result<T> = std::result::Result<T, CourierError>;
