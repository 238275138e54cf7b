//! Error types for vitals-core.
//!
//! Errors are grouped by how callers should react to them.
//!
//! | Error | Retry? | Sync issue kind |
//! |-------|--------|-----------------|
//! | [`Error::Authorization`] | No, needs user consent | `Authorization` |
//! | [`Error::Unavailable`] | No | `Availability` |
//! | [`Error::Network`] | Yes, with backoff | `Network` |
//! | [`Error::Timeout`] | Yes, with backoff | `Network` |
//! | [`Error::Api`] (5xx, 429) | Yes, with backoff | `Network` |
//! | [`Error::Api`] (other 4xx) | No | `Network` |
//! | [`Error::NotFound`] | No | `Network` |
//! | [`Error::InvalidResponse`] | No | `Network` |
//! | [`Error::ConcurrencyRejected`] | No, a no-op signal | `ConcurrencyRejection` |
//! | [`Error::Storage`] | No | `Storage` |
//! | [`Error::StaleContext`] | No | `StaleContext` |
//!
//! Remote registration and validation calls fail closed: any of the network
//! errors above leaves the device treated as not authorized.

use std::time::Duration;

use thiserror::Error;

use vitals_types::SyncIssueKind;

/// Errors produced by the sync engine.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The device is not registered or health data is disabled.
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// The native health-data capability is not present.
    #[error("Health data unavailable: {0}")]
    Unavailable(String),

    /// A remote endpoint could not be reached.
    #[error("Network error calling {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    /// A remote endpoint answered with an error status.
    #[error("API error from {endpoint} ({status}): {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// The remote resource does not exist (HTTP 404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A remote response did not match the expected schema.
    #[error("Invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Another sync is already running.
    #[error("Sync already in progress")]
    ConcurrencyRejected,

    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(#[from] vitals_store::Error),

    /// A value could not be parsed.
    #[error(transparent)]
    Parse(#[from] vitals_types::ParseError),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The signed-in user changed while the operation was in flight.
    #[error("Signed-in user changed during the operation")]
    StaleContext,
}

impl Error {
    /// Create a network error for an endpoint.
    pub fn network(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create an invalid-response error.
    pub fn invalid_response(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether the remote reported the resource as missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Map this error onto the sync-result taxonomy.
    #[must_use]
    pub fn issue_kind(&self) -> SyncIssueKind {
        match self {
            Error::Authorization(_) => SyncIssueKind::Authorization,
            Error::Unavailable(_) => SyncIssueKind::Availability,
            Error::ConcurrencyRejected => SyncIssueKind::ConcurrencyRejection,
            Error::Storage(_) | Error::Parse(_) | Error::InvalidConfig(_) => {
                SyncIssueKind::Storage
            }
            Error::StaleContext => SyncIssueKind::StaleContext,
            Error::Network { .. }
            | Error::Api { .. }
            | Error::NotFound(_)
            | Error::InvalidResponse { .. }
            | Error::Timeout { .. } => SyncIssueKind::Network,
        }
    }
}

/// Result type alias using vitals-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
