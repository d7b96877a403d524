//! Error types for the Latch gateway

use std::time::Duration;

use thiserror::Error;

/// Result type alias for Latch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Latch gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Entity not found in the store
    #[error("not found: {0}")]
    NotFound(String),

    /// Containment chain cannot be resolved (orphaned device)
    ///
    /// Distinct from an authorization denial: the request cannot be
    /// evaluated at all.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// Credential resolution error
    #[error("credential error: {0}")]
    Credential(String),

    /// No adapter registered for a vendor
    #[error("no adapter registered for vendor '{0}'")]
    UnknownVendor(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Vendor-agnostic adapter failure classification
///
/// Each concrete adapter maps its vendor's wire errors into this closed
/// set; the mapping is the only vendor-specific logic exposed upward.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Credential needs refresh; the adapter already attempted one
    /// transparent refresh before surfacing this
    #[error("vendor credential expired")]
    AuthExpired,

    /// Device (or the vendor bridge in front of it) did not respond
    #[error("device unreachable")]
    DeviceUnreachable,

    /// Vendor throttled the request
    #[error("rate limited by vendor")]
    RateLimited {
        /// Vendor-suggested wait before retrying, if provided
        retry_after: Option<Duration>,
    },

    /// Vendor understood the request and refused it
    #[error("rejected by vendor: {vendor_reason}")]
    Rejected {
        /// Vendor-supplied reason text
        vendor_reason: String,
    },

    /// Response could not be interpreted
    #[error("malformed vendor response")]
    Malformed,
}

/// Terminal outcome of a `dispatch` call
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Policy denial; never retried, surfaced verbatim
    #[error("not authorized: {0}")]
    NotAuthorized(crate::authz::DenialReason),

    /// The device's containment chain could not be resolved
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// Retries against the vendor were exhausted
    #[error("adapter failed after {attempts} attempt(s): {last_error}")]
    AdapterFailed {
        /// How many execute attempts were made
        attempts: u32,
        /// Last classified adapter error
        last_error: AdapterError,
    },

    /// Another command for the same device is in flight
    #[error("device busy: concurrent command in flight")]
    Busy,

    /// The caller cancelled the dispatch cooperatively
    #[error("dispatch cancelled")]
    Cancelled,

    /// Store or audit failure underneath the dispatcher
    #[error(transparent)]
    Internal(#[from] Error),
}
