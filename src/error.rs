//! Error types for mlxadmin
//!
//! This module defines all error types used throughout the application,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for mlxadmin operations
///
/// Covers configuration loading, process supervision, the chat relay and the
/// catalog lookup. Every failure in the supervisor is returned to the caller
/// as one of these values; none of them is meant to abort the process.
#[derive(Error, Debug)]
pub enum MlxAdminError {
    /// Malformed or inconsistent model configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A server process could not be launched
    #[error("Failed to launch {id}: {reason}")]
    Launch {
        /// Model id whose launch failed
        id: String,
        /// Why the launch failed
        reason: String,
    },

    /// A termination signal could not be delivered
    #[error("Failed to stop {id}: {reason}")]
    Terminate {
        /// Model id whose termination failed
        id: String,
        /// Why the signal could not be delivered
        reason: String,
    },

    /// Start requested for a model that is already running
    #[error("Model {0} is already running")]
    AlreadyRunning(String),

    /// Stop requested for a model that is not running
    #[error("Model {0} is not running")]
    NotRunning(String),

    /// The model id is not present in the configuration
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The server never bound its port within the readiness bound
    #[error("Model {id} did not become ready on port {port} within {seconds}s")]
    StartTimeout {
        /// Model id that was started
        id: String,
        /// Port that never became live
        port: u16,
        /// Readiness bound in seconds
        seconds: u64,
    },

    /// The port health could not be determined
    #[error("Cannot determine health of port {port}: {reason}")]
    ProbeUnavailable {
        /// Port that was probed
        port: u16,
        /// Why the OS query failed
        reason: String,
    },

    /// Chat relay failure
    #[error("Relay error: {0}")]
    Relay(#[from] RelayFailure),

    /// Remote catalog search failure
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Terminal failure of a streamed chat relay
///
/// Carried by [`crate::relay::RelayEvent::Failed`] together with whatever
/// text had been accumulated before the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayFailure {
    /// Connection refused or the server could not be reached
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The server answered with a non-success status
    #[error("server returned HTTP {status}: {body}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// The overall request timeout elapsed
    #[error("request timed out")]
    Timeout,

    /// The connection ended abnormally before any valid fragment arrived
    #[error("stream broken: {0}")]
    Broken(String),
}

/// Result type alias for mlxadmin operations
///
/// Uses `anyhow::Error` so context can be attached while the typed
/// [`MlxAdminError`] stays recoverable through `downcast_ref`.
pub type Result<T> = anyhow::Result<T>;

/// Returns the typed error behind an `anyhow::Error`, if there is one.
pub fn kind(err: &anyhow::Error) -> Option<&MlxAdminError> {
    err.downcast_ref::<MlxAdminError>()
}
