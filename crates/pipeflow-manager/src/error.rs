//! Manager errors.

use thiserror::Error;

use pipeflow_transport::TransportError;

/// Errors from a registry or definition store.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Run not found: {0}")]
    UnknownRun(String),

    #[error("Identifier not usable as a file name: {0}")]
    InvalidId(String),

    #[error("Registry call timed out")]
    Timeout,
}

/// Errors that stop the Manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The Manager's own endpoint failed; nothing can be scheduled anymore.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
