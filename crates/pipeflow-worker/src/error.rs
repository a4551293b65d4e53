//! Worker errors.

use std::path::PathBuf;

use thiserror::Error;

use pipeflow_transport::TransportError;

/// Errors that stop the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Lost the connection to the manager.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Errors a step engine turns into a failure diagnostic.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn step program '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare run directory {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Dataset path not usable in the environment: {0}")]
    DatasetPath(String),

    #[error("Failed to wait for step program: {0}")]
    Wait(std::io::Error),
}
