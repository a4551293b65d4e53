//! Transport errors.

use thiserror::Error;

use pipeflow_core::Rank;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is not connected, or its connection was lost.
    #[error("Peer {0} unreachable")]
    PeerUnreachable(Rank),

    /// This endpoint is closed and cannot receive anymore.
    #[error("Transport closed")]
    Closed,

    #[error("Broadcast did not reach ranks {0:?}")]
    Broadcast(Vec<Rank>),

    #[error("Invalid cluster configuration: {0}")]
    InvalidCluster(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}
