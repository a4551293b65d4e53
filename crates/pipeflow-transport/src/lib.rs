//! Rank-addressed message transport.
//!
//! Processes of a cluster are numbered `0..size`; rank 0 is the Manager.
//! The scheduling code only talks to the [`Transport`] trait, so the same
//! Manager and Worker loops run over the in-process [`LocalCluster`] and over
//! [`TcpTransport`].

use std::time::Duration;

use async_trait::async_trait;

use pipeflow_core::Rank;
use pipeflow_proto::{Envelope, Payload};

pub mod cluster;
pub mod error;
mod inbox;
pub mod local;
pub mod tcp;

pub use cluster::ClusterConfig;
pub use error::TransportError;
pub use local::{LocalCluster, LocalTransport};
pub use tcp::TcpTransport;

/// Point-to-point and broadcast messaging between ranks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Total number of processes in the cluster.
    fn size(&self) -> usize;

    /// Send `payload` to `target`.
    async fn send(&self, target: Rank, payload: Payload) -> Result<(), TransportError>;

    /// Block until the next message arrives.
    ///
    /// `Err(TransportError::Closed)` means this endpoint can no longer
    /// receive anything.
    async fn recv(&self) -> Result<Envelope, TransportError>;

    /// Non-blocking receive: the next message if one is already queued.
    fn try_recv(&self) -> Result<Option<Envelope>, TransportError>;

    /// Wait at most `timeout` for the next message.
    async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Send `payload` to every other rank.
    ///
    /// Every rank is attempted; the ranks that could not be reached are
    /// reported together.
    async fn broadcast(&self, payload: Payload) -> Result<(), TransportError> {
        let mut failed = Vec::new();
        for target in (0..self.size() as u32).map(Rank::new) {
            if target == self.rank() {
                continue;
            }
            if self.send(target, payload.clone()).await.is_err() {
                failed.push(target);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Broadcast(failed))
        }
    }
}
