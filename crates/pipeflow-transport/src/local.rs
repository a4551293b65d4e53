//! In-process transport: every rank is a channel endpoint.
//!
//! Used to run a Manager and its Workers as tasks of one process, and by the
//! scenario tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use pipeflow_core::Rank;
use pipeflow_proto::{Envelope, Payload};

use crate::inbox::Inbox;
use crate::{Transport, TransportError};

/// A set of connected in-process endpoints, one per rank.
pub struct LocalCluster {
    endpoints: Vec<Option<LocalTransport>>,
}

impl LocalCluster {
    /// Create `size` endpoints, ranks `0..size`.
    pub fn new(size: usize) -> Self {
        let mut senders = Vec::with_capacity(size);
        let mut inboxes = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, inbox) = Inbox::channel();
            senders.push(tx);
            inboxes.push(inbox);
        }

        let peers = Arc::new(senders);
        let endpoints = inboxes
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| {
                Some(LocalTransport {
                    rank: Rank::new(i as u32),
                    peers: peers.clone(),
                    inbox,
                })
            })
            .collect();
        Self { endpoints }
    }

    /// Take the endpoint of `rank`. Each endpoint can be taken once.
    pub fn endpoint(&mut self, rank: Rank) -> Option<LocalTransport> {
        self.endpoints.get_mut(rank.get() as usize)?.take()
    }
}

/// One rank of a [`LocalCluster`].
pub struct LocalTransport {
    rank: Rank,
    peers: Arc<Vec<mpsc::Sender<Envelope>>>,
    inbox: Inbox,
}

#[async_trait]
impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    async fn send(&self, target: Rank, payload: Payload) -> Result<(), TransportError> {
        let tx = self
            .peers
            .get(target.get() as usize)
            .ok_or(TransportError::PeerUnreachable(target))?;
        tx.send(Envelope::new(self.rank, target, payload))
            .await
            .map_err(|_| TransportError::PeerUnreachable(target))
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        self.inbox.recv().await
    }

    fn try_recv(&self) -> Result<Option<Envelope>, TransportError> {
        self.inbox.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use pipeflow_proto::pb;

    fn shutdown() -> Payload {
        Payload::Shutdown(pb::Shutdown { grace_ms: 10 })
    }

    #[tokio::test]
    async fn test_point_to_point() {
        let mut cluster = LocalCluster::new(3);
        let manager = cluster.endpoint(Rank::MANAGER).unwrap();
        let worker = cluster.endpoint(Rank::new(2)).unwrap();

        manager.send(Rank::new(2), shutdown()).await.unwrap();
        let envelope = worker.recv().await.unwrap();
        assert_eq!(envelope.source_rank(), Rank::MANAGER);
        assert_eq!(envelope.target_rank(), Rank::new(2));
        assert_eq!(envelope.kind(), "shutdown");
    }

    #[tokio::test]
    async fn test_try_recv_and_timeout_on_empty_inbox() {
        let mut cluster = LocalCluster::new(2);
        let manager = cluster.endpoint(Rank::MANAGER).unwrap();

        assert!(manager.try_recv().unwrap().is_none());
        let waited = manager
            .recv_timeout(Duration::from_millis(10))
            .await
            .unwrap();
        assert!(waited.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reports_dropped_endpoints() {
        let mut cluster = LocalCluster::new(4);
        let manager = cluster.endpoint(Rank::MANAGER).unwrap();
        let w1 = cluster.endpoint(Rank::new(1)).unwrap();
        let w3 = cluster.endpoint(Rank::new(3)).unwrap();
        drop(cluster); // rank 2 is never taken

        let err = manager.broadcast(shutdown()).await.unwrap_err();
        assert!(matches!(err, TransportError::Broadcast(ref ranks) if ranks == &vec![Rank::new(2)]));

        assert!(w1.try_recv().unwrap().is_some());
        assert!(w3.try_recv().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_send_outside_cluster() {
        let mut cluster = LocalCluster::new(2);
        let manager = cluster.endpoint(Rank::MANAGER).unwrap();
        let err = manager.send(Rank::new(9), shutdown()).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerUnreachable(r) if r == Rank::new(9)));
    }
}
