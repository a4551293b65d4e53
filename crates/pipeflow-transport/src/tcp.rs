//! TCP transport: length-delimited protobuf envelopes.
//!
//! The Manager listens on the rendezvous address; every Worker opens one
//! connection to it. The Manager learns a connection's rank from the
//! `source` of its first envelope. Workers only talk to the Manager.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pipeflow_core::Rank;
use pipeflow_proto::{Envelope, Payload};

use crate::inbox::Inbox;
use crate::{ClusterConfig, Transport, TransportError};

const OUTBOX_CAPACITY: usize = 64;

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;
type PeerTable = Arc<RwLock<HashMap<Rank, mpsc::Sender<Envelope>>>>;

/// TCP endpoint of one rank.
pub struct TcpTransport {
    rank: Rank,
    size: usize,
    local_addr: SocketAddr,
    peers: PeerTable,
    inbox: Inbox,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Bind the rendezvous address and accept Worker connections (rank 0).
    pub async fn listen(cluster: &ClusterConfig) -> Result<Self, TransportError> {
        cluster.validate()?;
        if !cluster.rank.is_manager() {
            return Err(TransportError::InvalidCluster(format!(
                "only rank 0 listens, this is rank {}",
                cluster.rank
            )));
        }

        let listener = TcpListener::bind(cluster.rendezvous).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, size = cluster.size, "Listening for workers");

        let (inbox_tx, inbox) = Inbox::channel();
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            cluster.clone(),
            peers.clone(),
            inbox_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            rank: cluster.rank,
            size: cluster.size,
            local_addr,
            peers,
            inbox,
            shutdown,
        })
    }

    /// Connect a Worker to the Manager, retrying while it is not up yet.
    pub async fn connect(
        cluster: &ClusterConfig,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, TransportError> {
        cluster.validate()?;
        if cluster.rank.is_manager() {
            return Err(TransportError::InvalidCluster(
                "rank 0 is the manager and cannot connect".to_string(),
            ));
        }

        let stream = connect_with_retry(cluster.rendezvous, attempts, delay).await?;
        let local_addr = stream.local_addr()?;
        info!(rank = %cluster.rank, manager = %cluster.rendezvous, "Connected to manager");

        let (sink, frames) = Framed::new(stream, LengthDelimitedCodec::new()).split();
        let (inbox_tx, inbox) = Inbox::channel();
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let shutdown = CancellationToken::new();

        tokio::spawn(write_loop(sink, rx, shutdown.clone()));
        // The inbox closes when this task ends, i.e. when the manager is gone.
        tokio::spawn(read_loop(frames, Rank::MANAGER, inbox_tx, shutdown.clone()));

        let peers: PeerTable = Arc::new(RwLock::new(HashMap::from([(Rank::MANAGER, tx)])));

        Ok(Self {
            rank: cluster.rank,
            size: cluster.size,
            local_addr,
            peers,
            inbox,
            shutdown,
        })
    }

    /// Address this endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ranks with a live connection.
    pub async fn connected_peers(&self) -> Vec<Rank> {
        let mut ranks: Vec<Rank> = self.peers.read().await.keys().copied().collect();
        ranks.sort();
        ranks
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send(&self, target: Rank, payload: Payload) -> Result<(), TransportError> {
        let tx = self
            .peers
            .read()
            .await
            .get(&target)
            .cloned()
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

async fn connect_with_retry(
    addr: SocketAddr,
    attempts: u32,
    delay: Duration,
) -> Result<TcpStream, TransportError> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %e, "Manager not reachable yet, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    cluster: ClusterConfig,
    peers: PeerTable,
    inbox_tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                tokio::spawn(serve_worker(
                    stream,
                    addr,
                    cluster.clone(),
                    peers.clone(),
                    inbox_tx.clone(),
                    shutdown.child_token(),
                ));
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }
}

async fn serve_worker(
    stream: TcpStream,
    addr: SocketAddr,
    cluster: ClusterConfig,
    peers: PeerTable,
    inbox_tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
) {
    let (sink, mut frames) = Framed::new(stream, LengthDelimitedCodec::new()).split();

    // The first envelope identifies the worker.
    let first = tokio::select! {
        _ = shutdown.cancelled() => return,
        next = next_envelope(&mut frames) => next,
    };
    let first = match first {
        Some(Ok(envelope)) => envelope,
        Some(Err(e)) => {
            warn!(peer = %addr, error = %e, "Bad first frame, dropping connection");
            return;
        }
        None => return,
    };
    let rank = first.source_rank();
    if !cluster.contains_worker(rank) {
        warn!(peer = %addr, rank = %rank, "Connection claims a rank outside the cluster");
        return;
    }

    let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
    // A restarted worker replaces its previous connection.
    peers.write().await.insert(rank, tx.clone());
    info!(rank = %rank, peer = %addr, "Worker connected");

    let writer = tokio::spawn(write_loop(sink, rx, shutdown.clone()));
    if inbox_tx.send(first).await.is_ok() {
        read_loop(frames, rank, inbox_tx, shutdown).await;
    }

    let mut table = peers.write().await;
    if table.get(&rank).is_some_and(|current| current.same_channel(&tx)) {
        table.remove(&rank);
    }
    drop(table);
    writer.abort();
    info!(rank = %rank, "Worker connection closed");
}

async fn next_envelope(frames: &mut FrameStream) -> Option<Result<Envelope, TransportError>> {
    let frame = frames.next().await?;
    Some(
        frame
            .map_err(TransportError::from)
            .and_then(|bytes| Envelope::decode(bytes).map_err(TransportError::from)),
    )
}

async fn read_loop(
    mut frames: FrameStream,
    peer: Rank,
    inbox_tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = next_envelope(&mut frames) => next,
        };
        match next {
            Some(Ok(envelope)) => {
                if envelope.source_rank() != peer {
                    warn!(
                        peer = %peer,
                        claimed = %envelope.source_rank(),
                        "Dropping envelope with spoofed source rank"
                    );
                    continue;
                }
                if inbox_tx.send(envelope).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "Connection error");
                break;
            }
            None => {
                debug!(peer = %peer, "Connection closed by peer");
                break;
            }
        }
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            envelope = rx.recv() => envelope,
        };
        let Some(envelope) = envelope else { break };
        if let Err(e) = sink.send(Bytes::from(envelope.encode_to_vec())).await {
            warn!(target_rank = envelope.target, error = %e, "Write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeflow_proto::pb;

    fn cluster(rank: u32, addr: SocketAddr) -> ClusterConfig {
        ClusterConfig::new(Rank::new(rank), 2, addr)
    }

    fn hello() -> Payload {
        Payload::Hello(pb::WorkerHello {
            rank: 1,
            hostname: "test".to_string(),
            version: "0".to_string(),
        })
    }

    #[tokio::test]
    async fn test_manager_and_worker_exchange_envelopes() {
        let manager = TcpTransport::listen(&cluster(0, "127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        let addr = manager.local_addr();

        let worker = TcpTransport::connect(&cluster(1, addr), 3, Duration::from_millis(50))
            .await
            .unwrap();
        worker.send(Rank::MANAGER, hello()).await.unwrap();

        let envelope = manager.recv().await.unwrap();
        assert_eq!(envelope.source_rank(), Rank::new(1));
        assert_eq!(envelope.kind(), "hello");
        assert_eq!(manager.connected_peers().await, vec![Rank::new(1)]);

        manager
            .send(Rank::new(1), Payload::Shutdown(pb::Shutdown { grace_ms: 5 }))
            .await
            .unwrap();
        let envelope = worker.recv().await.unwrap();
        assert_eq!(envelope.kind(), "shutdown");
    }

    #[tokio::test]
    async fn test_worker_sees_closed_transport_when_manager_goes_away() {
        let manager = TcpTransport::listen(&cluster(0, "127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        let addr = manager.local_addr();
        let worker = TcpTransport::connect(&cluster(1, addr), 3, Duration::from_millis(50))
            .await
            .unwrap();
        worker.send(Rank::MANAGER, hello()).await.unwrap();
        manager.recv().await.unwrap();

        drop(manager);
        let result = tokio::time::timeout(Duration::from_secs(5), worker.recv())
            .await
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_send_to_unconnected_rank_fails() {
        let manager = TcpTransport::listen(&cluster(0, "127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        let err = manager
            .send(Rank::new(1), Payload::Shutdown(pb::Shutdown { grace_ms: 0 }))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_roles_are_checked() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(TcpTransport::listen(&cluster(1, addr)).await.is_err());
        assert!(TcpTransport::connect(&cluster(0, addr), 1, Duration::ZERO)
            .await
            .is_err());
    }
}
