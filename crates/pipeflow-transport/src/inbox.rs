//! Receive side shared by every transport.

use tokio::sync::{mpsc, Mutex};

use pipeflow_proto::Envelope;

use crate::TransportError;

pub(crate) const INBOX_CAPACITY: usize = 256;

/// Queue of envelopes delivered to this endpoint.
pub(crate) struct Inbox {
    rx: Mutex<mpsc::Receiver<Envelope>>,
}

impl Inbox {
    pub(crate) fn channel() -> (mpsc::Sender<Envelope>, Self) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        (tx, Self { rx: Mutex::new(rx) })
    }

    pub(crate) async fn recv(&self) -> Result<Envelope, TransportError> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    /// Returns `Ok(None)` when nothing is queued or another task is
    /// currently blocked in [`Inbox::recv`].
    pub(crate) fn try_recv(&self) -> Result<Option<Envelope>, TransportError> {
        let Ok(mut rx) = self.rx.try_lock() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }
}
