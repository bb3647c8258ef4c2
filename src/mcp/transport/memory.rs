//! In-process transport pair.
//!
//! [`MemoryTransport::pair`] returns the client side plus a [`MemoryPeer`]
//! that plays the provider: it reads what the client sends and pushes frames
//! back. Used for embedding providers in the same process and by tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{FrameStream, Transport};
use crate::error::TransportError;
use crate::relock;

type Inbound = Result<String, TransportError>;

#[derive(Debug)]
struct Shared {
    connects: AtomicUsize,
    sent: AtomicUsize,
    connected: Mutex<bool>,
    /// Error returned by the next `connect()`, if armed.
    fail_connect: Mutex<Option<TransportError>>,
}

/// Client half of an in-memory channel.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    taken: Mutex<bool>,
}

/// Provider half of an in-memory channel.
#[derive(Debug)]
pub struct MemoryPeer {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl MemoryTransport {
    #[must_use]
    pub fn pair() -> (Self, MemoryPeer) {
        let shared = Arc::new(Shared {
            connects: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            connected: Mutex::new(false),
            fail_connect: Mutex::new(None),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let transport = Self {
            shared: Arc::clone(&shared),
            outbound: out_tx,
            inbound: Mutex::new(Some(in_rx)),
            taken: Mutex::new(false),
        };
        let peer = MemoryPeer {
            shared,
            outbound: out_rx,
            inbound: in_tx,
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = relock(self.shared.fail_connect.lock()).take() {
            return Err(err);
        }
        *relock(self.shared.connected.lock()) = true;
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !*relock(self.shared.connected.lock()) {
            return Err(TransportError::Closed);
        }
        self.shared.sent.fetch_add(1, Ordering::SeqCst);
        self.outbound
            .send(frame)
            .map_err(|_peer_gone| TransportError::Closed)
    }

    fn receive(&self) -> Result<FrameStream, TransportError> {
        let mut taken = relock(self.taken.lock());
        if *taken {
            return Err(TransportError::StreamTaken);
        }
        let rx = relock(self.inbound.lock())
            .take()
            .ok_or(TransportError::Closed)?;
        *taken = true;

        // An error item ends the stream.
        let stream = UnboundedReceiverStream::new(rx).scan(false, |done, item| {
            if *done {
                return futures::future::ready(None);
            }
            *done = item.is_err();
            futures::future::ready(Some(item))
        });
        Ok(stream.boxed())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        *relock(self.shared.connected.lock()) = false;
        relock(self.inbound.lock()).take();
        Ok(())
    }
}

impl MemoryPeer {
    /// Next frame the client sent, or `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Deliver one frame to the client. Returns `false` if nobody is listening.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.inbound.send(Ok(frame.into())).is_ok()
    }

    /// Deliver a terminal transport error.
    pub fn fail(&self, err: TransportError) -> bool {
        self.inbound.send(Err(err)).is_ok()
    }

    /// Make the next `connect()` on the client side fail with `err`.
    pub fn fail_next_connect(&self, err: TransportError) {
        *relock(self.shared.fail_connect.lock()) = Some(err);
    }

    /// Number of `connect()` calls seen.
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of frames the client has sent.
    pub fn sent_count(&self) -> usize {
        self.shared.sent.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        *relock(self.shared.connected.lock())
    }

    /// Drop the provider side; the client's frame stream ends.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (transport, mut peer) = MemoryTransport::pair();
        transport.connect().await.unwrap();
        let mut frames = transport.receive().unwrap();

        transport.send("{\"id\":1}".into()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("{\"id\":1}"));

        assert!(peer.send("{\"id\":1,\"result\":{}}"));
        assert_eq!(
            frames.next().await,
            Some(Ok("{\"id\":1,\"result\":{}}".to_string()))
        );
        assert_eq!(peer.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_receive_is_take_once() {
        let (transport, _peer) = MemoryTransport::pair();
        transport.connect().await.unwrap();
        let _frames = transport.receive().unwrap();
        assert_eq!(transport.receive().err(), Some(TransportError::StreamTaken));
    }

    #[tokio::test]
    async fn test_error_item_is_terminal() {
        let (transport, peer) = MemoryTransport::pair();
        transport.connect().await.unwrap();
        let mut frames = transport.receive().unwrap();

        peer.fail(TransportError::StreamDropped("gone".into()));
        peer.send("{}");
        assert!(matches!(frames.next().await, Some(Err(_))));
        assert_eq!(frames.next().await, None);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_closed() {
        let (transport, peer) = MemoryTransport::pair();
        assert_eq!(
            transport.send("{}".into()).await.unwrap_err(),
            TransportError::Closed
        );
        assert_eq!(peer.sent_count(), 0);
    }
}
