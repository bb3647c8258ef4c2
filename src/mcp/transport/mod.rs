//! Byte-channel transports underneath a [`ProtocolClient`](crate::mcp::client::ProtocolClient).
//!
//! A transport frames JSON documents and nothing else; message semantics
//! (ids, methods, results) belong to the protocol client.
//!
//! - [`ProcessTransport`]: child process, newline-delimited JSON over stdio.
//! - [`StreamingHttpTransport`]: fixed remote endpoint, JSON or SSE frames.
//! - [`MemoryTransport`]: in-process pair, for embedding and tests.

mod http;
mod memory;
mod process;

pub use http::{StreamingHttpConfig, StreamingHttpTransport};
pub use memory::{MemoryPeer, MemoryTransport};
pub use process::{DEFAULT_SPAWN_GRACE, ProcessConfig, ProcessTransport};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::TransportError;

/// Default bound on a single inbound frame (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Inbound frames, one complete JSON document per item.
///
/// The stream is lazy and can be taken only once. It ends when the channel
/// closes; an `Err` item is terminal and is followed by the end of the stream.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// One bidirectional frame channel.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Open the channel. Must be called once before `send`/`receive`.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send one frame. The transport adds its own delimiter.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Take the inbound frame stream. Fails with
    /// [`TransportError::StreamTaken`] on the second call.
    fn receive(&self) -> Result<FrameStream, TransportError>;

    /// Close the channel and release its resources. Idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
