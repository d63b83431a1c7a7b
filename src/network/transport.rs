// src/network/transport.rs
// The peer-to-peer primitive the session layer runs on: dial a protocol on a
// peer, accept protocol streams, and look up peers close to a key.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use super::codec::{self, MessageReader, MessageWriter};
use super::ranking::{NodeId, PeerId};

/// Trait combining AsyncRead + AsyncWrite for boxed stream type erasure
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// One bidirectional stream, opened for exactly one protocol exchange step
pub type ProtocolStream = Pin<Box<dyn AsyncStream>>;

/// Split a protocol stream into a framed reader and writer.
pub fn framed(stream: ProtocolStream) -> (MessageReader<ReadHalf<ProtocolStream>>, MessageWriter<WriteHalf<ProtocolStream>>) {
    let (read, write) = tokio::io::split(stream);
    (codec::reader(read), codec::writer(write))
}

/// Stream accepted for a registered protocol
pub struct InboundStream {
    pub stream: ProtocolStream,
    pub remote_peer: PeerId,
    pub protocol: String,
}

/// Callback the transport invokes for every inbound stream of a protocol.
pub type StreamAcceptor = Arc<dyn Fn(InboundStream) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {peer} does not speak {protocol}")]
    UnsupportedProtocol { peer: PeerId, protocol: String },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("dial timed out")]
    Timeout,
    #[error("transport closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Our own identity on the overlay
    fn local_peer_id(&self) -> PeerId;

    /// Open a fresh stream to `peer` for `protocol`.
    async fn dial(&self, peer: &PeerId, protocol: &str) -> Result<ProtocolStream, TransportError>;

    /// Route inbound streams for `protocol` to `acceptor`. Registering the
    /// same protocol again replaces the previous acceptor.
    async fn handle(&self, protocol: &str, acceptor: StreamAcceptor) -> Result<(), TransportError>;

    /// Lazily yield peers close to `key` in the keyspace. May be unordered and
    /// may contain duplicates.
    fn closest_peers(&self, key: &NodeId) -> BoxStream<'static, PeerId>;

    /// Protocols `peer` has advertised; empty when unknown.
    async fn supported_protocols(&self, peer: &PeerId) -> HashSet<String>;

    /// Number of peers currently reachable
    fn connection_count(&self) -> usize;

    /// Every peer the transport currently knows about
    async fn known_peers(&self) -> Vec<PeerId>;

    /// Stop accepting streams and release sockets.
    async fn close(&self) {}
}
