// src/network/memory.rs
// In-process transport: every node joins a shared hub and streams are
// `tokio::io::duplex` pipes. Used by tests and local simulations.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::ranking::{NodeId, PeerId};
use super::transport::{InboundStream, ProtocolStream, StreamAcceptor, Transport, TransportError};

const PIPE_BUFFER: usize = 64 * 1024;

#[derive(Default)]
struct NodeState {
    acceptors: DashMap<String, StreamAcceptor>,
    advertised: RwLock<HashSet<String>>,
    online: AtomicBool,
}

#[derive(Default)]
struct Hub {
    nodes: DashMap<PeerId, Arc<NodeState>>,
}

/// Shared medium all in-memory transports attach to
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node with the given identity to the network.
    pub fn join(&self, peer: PeerId) -> Arc<MemoryTransport> {
        let state = Arc::new(NodeState::default());
        state.online.store(true, Ordering::SeqCst);
        self.hub.nodes.insert(peer.clone(), state.clone());
        Arc::new(MemoryTransport {
            peer,
            hub: self.hub.clone(),
            state,
        })
    }

    pub fn len(&self) -> usize {
        self.hub.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hub.nodes.is_empty()
    }
}

pub struct MemoryTransport {
    peer: PeerId,
    hub: Arc<Hub>,
    state: Arc<NodeState>,
}

impl MemoryTransport {
    /// Announce a protocol without serving it
    pub fn advertise(&self, protocol: &str) {
        self.state.advertised.write().insert(protocol.to_string());
    }

    /// Take the node off the network; dials to it fail until it rejoins.
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::SeqCst);
    }

    fn others(&self) -> Vec<PeerId> {
        self.hub
            .nodes
            .iter()
            .filter(|e| e.key() != &self.peer && e.value().online.load(Ordering::SeqCst))
            .map(|e| e.key().clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer.clone()
    }

    async fn dial(&self, peer: &PeerId, protocol: &str) -> Result<ProtocolStream, TransportError> {
        if !self.state.online.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let node = self
            .hub
            .nodes
            .get(peer)
            .map(|n| n.value().clone())
            .filter(|n| n.online.load(Ordering::SeqCst))
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;

        let acceptor = node
            .acceptors
            .get(protocol)
            .map(|a| a.value().clone())
            .ok_or_else(|| TransportError::UnsupportedProtocol {
                peer: peer.clone(),
                protocol: protocol.to_string(),
            })?;

        let (local, remote) = tokio::io::duplex(PIPE_BUFFER);
        let inbound = InboundStream {
            stream: Box::pin(remote),
            remote_peer: self.peer.clone(),
            protocol: protocol.to_string(),
        };
        tokio::spawn(acceptor(inbound));
        Ok(Box::pin(local))
    }

    async fn handle(&self, protocol: &str, acceptor: StreamAcceptor) -> Result<(), TransportError> {
        self.state.acceptors.insert(protocol.to_string(), acceptor);
        self.advertise(protocol);
        Ok(())
    }

    fn closest_peers(&self, key: &NodeId) -> BoxStream<'static, PeerId> {
        let mut peers = self.others();
        peers.sort_by_cached_key(|p| p.distance(key));
        stream::iter(peers).boxed()
    }

    async fn supported_protocols(&self, peer: &PeerId) -> HashSet<String> {
        self.hub
            .nodes
            .get(peer)
            .map(|n| n.advertised.read().clone())
            .unwrap_or_default()
    }

    fn connection_count(&self) -> usize {
        if self.state.online.load(Ordering::SeqCst) {
            self.others().len()
        } else {
            0
        }
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        self.others()
    }

    async fn close(&self) {
        self.set_online(false);
        self.state.acceptors.clear();
    }
}
