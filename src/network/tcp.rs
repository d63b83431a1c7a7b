// src/network/tcp.rs
// TCP transport: one connection per protocol stream.
//
// The dialer opens a socket and sends a hello frame naming itself and the
// protocol it wants; the listener answers with an accept frame. After that
// the socket belongs to the protocol exchange. Hello/accept frames use a
// 4-byte big-endian length and are read with `read_exact` so nothing past
// the handshake is consumed. The identify protocol ends right after the
// handshake and carries the listener's closest known peers for discovery.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::dht::{current_unix, PeerRecord, RoutingTable, ALPHA, K};
use super::ranking::{NodeId, PeerId};
use super::transport::{InboundStream, ProtocolStream, StreamAcceptor, Transport, TransportError};

/// Handshake-only protocol used for bootstrap and routing refresh
pub const IDENTIFY: &str = "/dkg/identify/1.0.0";

const MAX_HANDSHAKE_BYTES: usize = 1024 * 1024;

/// Sent by the dialer on connect
#[derive(Serialize, Deserialize, Debug, Clone)]
struct StreamHello {
    peer_id: PeerId,
    listen_addr: String,
    protocols: Vec<String>,
    protocol: String,
}

/// Listener's answer to a hello
#[derive(Serialize, Deserialize, Debug, Clone)]
struct StreamAccept {
    peer_id: PeerId,
    accepted: bool,
    protocols: Vec<String>,
    #[serde(default)]
    peers: Vec<PeerRecord>,
}

struct TcpInner {
    local: PeerId,
    listen_addr: String,
    routing: RoutingTable,
    acceptors: DashMap<String, StreamAcceptor>,
    dial_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    /// Bind the listener and start accepting connections.
    pub async fn bind(local: PeerId, listen_addr: &str, dial_timeout: Duration) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(listen_addr).await?;
        let bound = listener.local_addr()?.to_string();
        tracing::info!("P2P listener bound to {}", bound);

        let (shutdown_tx, _) = broadcast::channel(1);
        let inner = Arc::new(TcpInner {
            routing: RoutingTable::new(local.clone()),
            local,
            listen_addr: bound,
            acceptors: DashMap::new(),
            dial_timeout,
            shutdown_tx,
        });

        let accept_inner = inner.clone();
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_res = listener.accept() => {
                        match accept_res {
                            Ok((socket, peer_addr)) => {
                                let inner = accept_inner.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = inner.accept_stream(socket, peer_addr).await {
                                        tracing::debug!("Inbound handshake from {} failed: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self { inner })
    }

    /// Address the listener is bound to
    pub fn listen_addr(&self) -> &str {
        &self.inner.listen_addr
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    /// Learn about a peer (and its neighbours) from its address alone.
    pub async fn identify(&self, address: &str) -> Result<PeerRecord, TransportError> {
        self.inner.identify(address).await
    }

    /// Identify every bootstrap address; returns how many answered.
    pub async fn bootstrap(&self, addresses: &[String]) -> usize {
        let mut reached = 0;
        for address in addresses {
            match self.inner.identify(address).await {
                Ok(record) => {
                    tracing::info!("DHT: Bootstrapped from {} ({})", address, record.peer_id);
                    reached += 1;
                }
                Err(e) => {
                    tracing::warn!("Bootstrap peer {} unreachable: {}", address, e);
                }
            }
        }
        tracing::info!("DHT: {} peers known after bootstrap", self.inner.routing.len());
        reached
    }

    /// Periodic routing refresh (background task)
    pub fn spawn_refresh(&self, every: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => inner.refresh(every).await,
                    _ = shutdown_rx.recv() => {
                        tracing::info!("DHT refresh loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl TcpInner {
    fn local_protocols(&self) -> Vec<String> {
        self.acceptors.iter().map(|e| e.key().clone()).collect()
    }

    async fn accept_stream(&self, mut socket: TcpStream, observed: SocketAddr) -> Result<(), TransportError> {
        let hello: StreamHello =
            tokio::time::timeout(self.dial_timeout, read_frame(&mut socket))
                .await
                .map_err(|_| TransportError::Timeout)??;

        let address = advertised_address(observed, &hello.listen_addr);
        if self
            .routing
            .add_peer(PeerRecord::new(hello.peer_id.clone(), address, hello.protocols.clone()))
        {
            tracing::debug!(peer = %hello.peer_id, "Connected to peer");
        }

        let identify = hello.protocol == IDENTIFY;
        let acceptor = if identify {
            None
        } else {
            self.acceptors.get(&hello.protocol).map(|a| a.value().clone())
        };
        let peers = if identify {
            self.routing
                .find_closest(&hello.peer_id.kad_id(), K + 1)
                .into_iter()
                .filter(|p| p.peer_id != hello.peer_id)
                .take(K)
                .collect()
        } else {
            Vec::new()
        };

        let accept = StreamAccept {
            peer_id: self.local.clone(),
            accepted: identify || acceptor.is_some(),
            protocols: self.local_protocols(),
            peers,
        };
        write_frame(&mut socket, &accept).await?;

        if let Some(acceptor) = acceptor {
            acceptor(InboundStream {
                stream: Box::pin(socket),
                remote_peer: hello.peer_id,
                protocol: hello.protocol,
            })
            .await;
        }
        Ok(())
    }

    async fn open(&self, address: &str, protocol: &str) -> Result<(TcpStream, StreamAccept), TransportError> {
        let mut socket = tokio::time::timeout(self.dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let hello = StreamHello {
            peer_id: self.local.clone(),
            listen_addr: self.listen_addr.clone(),
            protocols: self.local_protocols(),
            protocol: protocol.to_string(),
        };
        write_frame(&mut socket, &hello).await?;
        let accept: StreamAccept = tokio::time::timeout(self.dial_timeout, read_frame(&mut socket))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok((socket, accept))
    }

    async fn identify(&self, address: &str) -> Result<PeerRecord, TransportError> {
        let (_socket, accept) = self.open(address, IDENTIFY).await?;
        let record = PeerRecord::new(accept.peer_id.clone(), address, accept.protocols);
        self.routing.add_peer(record.clone());

        let mut learned = 0;
        for peer in accept.peers {
            if peer.peer_id != self.local && self.routing.get(&peer.peer_id).is_none() && self.routing.add_peer(peer) {
                learned += 1;
            }
        }
        if learned > 0 {
            tracing::debug!(peer = %record.peer_id, "Discovered {} peers", learned);
        }
        Ok(record)
    }

    async fn refresh(&self, every: Duration) {
        tracing::debug!("DHT: Refreshing routing table");
        let now = current_unix();
        for record in self.routing.all_peers() {
            if let Err(e) = self.identify(&record.address).await {
                tracing::debug!(peer = %record.peer_id, "Refresh failed: {}", e);
                if record.is_stale(now) {
                    self.routing.remove_peer(&record.peer_id);
                }
            }
        }

        // buckets nobody touched lately get a lookup of their own
        for target in self.routing.stale_bucket_targets(every) {
            for record in self.routing.find_closest(&target, ALPHA) {
                let _ = self.identify(&record.address).await;
            }
        }
        tracing::debug!(
            "DHT: {} peers known, {} live",
            self.routing.len(),
            self.routing.live_count()
        );
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer_id(&self) -> PeerId {
        self.inner.local.clone()
    }

    async fn dial(&self, peer: &PeerId, protocol: &str) -> Result<ProtocolStream, TransportError> {
        let record = self
            .inner
            .routing
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;

        let (socket, accept) = self.inner.open(&record.address, protocol).await?;
        if &accept.peer_id != peer {
            return Err(TransportError::Handshake(format!(
                "expected {} at {}, found {}",
                peer, record.address, accept.peer_id
            )));
        }
        self.inner
            .routing
            .add_peer(PeerRecord::new(peer.clone(), record.address, accept.protocols));

        if !accept.accepted {
            return Err(TransportError::UnsupportedProtocol {
                peer: peer.clone(),
                protocol: protocol.to_string(),
            });
        }
        Ok(Box::pin(socket))
    }

    async fn handle(&self, protocol: &str, acceptor: StreamAcceptor) -> Result<(), TransportError> {
        self.inner.acceptors.insert(protocol.to_string(), acceptor);
        Ok(())
    }

    /// Locally known peers first, then whatever one lookup round through
    /// the nearest of them turns up.
    fn closest_peers(&self, key: &NodeId) -> BoxStream<'static, PeerId> {
        let inner = self.inner.clone();
        let key = *key;
        let known: Vec<PeerId> = inner
            .routing
            .find_closest(&key, K)
            .into_iter()
            .map(|r| r.peer_id)
            .collect();

        let seeds = known.clone();
        let lookup = async move {
            let queried: Vec<PeerRecord> = seeds
                .iter()
                .take(ALPHA)
                .filter_map(|p| inner.routing.get(p))
                .collect();
            futures::future::join_all(queried.iter().map(|r| inner.identify(&r.address))).await;

            let fresh: Vec<PeerId> = inner
                .routing
                .find_closest(&key, K)
                .into_iter()
                .map(|r| r.peer_id)
                .filter(|p| !seeds.contains(p))
                .collect();
            stream::iter(fresh)
        };

        stream::iter(known)
            .chain(stream::once(lookup).flatten())
            .boxed()
    }

    async fn supported_protocols(&self, peer: &PeerId) -> HashSet<String> {
        self.inner.routing.protocols(peer)
    }

    fn connection_count(&self) -> usize {
        self.inner.routing.live_count()
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        self.inner
            .routing
            .all_peers()
            .into_iter()
            .map(|r| r.peer_id)
            .collect()
    }

    async fn close(&self) {
        let _ = self.inner.shutdown_tx.send(());
        self.inner.acceptors.clear();
    }
}

/// Replace an unspecified host in the peer's claimed listen address with the
/// address we actually saw the connection come from.
fn advertised_address(observed: SocketAddr, claimed: &str) -> String {
    match claimed.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => SocketAddr::new(observed.ip(), addr.port()).to_string(),
        Ok(addr) => addr.to_string(),
        Err(_) => claimed.to_string(),
    }
}

async fn write_frame<S, T>(stream: &mut S, value: &T) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value).map_err(|e| TransportError::Handshake(e.to_string()))?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S, T>(stream: &mut S) -> Result<T, TransportError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    // read 4-byte length
    let mut lenb = [0u8; 4];
    stream.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;
    if len > MAX_HANDSHAKE_BYTES {
        return Err(TransportError::Handshake(format!("handshake frame of {} bytes", len)));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| TransportError::Handshake(e.to_string()))
}
