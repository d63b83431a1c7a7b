// src/network/ranking.rs
// Peer identities and XOR-distance ranking over the DHT keyspace

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Position in the 256-bit DHT keyspace
pub type NodeId = [u8; 32];

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("empty peer id")]
    Empty,
    #[error("invalid base58 peer id: {0}")]
    Base58(#[from] bs58::decode::Error),
}

/// Opaque identifier of a network peer, as handed out by the transport.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, PeerIdError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(PeerIdError::Empty);
        }
        Ok(Self(bytes))
    }

    /// Fresh random identity (32 bytes)
    pub fn random() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Where this peer sits in the keyspace
    pub fn kad_id(&self) -> NodeId {
        digest(&self.0)
    }

    /// XOR distance between this peer and an already hashed key
    pub fn distance(&self, key: &NodeId) -> NodeId {
        xor_distance(&self.kad_id(), key)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s.trim()).into_vec()?;
        Self::from_bytes(bytes)
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> Self {
        peer.to_base58()
    }
}

/// The network's fixed digest: sha256 into the DHT identifier space.
pub fn digest(bytes: &[u8]) -> NodeId {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hash = hasher.finalize();

    let mut id = [0u8; 32];
    id.copy_from_slice(&hash[..]);
    id
}

/// Hash a textual key (assertion id, keyword) into the keyspace
pub fn key_id(key: &str) -> NodeId {
    digest(key.as_bytes())
}

/// XOR distance between two node IDs
pub fn xor_distance(a: &NodeId, b: &NodeId) -> NodeId {
    let mut result = [0u8; 32];
    for i in 0..32 {
        result[i] = a[i] ^ b[i];
    }
    result
}

/// Order peers by ascending distance to `key` and keep the `limit` closest.
///
/// Arrays compare lexicographically, which for the distance bytes is the same
/// as comparing them as big-endian integers.
pub fn rank(peers: Vec<PeerId>, key: &NodeId, limit: usize) -> Vec<PeerId> {
    let mut peers = peers;
    peers.sort_by_cached_key(|p| p.distance(key));
    peers.truncate(limit);
    peers
}
