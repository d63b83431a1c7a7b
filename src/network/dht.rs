// src/network/dht.rs
// Kademlia routing table for peer discovery

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::ranking::{xor_distance, NodeId, PeerId};

/// K-bucket size (number of peers per bucket)
pub const K: usize = 20;

/// Parallel lookups per round
pub const ALPHA: usize = 3;

/// Peers not seen for this long are replaceable and no longer count as connected
pub const STALE_AFTER: Duration = Duration::from_secs(900);

/// What we know about a remote peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub address: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub last_seen: u64,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, address: impl Into<String>, protocols: Vec<String>) -> Self {
        Self {
            peer_id,
            address: address.into(),
            protocols,
            last_seen: current_unix(),
        }
    }

    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen) > STALE_AFTER.as_secs()
    }
}

/// K-bucket (stores peers at specific distance)
#[derive(Debug)]
struct KBucket {
    peers: VecDeque<PeerRecord>,
    last_updated: Instant,
}

impl KBucket {
    fn new() -> Self {
        Self {
            peers: VecDeque::new(),
            last_updated: Instant::now(),
        }
    }

    /// Insert or refresh `peer`. Returns the record it displaced, if any, or
    /// `Err` when the bucket is full of live peers.
    fn add(&mut self, peer: PeerRecord) -> Result<Option<PeerRecord>, PeerRecord> {
        if let Some(pos) = self.peers.iter().position(|p| p.peer_id == peer.peer_id) {
            self.peers.remove(pos);
            self.peers.push_back(peer);
            self.last_updated = Instant::now();
            return Ok(None);
        }

        if self.peers.len() < K {
            self.peers.push_back(peer);
            self.last_updated = Instant::now();
            return Ok(None);
        }

        // Bucket full, try to replace stale peer
        let now = current_unix();
        match self.peers.iter().position(|p| p.is_stale(now)) {
            Some(stale) => {
                let evicted = self.peers.remove(stale);
                self.peers.push_back(peer);
                self.last_updated = Instant::now();
                Ok(evicted)
            }
            None => Err(peer),
        }
    }

    fn remove(&mut self, peer: &PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| &p.peer_id != peer);
        before != self.peers.len()
    }
}

/// Routing table (256 buckets for 256-bit ids)
pub struct RoutingTable {
    local: PeerId,
    local_id: NodeId,
    buckets: Vec<Mutex<KBucket>>,
    /// Peer storage for quick lookup
    index: Mutex<HashMap<PeerId, PeerRecord>>,
}

impl RoutingTable {
    pub fn new(local: PeerId) -> Self {
        let buckets = (0..256).map(|_| Mutex::new(KBucket::new())).collect();
        Self {
            local_id: local.kad_id(),
            local,
            buckets,
            index: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Add or refresh a peer; returns false if its bucket had no room.
    pub fn add_peer(&self, peer: PeerRecord) -> bool {
        if peer.peer_id == self.local {
            return false;
        }
        let bucket_index = self.bucket_index(&peer.peer_id.kad_id());
        let result = self.buckets[bucket_index].lock().add(peer.clone());
        let mut index = self.index.lock();
        match result {
            Ok(evicted) => {
                if let Some(evicted) = evicted {
                    index.remove(&evicted.peer_id);
                }
                index.insert(peer.peer_id.clone(), peer);
                true
            }
            Err(_) => false,
        }
    }

    /// Mark a peer as seen now, keeping its other fields.
    pub fn touch(&self, peer: &PeerId) {
        if let Some(mut record) = self.get(peer) {
            record.last_seen = current_unix();
            self.add_peer(record);
        }
    }

    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let bucket_index = self.bucket_index(&peer.kad_id());
        self.buckets[bucket_index].lock().remove(peer);
        self.index.lock().remove(peer).is_some()
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.index.lock().get(peer).cloned()
    }

    pub fn protocols(&self, peer: &PeerId) -> HashSet<String> {
        self.get(peer)
            .map(|r| r.protocols.into_iter().collect())
            .unwrap_or_default()
    }

    /// Find closest peers to target
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        let mut all_peers = Vec::new();

        // Start at the target's bucket and widen outwards
        let start_bucket = self.bucket_index(target);
        for offset in 0..256 {
            let bucket_idx = (start_bucket + offset) % 256;
            all_peers.extend(self.buckets[bucket_idx].lock().peers.iter().cloned());

            if all_peers.len() >= count * 2 {
                break;
            }
        }

        all_peers.sort_by_cached_key(|p| p.peer_id.distance(target));
        all_peers.truncate(count);
        all_peers
    }

    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.index.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peers seen within `STALE_AFTER`
    pub fn live_count(&self) -> usize {
        let now = current_unix();
        self.index.lock().values().filter(|p| !p.is_stale(now)).count()
    }

    /// Ids for buckets that have not changed within `max_age`; one random-ish
    /// target per bucket to look up during refresh.
    pub fn stale_bucket_targets(&self, max_age: Duration) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for (i, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.lock();
            if !bucket.peers.is_empty() && bucket.last_updated.elapsed() > max_age {
                let mut target = self.local_id;
                let bit = 255 - i;
                target[bit / 8] ^= 0x80 >> (bit % 8);
                targets.push(target);
            }
        }
        targets
    }

    /// Get bucket index for node ID
    fn bucket_index(&self, node_id: &NodeId) -> usize {
        let distance = xor_distance(&self.local_id, node_id);

        // Find first non-zero bit (distance)
        for (i, &byte) in distance.iter().enumerate() {
            if byte != 0 {
                return 255 - (i * 8 + byte.leading_zeros() as usize);
            }
        }

        0
    }
}

/// Get current unix timestamp
pub fn current_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
