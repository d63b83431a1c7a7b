// src/network/discovery.rs
// Choose which peers to talk to for a key.

use futures::StreamExt;
use std::collections::HashSet;

use super::ranking::{self, PeerId};
use super::transport::Transport;

/// Peers closest to `key` that speak `protocol`, nearest first, at most `limit`.
///
/// Candidates come from the transport's lazy DHT walk and are consumed up to
/// `max_candidates`. Returning fewer than `limit` peers is not an error.
pub async fn find_nodes(
    transport: &dyn Transport,
    key: &str,
    protocol: &str,
    limit: usize,
    max_candidates: usize,
) -> Vec<PeerId> {
    let target = ranking::key_id(key);
    let mut candidates = transport.closest_peers(&target).take(max_candidates);

    let mut seen = HashSet::new();
    let mut matching = Vec::new();
    while let Some(peer) = candidates.next().await {
        if !seen.insert(peer.clone()) {
            continue;
        }
        if transport.supported_protocols(&peer).await.contains(protocol) {
            matching.push(peer);
        }
    }

    let nodes = ranking::rank(matching, &target, limit);
    if nodes.len() < limit {
        tracing::warn!(
            key = %key,
            protocol = %protocol,
            "Found only {} of {} requested nodes",
            nodes.len(),
            limit
        );
    } else {
        tracing::debug!(key = %key, protocol = %protocol, "Found {} nodes", nodes.len());
    }
    nodes
}

/// Union of `find_nodes` over several keywords, deduplicated, keeping the
/// order in which peers were first found.
pub async fn find_nodes_for_keywords(
    transport: &dyn Transport,
    keywords: &[String],
    protocol: &str,
    limit: usize,
    max_candidates: usize,
) -> Vec<PeerId> {
    let mut seen = HashSet::new();
    let mut nodes = Vec::new();
    for keyword in keywords {
        for peer in find_nodes(transport, keyword, protocol, limit, max_candidates).await {
            if seen.insert(peer.clone()) {
                nodes.push(peer);
            }
        }
    }

    if nodes.len() < limit {
        tracing::warn!(
            protocol = %protocol,
            "Found only {} nodes for {} keywords, replication factor is {}",
            nodes.len(),
            keywords.len(),
            limit
        );
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::MemoryNetwork;
    use crate::network::transport::Transport;

    #[tokio::test]
    async fn filters_by_protocol_and_ranks() {
        let net = MemoryNetwork::new();
        let local = net.join(PeerId::random());
        let mut speakers = Vec::new();
        for i in 0..8 {
            let peer = net.join(PeerId::random());
            if i % 2 == 0 {
                peer.advertise("/store/1.0.0");
                speakers.push(peer.local_peer_id());
            } else {
                peer.advertise("/get/1.0.0");
            }
        }

        let found = find_nodes(&*local, "0xabc", "/store/1.0.0", 3, 100).await;
        assert_eq!(found, ranking::rank(speakers, &ranking::key_id("0xabc"), 3));
    }

    #[tokio::test]
    async fn short_result_is_not_an_error() {
        let net = MemoryNetwork::new();
        let local = net.join(PeerId::random());
        let only = net.join(PeerId::random());
        only.advertise("/search/1.0.0");

        let found = find_nodes(&*local, "k", "/search/1.0.0", 5, 100).await;
        assert_eq!(found, vec![only.local_peer_id()]);
        assert!(find_nodes(&*local, "k", "/get/1.0.0", 5, 100).await.is_empty());
    }

    #[tokio::test]
    async fn keywords_are_merged_without_duplicates() {
        let net = MemoryNetwork::new();
        let local = net.join(PeerId::random());
        for _ in 0..4 {
            net.join(PeerId::random()).advertise("/store/1.0.0");
        }
        let keywords = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = find_nodes_for_keywords(&*local, &keywords, "/store/1.0.0", 2, 100).await;
        let unique: HashSet<_> = found.iter().cloned().collect();
        assert_eq!(unique.len(), found.len());
        assert!(found.len() >= 2 && found.len() <= 4);
    }
}
