//! Document and replica placement
//!
//! Documents map to shards by hashing their id. Replicas of a new shard are
//! spread over the live nodes with Highest Random Weight (rendezvous)
//! hashing, so the same inputs always yield the same layout.

use docio_common::{DocId, NodeId, ReplicaKey, ShardId};
use xxhash_rust::xxh64::xxh64;

/// Seed for document id hashing
const DOC_HASH_SEED: u64 = 0;

/// Shard that owns `doc_id` in a collection with `shard_count` shards
#[must_use]
pub fn shard_for(doc_id: &DocId, shard_count: u32) -> ShardId {
    let hash = xxh64(doc_id.as_str().as_bytes(), DOC_HASH_SEED);
    let index = hash % u64::from(shard_count.max(1));
    // index < shard_count, so the cast is lossless
    #[allow(clippy::cast_possible_truncation)]
    ShardId::from_index(index as u32)
}

fn key_hash(key: &ReplicaKey) -> u64 {
    let mut bytes = Vec::with_capacity(key.collection.as_str().len() + 4);
    bytes.extend_from_slice(key.collection.as_str().as_bytes());
    bytes.extend_from_slice(&key.shard.get().to_be_bytes());
    xxh64(&bytes, DOC_HASH_SEED)
}

/// Pick `count` nodes for the replicas of `key` (HRW)
///
/// Returns fewer than `count` nodes if not enough are available. Nodes are
/// ordered by descending score.
#[must_use]
pub fn assign_replicas(key: &ReplicaKey, nodes: &[NodeId], count: usize) -> Vec<NodeId> {
    if nodes.is_empty() {
        return Vec::new();
    }

    let shard_hash = key_hash(key);

    // Calculate HRW score for each node
    let mut scored: Vec<(NodeId, u64)> = nodes
        .iter()
        .map(|node| (*node, xxh64(&node.to_bytes(), shard_hash)))
        .collect();

    // Sort by score descending, ties on the lower id
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.dedup_by_key(|(node, _)| *node);

    scored.truncate(count);
    scored.into_iter().map(|(node, _)| node).collect()
}
