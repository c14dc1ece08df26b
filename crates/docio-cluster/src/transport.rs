//! Node-to-node transport
//!
//! Every cross-node call goes through [`NodeTransport`]. The in-process
//! [`LocalTransport`] dispatches straight to the target [`Node`] and fails
//! with `NodeDown` when the node is stopped or partitioned away.

use crate::node::Node;
use crate::replica::ApplyOutcome;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use docio_common::{
    ContentDigest, Error, LogPosition, NodeId, ReplicaKey, Result, SequenceNumber,
};
use docio_store::{
    Query, QueryResult, SnapshotManifest, StoreImage, UpdateLogEntry, UpdateOp,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Replica statistics used by consistency checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStats {
    pub node: NodeId,
    pub key: ReplicaKey,
    /// Last applied update
    pub position: LogPosition,
    /// Committed document count
    pub doc_count: u64,
    /// Digest of the committed documents
    pub digest: ContentDigest,
    /// Live writes waiting for a predecessor
    pub pending: usize,
}

/// Snapshot of one replica written by a backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    pub key: ReplicaKey,
    pub path: PathBuf,
    pub manifest: SnapshotManifest,
}

/// Calls a node makes on another node
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Append as shard leader at `epoch`
    async fn leader_append(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        op: UpdateOp,
        epoch: u64,
    ) -> Result<UpdateLogEntry>;

    /// Forward one live write to a replica
    async fn deliver(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        entry: UpdateLogEntry,
    ) -> Result<ApplyOutcome>;

    /// Replay a batch of entries on a recovering replica
    async fn replay(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        entries: Vec<UpdateLogEntry>,
    ) -> Result<usize>;

    async fn commit(&self, node: NodeId, key: &ReplicaKey) -> Result<()>;

    async fn position(&self, node: NodeId, key: &ReplicaKey) -> Result<LogPosition>;

    async fn epoch_at(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        seq: SequenceNumber,
    ) -> Result<Option<u64>>;

    /// Retained log entries after `after`
    async fn fetch_updates(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<UpdateLogEntry>>;

    async fn fetch_image(&self, node: NodeId, key: &ReplicaKey) -> Result<StoreImage>;

    async fn install_image(&self, node: NodeId, key: &ReplicaKey, image: StoreImage)
    -> Result<usize>;

    /// Drop buffered entries from leaders older than `epoch`
    async fn discard_stale(&self, node: NodeId, key: &ReplicaKey, epoch: u64) -> Result<usize>;

    async fn prune_log(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        through: SequenceNumber,
    ) -> Result<usize>;

    async fn query(&self, node: NodeId, key: &ReplicaKey, query: &Query) -> Result<QueryResult>;

    async fn stats(&self, node: NodeId, key: &ReplicaKey) -> Result<ReplicaStats>;

    /// Snapshot every replica hosted by `node` into sub-directories of `dir`
    async fn snapshot(&self, node: NodeId, dir: PathBuf) -> Result<Vec<ReplicaSnapshot>>;
}

/// In-process transport
#[derive(Default)]
pub struct LocalTransport {
    nodes: DashMap<NodeId, Arc<Node>>,
    partitioned: DashSet<NodeId>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<Node>) {
        self.nodes.insert(node.id(), node);
    }

    /// Make a node unreachable without stopping it
    pub fn partition(&self, node: NodeId) {
        info!("Partitioning {}", node);
        self.partitioned.insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        info!("Healing {}", node);
        self.partitioned.remove(&node);
    }

    #[must_use]
    pub fn is_partitioned(&self, node: NodeId) -> bool {
        self.partitioned.contains(&node)
    }

    /// Reachable node
    pub fn node(&self, id: NodeId) -> Result<Arc<Node>> {
        let node = self
            .nodes
            .get(&id)
            .map(|n| Arc::clone(n.value()))
            .ok_or(Error::NodeNotFound(id))?;
        if !node.is_running() || self.partitioned.contains(&id) {
            return Err(Error::NodeDown(id));
        }
        Ok(node)
    }

    /// Registered node regardless of reachability
    pub fn node_handle(&self, id: NodeId) -> Result<Arc<Node>> {
        self.nodes
            .get(&id)
            .map(|n| Arc::clone(n.value()))
            .ok_or(Error::NodeNotFound(id))
    }

    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| *n.key()).collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn leader_append(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        op: UpdateOp,
        epoch: u64,
    ) -> Result<UpdateLogEntry> {
        self.node(node)?.leader_append(key, op, epoch)
    }

    async fn deliver(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        entry: UpdateLogEntry,
    ) -> Result<ApplyOutcome> {
        self.node(node)?.replica(key)?.deliver(entry)
    }

    async fn replay(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        entries: Vec<UpdateLogEntry>,
    ) -> Result<usize> {
        self.node(node)?.replica(key)?.replay(entries)
    }

    async fn commit(&self, node: NodeId, key: &ReplicaKey) -> Result<()> {
        self.node(node)?.replica(key)?.store().commit()
    }

    async fn position(&self, node: NodeId, key: &ReplicaKey) -> Result<LogPosition> {
        Ok(self.node(node)?.replica(key)?.position())
    }

    async fn epoch_at(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        seq: SequenceNumber,
    ) -> Result<Option<u64>> {
        Ok(self.node(node)?.replica(key)?.store().epoch_at(seq))
    }

    async fn fetch_updates(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        after: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<UpdateLogEntry>> {
        self.node(node)?
            .replica(key)?
            .store()
            .updates_since(after, limit)
    }

    async fn fetch_image(&self, node: NodeId, key: &ReplicaKey) -> Result<StoreImage> {
        Ok(self.node(node)?.replica(key)?.store().export())
    }

    async fn install_image(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        image: StoreImage,
    ) -> Result<usize> {
        self.node(node)?.replica(key)?.install_image(image)
    }

    async fn discard_stale(&self, node: NodeId, key: &ReplicaKey, epoch: u64) -> Result<usize> {
        Ok(self.node(node)?.replica(key)?.discard_stale(epoch))
    }

    async fn prune_log(
        &self,
        node: NodeId,
        key: &ReplicaKey,
        through: SequenceNumber,
    ) -> Result<usize> {
        Ok(self
            .node(node)?
            .replica(key)?
            .store()
            .prune_log_through(through))
    }

    async fn query(&self, node: NodeId, key: &ReplicaKey, query: &Query) -> Result<QueryResult> {
        Ok(self.node(node)?.replica(key)?.store().query(query))
    }

    async fn stats(&self, node: NodeId, key: &ReplicaKey) -> Result<ReplicaStats> {
        let replica = self.node(node)?.replica(key)?;
        let store = replica.store();
        Ok(ReplicaStats {
            node,
            key: key.clone(),
            position: store.applied_position(),
            doc_count: store.doc_count(),
            digest: store.digest()?,
            pending: replica.pending_len(),
        })
    }

    async fn snapshot(&self, node: NodeId, dir: PathBuf) -> Result<Vec<ReplicaSnapshot>> {
        let replicas = self.node(node)?.replicas();
        tokio::task::spawn_blocking(move || -> Result<Vec<ReplicaSnapshot>> {
            std::fs::create_dir_all(&dir)?;
            let mut written = Vec::with_capacity(replicas.len());
            for replica in replicas {
                let key = replica.key().clone();
                let path = dir.join(format!("{}_{}", key.collection, key.shard));
                let manifest = replica.store().snapshot_to(&path)?;
                debug!("Snapshot of {} on {}: {} docs", key, node, manifest.doc_count);
                written.push(ReplicaSnapshot {
                    key,
                    path,
                    manifest,
                });
            }
            Ok(written)
        })
        .await
        .map_err(|e| Error::internal(format!("snapshot task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipDirectory;
    use docio_common::{CollectionName, Config, ShardId};
    use std::net::SocketAddr;

    fn setup() -> (LocalTransport, ReplicaKey) {
        let config = Config::default();
        let directory = Arc::new(MembershipDirectory::new(&config.cluster));
        let key = ReplicaKey::new(CollectionName::new_unchecked("c"), ShardId::new(1));
        let transport = LocalTransport::new();
        let node = Arc::new(Node::new(
            NodeId::new(1),
            SocketAddr::from(([127, 0, 0, 1], 7001)),
            directory,
            &config,
        ));
        node.open_replica(&key);
        node.set_running(true);
        transport.register(node);
        (transport, key)
    }

    #[tokio::test]
    async fn test_reachability() {
        let (transport, key) = setup();
        let id = NodeId::new(1);
        assert_eq!(transport.position(id, &key).await.unwrap(), LogPosition::ZERO);

        transport.partition(id);
        assert!(matches!(
            transport.position(id, &key).await,
            Err(Error::NodeDown(_))
        ));
        transport.heal(id);

        transport.node_handle(id).unwrap().set_running(false);
        assert!(matches!(
            transport.position(id, &key).await,
            Err(Error::NodeDown(_))
        ));
        assert!(matches!(
            transport.position(NodeId::new(2), &key).await,
            Err(Error::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_writes_one_dir_per_replica() {
        let (transport, key) = setup();
        let dir = tempfile::TempDir::new().unwrap();
        let written = transport
            .snapshot(NodeId::new(1), dir.path().join("snap"))
            .await
            .unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].key, key);
        assert!(written[0].path.join("manifest.json").exists());
    }
}
