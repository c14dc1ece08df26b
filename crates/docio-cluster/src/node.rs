//! Cluster node
//!
//! A node hosts replicas of any number of shards. Its stores survive a stop
//! (as a disk would), so a restarted node can catch up incrementally.

use crate::membership::MembershipDirectory;
use crate::replica::Replica;
use dashmap::DashMap;
use docio_common::{Config, Error, NodeId, ReplicaKey, Result, SessionId};
use docio_store::{MemoryStore, UpdateLogEntry, UpdateOp};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Node {
    id: NodeId,
    address: SocketAddr,
    running: AtomicBool,
    session: Mutex<Option<SessionId>>,
    replicas: DashMap<ReplicaKey, Arc<Replica>>,
    directory: Arc<MembershipDirectory>,
    max_log_entries: usize,
    max_buffered: usize,
}

impl Node {
    pub fn new(
        id: NodeId,
        address: SocketAddr,
        directory: Arc<MembershipDirectory>,
        config: &Config,
    ) -> Self {
        Self {
            id,
            address,
            running: AtomicBool::new(false),
            session: Mutex::new(None),
            replicas: DashMap::new(),
            directory,
            max_log_entries: config.update_log.max_retained_entries,
            max_buffered: config.recovery.max_buffered_entries,
        }
    }

    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        *self.session.lock()
    }

    pub fn set_session(&self, session: Option<SessionId>) {
        *self.session.lock() = session;
    }

    /// Get or create the local replica of `key`
    pub fn open_replica(&self, key: &ReplicaKey) -> Arc<Replica> {
        self.replicas
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Replica::new(
                    key.clone(),
                    Arc::new(MemoryStore::new(self.max_log_entries)),
                    self.max_buffered,
                ))
            })
            .clone()
    }

    pub fn replica(&self, key: &ReplicaKey) -> Result<Arc<Replica>> {
        self.replicas
            .get(key)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| Error::ReplicaNotFound {
                key: key.clone(),
                node: self.id,
            })
    }

    /// Local replicas ordered by key
    #[must_use]
    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        let mut replicas: Vec<Arc<Replica>> =
            self.replicas.iter().map(|r| Arc::clone(r.value())).collect();
        replicas.sort_by(|a, b| a.key().cmp(b.key()));
        replicas
    }

    /// Append as shard leader
    ///
    /// Fails with `LeaderLost` unless the directory still names this node
    /// leader of `key` at `epoch`.
    pub fn leader_append(
        &self,
        key: &ReplicaKey,
        op: UpdateOp,
        epoch: u64,
    ) -> Result<UpdateLogEntry> {
        let owns = self
            .directory
            .leader_info(key)
            .is_some_and(|l| l.node == self.id && l.epoch == epoch);
        if !owns {
            return Err(Error::LeaderLost {
                key: key.clone(),
                node: self.id,
            });
        }
        self.replica(key)?.leader_append(op, epoch)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("running", &self.is_running())
            .field("replicas", &self.replicas.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docio_common::{CollectionName, DocId, ReplicaState, ShardId};
    use docio_store::Document;

    fn setup() -> (Arc<MembershipDirectory>, Node, ReplicaKey) {
        let config = Config::default();
        let directory = Arc::new(MembershipDirectory::new(&config.cluster));
        let name = CollectionName::new("c").unwrap();
        directory.create_collection(&name, 1, 1).unwrap();
        let key = ReplicaKey::new(name, ShardId::new(1));
        let address = SocketAddr::from(([127, 0, 0, 1], 7001));
        let node = Node::new(NodeId::new(1), address, directory.clone(), &config);
        directory.register_node(node.id(), address);
        node.open_replica(&key);
        directory
            .add_replica(&key, node.id(), ReplicaState::Active)
            .unwrap();
        (directory, node, key)
    }

    #[test]
    fn test_open_replica_idempotent() {
        let (_dir, node, key) = setup();
        let a = node.open_replica(&key);
        let b = node.open_replica(&key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(node.replicas().len(), 1);
    }

    #[test]
    fn test_leader_append_checks_ownership() {
        let (dir, node, key) = setup();
        let op = UpdateOp::Add(Document::new(DocId::from(1)));
        assert!(matches!(
            node.leader_append(&key, op.clone(), 1),
            Err(Error::LeaderLost { .. })
        ));

        let epoch = dir.set_leader(&key, Some(node.id())).unwrap();
        let entry = node.leader_append(&key, op.clone(), epoch).unwrap();
        assert_eq!(entry.seq, 1);
        assert!(node.leader_append(&key, op, epoch + 1).is_err());
    }
}
