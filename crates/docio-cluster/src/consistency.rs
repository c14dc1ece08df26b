//! Shard consistency checks
//!
//! Every serving replica on a live node must hold the same committed
//! documents as its shard leader. Replicas compare by document count and
//! content digest; non-serving replicas are reported but never counted as
//! mismatches.

use crate::membership::MembershipDirectory;
use crate::transport::{NodeTransport, ReplicaStats};
use docio_common::{CollectionName, Error, NodeId, ReplicaKey, ReplicaState, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Interval between polls while waiting for a shard to converge
const VERIFY_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ReplicaReport {
    pub node: NodeId,
    pub state: ReplicaState,
    pub live: bool,
    /// `None` when the replica could not be reached
    pub stats: Option<ReplicaStats>,
    /// `None` for replicas that are not compared
    pub matches: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ConsistencyReport {
    pub key: ReplicaKey,
    pub leader: Option<NodeId>,
    pub leader_stats: Option<ReplicaStats>,
    pub replicas: Vec<ReplicaReport>,
    pub mismatches: Vec<String>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Replicas whose contents were compared to the leader
    #[must_use]
    pub fn compared(&self) -> usize {
        self.replicas.iter().filter(|r| r.matches.is_some()).count()
    }
}

pub struct ConsistencyChecker {
    directory: Arc<MembershipDirectory>,
    transport: Arc<dyn NodeTransport>,
}

impl ConsistencyChecker {
    pub fn new(directory: Arc<MembershipDirectory>, transport: Arc<dyn NodeTransport>) -> Self {
        Self {
            directory,
            transport,
        }
    }

    /// Compare every serving replica of a shard with its leader
    pub async fn check_shard(&self, key: &ReplicaKey) -> Result<ConsistencyReport> {
        let shard = self.directory.shard(key)?;
        let mut report = ConsistencyReport {
            key: key.clone(),
            leader: shard.leader,
            leader_stats: None,
            replicas: Vec::with_capacity(shard.replicas.len()),
            mismatches: Vec::new(),
        };

        let Some(leader) = shard.leader else {
            report.mismatches.push(format!("{key} has no leader"));
            return Ok(report);
        };
        let leader_stats = match self.transport.stats(leader, key).await {
            Ok(stats) => stats,
            Err(e) => {
                report
                    .mismatches
                    .push(format!("leader {leader} of {key} unreachable: {e}"));
                return Ok(report);
            }
        };

        for (node, state) in shard.replicas {
            let live = self.directory.is_live(node);
            let stats = if live {
                self.transport.stats(node, key).await.ok()
            } else {
                None
            };
            let compared = node != leader && live && state.is_serving();
            let matches = if compared {
                let ok = stats.as_ref().is_some_and(|s| {
                    s.doc_count == leader_stats.doc_count && s.digest == leader_stats.digest
                });
                if !ok {
                    report.mismatches.push(describe(node, stats.as_ref(), &leader_stats));
                }
                Some(ok)
            } else {
                None
            };
            report.replicas.push(ReplicaReport {
                node,
                state,
                live,
                stats,
                matches,
            });
        }
        report.leader_stats = Some(leader_stats);

        if report.is_consistent() {
            debug!("{} consistent across {} replicas", key, report.compared() + 1);
        } else {
            warn!("{} inconsistent: {:?}", key, report.mismatches);
        }
        Ok(report)
    }

    /// Check every shard of a collection
    pub async fn check_collection(&self, name: &CollectionName) -> Result<Vec<ConsistencyReport>> {
        let mut reports = Vec::new();
        for key in self.directory.shard_keys(name)? {
            reports.push(self.check_shard(&key).await?);
        }
        Ok(reports)
    }

    /// Wait up to `within` for a shard to become consistent
    ///
    /// Fails with `ConsistencyFault` listing the last mismatches.
    pub async fn verify_shard(&self, key: &ReplicaKey, within: Duration) -> Result<ConsistencyReport> {
        let deadline = Instant::now() + within;
        loop {
            let report = self.check_shard(key).await?;
            if report.is_consistent() {
                return Ok(report);
            }
            if Instant::now() >= deadline {
                return Err(Error::ConsistencyFault {
                    key: key.clone(),
                    details: report.mismatches.join("; "),
                });
            }
            tokio::time::sleep(VERIFY_POLL).await;
        }
    }
}

fn describe(node: NodeId, stats: Option<&ReplicaStats>, leader: &ReplicaStats) -> String {
    match stats {
        None => format!("{node} unreachable"),
        Some(s) => format!(
            "{} has {} docs at {} (digest {}), leader {} has {} docs at {} (digest {})",
            node,
            s.doc_count,
            s.position,
            s.digest,
            leader.node,
            leader.doc_count,
            leader.position,
            leader.digest
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::transport::LocalTransport;
    use docio_common::{Config, DocId, ShardId};
    use docio_store::{Document, UpdateOp};
    use std::net::SocketAddr;

    fn setup() -> (Arc<MembershipDirectory>, Arc<LocalTransport>, ReplicaKey, u64) {
        let config = Config::default();
        let directory = Arc::new(MembershipDirectory::new(&config.cluster));
        let transport = Arc::new(LocalTransport::new());
        let name = CollectionName::new("c").unwrap();
        directory.create_collection(&name, 1, 2).unwrap();
        let key = ReplicaKey::new(name, ShardId::new(1));
        for i in 1..=2u64 {
            let address = SocketAddr::from(([127, 0, 0, 1], 7000));
            let node = Arc::new(Node::new(NodeId::new(i), address, directory.clone(), &config));
            node.open_replica(&key);
            node.set_running(true);
            transport.register(node);
            directory.register_node(NodeId::new(i), address);
            directory
                .add_replica(&key, NodeId::new(i), ReplicaState::Active)
                .unwrap();
        }
        let epoch = directory.set_leader(&key, Some(NodeId::new(1))).unwrap();
        (directory, transport, key, epoch)
    }

    fn write(transport: &LocalTransport, key: &ReplicaKey, epoch: u64, id: u64, forward: bool) {
        let leader = transport.node(NodeId::new(1)).unwrap();
        let entry = leader
            .leader_append(key, UpdateOp::Add(Document::new(DocId::from(id))), epoch)
            .unwrap();
        leader.replica(key).unwrap().store().commit().unwrap();
        if forward {
            let follower = transport.node(NodeId::new(2)).unwrap().replica(key).unwrap();
            follower.deliver(entry).unwrap();
            follower.store().commit().unwrap();
        }
    }

    #[tokio::test]
    async fn test_consistent_shard() {
        let (directory, transport, key, epoch) = setup();
        write(&transport, &key, epoch, 1, true);
        let checker = ConsistencyChecker::new(directory, transport);
        let report = checker.check_shard(&key).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.compared(), 1);
        assert_eq!(report.leader_stats.unwrap().doc_count, 1);
    }

    #[tokio::test]
    async fn test_mismatch_reported() {
        let (directory, transport, key, epoch) = setup();
        write(&transport, &key, epoch, 1, true);
        write(&transport, &key, epoch, 2, false);
        let checker = ConsistencyChecker::new(directory, transport);
        let report = checker.check_shard(&key).await.unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.mismatches.len(), 1);

        let err = checker
            .verify_shard(&key, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConsistencyFault { .. }));
    }

    #[tokio::test]
    async fn test_non_serving_replicas_skipped() {
        let (directory, transport, key, epoch) = setup();
        write(&transport, &key, epoch, 1, false);
        directory
            .set_replica_state(&key, NodeId::new(2), ReplicaState::Recovering)
            .unwrap();
        let checker = ConsistencyChecker::new(directory, transport);
        let report = checker.check_shard(&key).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.compared(), 0);
    }
}
