//! Failure detection and leader election
//!
//! Two signals mark a node lost: an explicit stop and a session that was
//! not renewed in time. Both go through [`FailureDetector::on_node_lost`],
//! which is idempotent. Losing a leader triggers an election among the
//! shard's ACTIVE replicas on live nodes: highest applied sequence wins,
//! ties go to the lowest node id.

use crate::membership::{MembershipDirectory, ShardState};
use crate::metrics::ClusterMetrics;
use crate::node::Node;
use crate::transport::NodeTransport;
use docio_common::config::ClusterConfig;
use docio_common::{
    Error, FailureSignal, NodeId, ReplicaEvent, ReplicaKey, ReplicaState, Result, SessionId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct FailureDetector {
    directory: Arc<MembershipDirectory>,
    transport: Arc<dyn NodeTransport>,
    metrics: Arc<ClusterMetrics>,
    heartbeat_interval: Duration,
}

impl FailureDetector {
    pub fn new(
        directory: Arc<MembershipDirectory>,
        transport: Arc<dyn NodeTransport>,
        metrics: Arc<ClusterMetrics>,
        config: &ClusterConfig,
    ) -> Self {
        Self {
            directory,
            transport,
            metrics,
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    /// Handle a lost node; returns false if it was already dead
    pub async fn on_node_lost(&self, node: NodeId, signal: FailureSignal) -> Result<bool> {
        if !self.directory.mark_dead(node)? {
            debug!("{} already marked dead; ignoring {}", node, signal);
            return Ok(false);
        }
        warn!("Node {} lost: {}", node, signal);
        ClusterMetrics::incr(&self.metrics.nodes_lost);

        for replica in self.directory.shards_hosted_by(node) {
            if let Err(e) = self
                .directory
                .transition_replica(&replica.key, node, ReplicaEvent::NodeLost)
            {
                warn!("Cannot mark {} down: {}", replica, e);
            }
        }

        for key in self.directory.shards_led_by(node) {
            self.elect_leader(&key, false).await?;
        }
        Ok(true)
    }

    /// Handle a node that (re)registered
    ///
    /// Leaderless shards hosted by the node hold an election first; every
    /// hosted replica that did not win one is scheduled for recovery.
    pub async fn on_node_joined(&self, node: NodeId) -> Result<()> {
        info!("Node {} joined", node);
        ClusterMetrics::incr(&self.metrics.nodes_joined);

        for replica in self.directory.shards_hosted_by(node) {
            let key = &replica.key;
            if self.directory.leader_info(key).is_none()
                && self.elect_leader(key, true).await? == Some(node)
            {
                continue;
            }
            if self.directory.leader_info(key).is_some_and(|l| l.node == node) {
                continue;
            }
            match self.directory.replica_state(key, node)? {
                ReplicaState::Recovering => {}
                _ => {
                    self.directory
                        .transition_replica(key, node, ReplicaEvent::RecoveryScheduled)?;
                }
            }
        }
        Ok(())
    }

    /// Elect a leader for `key`
    ///
    /// With `include_inactive`, DOWN and RECOVERING replicas on live nodes
    /// are candidates too (used when a node rejoins a leaderless shard).
    /// Returns the new leader, or `None` if the shard is left leaderless.
    pub async fn elect_leader(
        &self,
        key: &ReplicaKey,
        include_inactive: bool,
    ) -> Result<Option<NodeId>> {
        loop {
            let shard = self.directory.shard(key)?;
            let Some((seq, winner)) = self.pick_candidate(key, &shard, include_inactive).await
            else {
                self.directory.set_leader(key, None)?;
                error!("No eligible leader for {}; shard is leaderless", key);
                return Ok(None);
            };

            if self.directory.replica_state(key, winner)? != ReplicaState::Active {
                self.directory
                    .transition_replica(key, winner, ReplicaEvent::Promoted)?;
            }
            let epoch = match self.directory.set_leader(key, Some(winner)) {
                Ok(epoch) => epoch,
                // Lost between the position query and now
                Err(Error::NodeDown(node)) => {
                    debug!("Candidate {} for {} went down; re-running election", node, key);
                    continue;
                }
                Err(e) => return Err(e),
            };
            ClusterMetrics::incr(&self.metrics.leader_elections);
            info!(
                "Elected {} leader of {} at seq {} (epoch {})",
                winner, key, seq, epoch
            );

            // Followers must sync with the new leader before trusting its stream
            if shard.epoch > 0 && epoch != shard.epoch {
                self.resync_followers(key, &shard, winner);
            }
            return Ok(Some(winner));
        }
    }

    /// Highest applied sequence among eligible replicas; ties keep the lowest id
    async fn pick_candidate(
        &self,
        key: &ReplicaKey,
        shard: &ShardState,
        include_inactive: bool,
    ) -> Option<(u64, NodeId)> {
        let mut best: Option<(u64, NodeId)> = None;
        for (node, state) in &shard.replicas {
            let eligible = match state {
                ReplicaState::Active => true,
                ReplicaState::Down | ReplicaState::Recovering => include_inactive,
                ReplicaState::RecoveryFailed => false,
            };
            if !eligible || !self.directory.is_live(*node) {
                continue;
            }
            let seq = match self.transport.position(*node, key).await {
                Ok(position) => position.seq,
                Err(e) => {
                    debug!("Skipping candidate {} for {}: {}", node, key, e);
                    continue;
                }
            };
            if best.is_none_or(|(best_seq, _)| seq > best_seq) {
                best = Some((seq, *node));
            }
        }
        best
    }

    fn resync_followers(&self, key: &ReplicaKey, shard: &ShardState, leader: NodeId) {
        for (node, state) in &shard.replicas {
            if *node == leader || *state != ReplicaState::Active || !self.directory.is_live(*node) {
                continue;
            }
            if let Err(e) =
                self.directory
                    .transition_replica(key, *node, ReplicaEvent::RecoveryScheduled)
            {
                warn!("Cannot resync {} on {}: {}", key, node, e);
            }
        }
    }

    /// Renew a node's lease; a lost session makes the node re-register and
    /// rejoin. Returns the session to use from now on.
    pub async fn heartbeat(&self, node: &Node, session: SessionId) -> Result<SessionId> {
        match self.directory.renew_session(node.id(), session) {
            Ok(()) => Ok(session),
            Err(Error::SessionExpired(id)) => {
                if !node.is_running() {
                    return Err(Error::NodeDown(id));
                }
                info!("Session of {} expired; re-registering", id);
                self.on_node_lost(id, FailureSignal::SessionExpired).await?;
                let session = self.directory.register_node(id, node.address());
                node.set_session(Some(session));
                self.on_node_joined(id).await?;
                Ok(session)
            }
            Err(e) => Err(e),
        }
    }

    /// Keep a node's lease alive until it stops running
    pub fn spawn_heartbeat(self: &Arc<Self>, node: Arc<Node>, session: SessionId) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut session = session;
            let mut ticker = tokio::time::interval(detector.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !node.is_running() {
                    debug!("Heartbeat of {} stopped", node.id());
                    break;
                }
                match detector.heartbeat(&node, session).await {
                    Ok(next) => session = next,
                    Err(e) => warn!("Heartbeat of {} failed: {}", node.id(), e),
                }
            }
        })
    }

    /// Periodically mark nodes with lapsed leases as lost
    pub fn spawn_lease_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(detector.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                detector.sweep(Instant::now()).await;
            }
        })
    }

    /// Mark every live node whose lease ran out as lost
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired = self.directory.expired_sessions(now);
        let mut lost = 0;
        for node in expired {
            match self.on_node_lost(node, FailureSignal::SessionExpired).await {
                Ok(true) => lost += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to handle lost {}: {}", node, e),
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use docio_common::{CollectionName, Config, DocId, ShardId};
    use docio_store::{Document, UpdateOp};
    use std::net::SocketAddr;

    struct Fixture {
        directory: Arc<MembershipDirectory>,
        transport: Arc<LocalTransport>,
        detector: FailureDetector,
        key: ReplicaKey,
    }

    fn fixture(nodes: u64) -> Fixture {
        let config = Config::default();
        let directory = Arc::new(MembershipDirectory::new(&config.cluster));
        let transport = Arc::new(LocalTransport::new());
        let name = CollectionName::new("collection1").unwrap();
        directory.create_collection(&name, 1, 3).unwrap();
        let key = ReplicaKey::new(name, ShardId::new(1));
        for i in 1..=nodes {
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
        let detector = FailureDetector::new(
            directory.clone(),
            transport.clone(),
            Arc::new(ClusterMetrics::new()),
            &config.cluster,
        );
        Fixture {
            directory,
            transport,
            detector,
            key,
        }
    }

    fn advance(f: &Fixture, node: u64, docs: u64) {
        let replica = f.transport.node(NodeId::new(node)).unwrap().replica(&f.key).unwrap();
        let epoch = replica.position().epoch.max(1);
        for i in 0..docs {
            replica
                .store()
                .append(UpdateOp::Add(Document::new(DocId::from(i))), epoch)
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_initial_election_prefers_lowest_id() {
        let f = fixture(3);
        let leader = f.detector.elect_leader(&f.key, false).await.unwrap();
        assert_eq!(leader, Some(NodeId::new(1)));
    }

    #[tokio::test]
    async fn test_election_prefers_highest_sequence() {
        let f = fixture(3);
        advance(&f, 2, 3);
        advance(&f, 3, 5);
        let leader = f.detector.elect_leader(&f.key, false).await.unwrap();
        assert_eq!(leader, Some(NodeId::new(3)));
    }

    #[tokio::test]
    async fn test_leader_loss_reelects() {
        let f = fixture(3);
        f.detector.elect_leader(&f.key, false).await.unwrap();
        advance(&f, 1, 4);
        advance(&f, 2, 4);
        advance(&f, 3, 4);

        f.transport.node_handle(NodeId::new(1)).unwrap().set_running(false);
        assert!(f.detector.on_node_lost(NodeId::new(1), FailureSignal::Stopped).await.unwrap());
        assert!(!f.detector.on_node_lost(NodeId::new(1), FailureSignal::Stopped).await.unwrap());

        let shard = f.directory.shard(&f.key).unwrap();
        assert_eq!(shard.leader, Some(NodeId::new(2)));
        assert_eq!(shard.replicas[&NodeId::new(1)], ReplicaState::Down);
        // The surviving follower resyncs with the new leader
        assert_eq!(shard.replicas[&NodeId::new(3)], ReplicaState::Recovering);
    }

    #[tokio::test]
    async fn test_leaderless_then_rejoin_promotes() {
        let f = fixture(2);
        f.detector.elect_leader(&f.key, false).await.unwrap();

        for id in [2, 1] {
            f.transport.node_handle(NodeId::new(id)).unwrap().set_running(false);
            f.detector
                .on_node_lost(NodeId::new(id), FailureSignal::Stopped)
                .await
                .unwrap();
        }
        assert_eq!(f.directory.shard(&f.key).unwrap().leader, None);

        let node = f.transport.node_handle(NodeId::new(2)).unwrap();
        node.set_running(true);
        f.directory.register_node(NodeId::new(2), node.address());
        f.detector.on_node_joined(NodeId::new(2)).await.unwrap();

        let shard = f.directory.shard(&f.key).unwrap();
        assert_eq!(shard.leader, Some(NodeId::new(2)));
        assert_eq!(shard.replicas[&NodeId::new(2)], ReplicaState::Active);
    }

    #[tokio::test]
    async fn test_rejoin_schedules_recovery() {
        let f = fixture(2);
        f.detector.elect_leader(&f.key, false).await.unwrap();
        f.transport.node_handle(NodeId::new(2)).unwrap().set_running(false);
        f.detector.on_node_lost(NodeId::new(2), FailureSignal::Stopped).await.unwrap();

        f.transport.node_handle(NodeId::new(2)).unwrap().set_running(true);
        f.directory.register_node(NodeId::new(2), SocketAddr::from(([127, 0, 0, 1], 7000)));
        f.detector.on_node_joined(NodeId::new(2)).await.unwrap();
        assert_eq!(
            f.directory.replica_state(&f.key, NodeId::new(2)).unwrap(),
            ReplicaState::Recovering
        );
    }

    #[tokio::test]
    async fn test_sweep_expired_sessions() {
        let f = fixture(2);
        f.detector.elect_leader(&f.key, false).await.unwrap();
        f.directory.expire_session(NodeId::new(2)).unwrap();
        assert_eq!(f.detector.sweep(Instant::now()).await, 1);
        assert!(!f.directory.is_live(NodeId::new(2)));
        assert_eq!(f.detector.sweep(Instant::now()).await, 0);
    }
}
