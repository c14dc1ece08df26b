//! Replica recovery
//!
//! A replica in RECOVERING state catches up with its shard leader using one
//! of two strategies:
//! - peer-sync: replay the leader's retained updates after the replica's
//!   position, used when the gap is small and the leader still holds it
//! - full replication: install a copy of the leader's committed documents,
//!   then replay whatever the leader accepted since
//!
//! Only one recovery per replica runs at a time. A request that arrives
//! while one is running sets a rerun flag; the running task does another
//! pass instead of starting a second one.

use crate::backoff::Backoff;
use crate::membership::{LeaderInfo, MembershipDirectory, MembershipEvent};
use crate::metrics::ClusterMetrics;
use crate::router::AckTracker;
use crate::transport::NodeTransport;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use docio_common::config::RecoveryConfig;
use docio_common::{
    Error, LogPosition, NodeId, ReplicaEvent, ReplicaKey, ReplicaState, Result, SequenceNumber,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a replica caught up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Already at the leader's position
    UpToDate,
    /// Replayed the leader's retained updates
    PeerSync,
    /// Installed a full copy of the leader's documents
    FullReplication,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up-to-date"),
            Self::PeerSync => write!(f, "peer-sync"),
            Self::FullReplication => write!(f, "full-replication"),
        }
    }
}

/// Result of a finished recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub strategy: RecoveryStrategy,
    /// Entries replayed after the strategy's starting point
    pub replayed: usize,
    /// Replica position when recovery finished
    pub position: LogPosition,
}

type RecoveryKey = (ReplicaKey, NodeId);

pub struct RecoveryManager {
    directory: Arc<MembershipDirectory>,
    transport: Arc<dyn NodeTransport>,
    config: RecoveryConfig,
    leader_wait: Duration,
    metrics: Arc<ClusterMetrics>,
    acks: Arc<AckTracker>,
    /// Running recoveries and their rerun flags
    in_flight: DashMap<RecoveryKey, Arc<AtomicBool>>,
    outcomes: DashMap<RecoveryKey, RecoveryOutcome>,
}

impl RecoveryManager {
    pub fn new(
        directory: Arc<MembershipDirectory>,
        transport: Arc<dyn NodeTransport>,
        config: RecoveryConfig,
        leader_wait: Duration,
        metrics: Arc<ClusterMetrics>,
        acks: Arc<AckTracker>,
    ) -> Self {
        Self {
            directory,
            transport,
            config,
            leader_wait,
            metrics,
            acks,
            in_flight: DashMap::new(),
            outcomes: DashMap::new(),
        }
    }

    /// Start recovering a replica, or ask the running recovery for another pass
    pub fn schedule(self: &Arc<Self>, key: ReplicaKey, node: NodeId) {
        match self.in_flight.entry((key.clone(), node)) {
            Entry::Occupied(running) => {
                debug!("Recovery of {} on {} already running; requesting rerun", key, node);
                running.get().store(true, Ordering::SeqCst);
            }
            Entry::Vacant(slot) => {
                let rerun = Arc::new(AtomicBool::new(false));
                slot.insert(Arc::clone(&rerun));
                let manager = Arc::clone(self);
                tokio::spawn(async move { manager.run(key, node, rerun).await });
            }
        }
    }

    /// Whether a recovery of the replica is running
    #[must_use]
    pub fn is_running(&self, key: &ReplicaKey, node: NodeId) -> bool {
        self.in_flight.contains_key(&(key.clone(), node))
    }

    /// Outcome of the last successful recovery of a replica
    #[must_use]
    pub fn last_outcome(&self, key: &ReplicaKey, node: NodeId) -> Option<RecoveryOutcome> {
        self.outcomes.get(&(key.clone(), node)).map(|o| *o)
    }

    /// Schedule recoveries for replicas entering RECOVERING
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.directory.subscribe();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MembershipEvent::ReplicaStateChanged {
                        key,
                        node,
                        to: ReplicaState::Recovering,
                        ..
                    }) => manager.schedule(key, node),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Recovery watcher missed {} events; rescanning", missed);
                        for replica in manager.directory.replicas_in_state(ReplicaState::Recovering) {
                            manager.schedule(replica.key, replica.node_id);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn run(self: Arc<Self>, key: ReplicaKey, node: NodeId, rerun: Arc<AtomicBool>) {
        let slot = (key.clone(), node);
        loop {
            match self.recover_with_retries(&key, node, &rerun).await {
                Ok(Some(outcome)) => {
                    self.outcomes.insert(slot.clone(), outcome);
                }
                Ok(None) => {}
                Err(e) => debug!("Recovery of {} on {} ended: {}", key, node, e),
            }
            // Leave only if nobody asked for another pass meanwhile
            if self
                .in_flight
                .remove_if(&slot, |_, flag| !flag.swap(false, Ordering::SeqCst))
                .is_some()
            {
                break;
            }
            debug!("Rerunning recovery of {} on {}", key, node);
        }
    }

    /// Recover a replica, backing off between failed attempts
    ///
    /// Returns `Ok(None)` when there is nothing to do: the node died or the
    /// replica already gave up.
    pub async fn recover_with_retries(
        &self,
        key: &ReplicaKey,
        node: NodeId,
        rerun: &AtomicBool,
    ) -> Result<Option<RecoveryOutcome>> {
        let mut backoff = Backoff::from_millis(self.config.initial_backoff_ms, self.config.max_backoff_ms);
        let mut attempts = 0;
        loop {
            if !self.directory.is_live(node) {
                debug!("{} is down; abandoning recovery of {}", node, key);
                return Ok(None);
            }
            let result = match self.directory.replica_state(key, node)? {
                ReplicaState::RecoveryFailed => return Ok(None),
                // Demoted by a failed forward; RecoveryScheduled follows
                ReplicaState::Down => Err(Error::ShardUnavailable(key.clone())),
                ReplicaState::Active | ReplicaState::Recovering => {
                    self.attempt(key, node, rerun).await
                }
            };
            let err = match result {
                Ok(outcome) => return Ok(Some(outcome)),
                Err(e) => e,
            };

            attempts += 1;
            if attempts >= self.config.max_attempts {
                error!(
                    "ALERT: recovery of {} on {} failed after {} attempts: {}",
                    key, node, attempts, err
                );
                if let Err(e) = self
                    .directory
                    .transition_replica(key, node, ReplicaEvent::RecoveryExhausted)
                {
                    warn!("Could not mark {} on {} as failed: {}", key, node, e);
                }
                ClusterMetrics::incr(&self.metrics.recovery_failures);
                return Err(Error::RecoveryFailed {
                    key: key.clone(),
                    node,
                    attempts,
                    reason: err.to_string(),
                });
            }
            let delay = backoff.next_delay();
            warn!(
                "Recovery attempt {} of {} on {} failed: {}; retrying in {:?}",
                attempts, key, node, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One recovery attempt against the current leader
    async fn attempt(
        &self,
        key: &ReplicaKey,
        node: NodeId,
        rerun: &AtomicBool,
    ) -> Result<RecoveryOutcome> {
        let leader = self.directory.get_leader(key, self.leader_wait).await?;
        if leader.node_id == node {
            let position = self.finish(key, node).await?;
            return Ok(RecoveryOutcome {
                strategy: RecoveryStrategy::UpToDate,
                replayed: 0,
                position,
            });
        }

        let mut watch = self.directory.watch_leader(key)?;
        let current = *watch.borrow_and_update();
        let Some(info) = current.filter(|l| l.node == leader.node_id) else {
            return Err(Error::LeaderLost {
                key: key.clone(),
                node: leader.node_id,
            });
        };

        // A leader change mid-recovery invalidates everything fetched so far
        tokio::select! {
            result = self.catch_up(key, node, info, rerun) => result,
            _ = watch.changed() => Err(Error::LeaderLost {
                key: key.clone(),
                node: info.node,
            }),
        }
    }

    async fn catch_up(
        &self,
        key: &ReplicaKey,
        node: NodeId,
        leader: LeaderInfo,
        rerun: &AtomicBool,
    ) -> Result<RecoveryOutcome> {
        self.transport.discard_stale(node, key, leader.epoch).await?;
        let target = self.transport.position(leader.node, key).await?;
        let local = self.transport.position(node, key).await?;

        let diverged = local.seq > target.seq
            || (local.seq > 0
                && self
                    .transport
                    .epoch_at(leader.node, key, local.seq)
                    .await?
                    .is_some_and(|epoch| epoch != local.epoch));
        let gap = target.seq.saturating_sub(local.seq);

        let mut strategy = if diverged || (local.seq == 0 && target.seq > 0) {
            RecoveryStrategy::FullReplication
        } else if gap == 0 {
            RecoveryStrategy::UpToDate
        } else if gap <= self.config.peer_sync_limit {
            RecoveryStrategy::PeerSync
        } else {
            RecoveryStrategy::FullReplication
        };
        debug!(
            "Recovering {} on {} from {}: local {} leader {} diverged={} -> {}",
            key, node, leader.node, local, target, diverged, strategy
        );

        let replayed = match strategy {
            RecoveryStrategy::FullReplication => self.full_replication(key, node, leader.node, rerun).await?,
            _ => match self.replay_from(key, node, leader.node, local.seq, rerun).await {
                Ok(replayed) => replayed,
                Err(Error::LogTruncated { requested, oldest }) => {
                    info!(
                        "Leader of {} no longer holds seq {} (oldest {}); falling back to full replication",
                        key, requested, oldest
                    );
                    strategy = RecoveryStrategy::FullReplication;
                    self.full_replication(key, node, leader.node, rerun).await?
                }
                Err(e) => return Err(e),
            },
        };
        if strategy == RecoveryStrategy::UpToDate && replayed > 0 {
            strategy = RecoveryStrategy::PeerSync;
        }

        let position = self.finish(key, node).await?;
        match strategy {
            RecoveryStrategy::UpToDate => ClusterMetrics::incr(&self.metrics.recoveries_up_to_date),
            RecoveryStrategy::PeerSync => ClusterMetrics::incr(&self.metrics.peer_syncs),
            RecoveryStrategy::FullReplication => {
                ClusterMetrics::incr(&self.metrics.full_replications);
            }
        }
        ClusterMetrics::add(&self.metrics.entries_replayed, replayed as u64);
        info!(
            "Recovered {} on {} via {} ({} replayed, now at {})",
            key, node, strategy, replayed, position
        );
        Ok(RecoveryOutcome {
            strategy,
            replayed,
            position,
        })
    }

    async fn full_replication(
        &self,
        key: &ReplicaKey,
        node: NodeId,
        leader: NodeId,
        rerun: &AtomicBool,
    ) -> Result<usize> {
        let image = self.transport.fetch_image(leader, key).await?;
        let base = image.position.seq;
        let docs = image.docs.len();
        let drained = self.transport.install_image(node, key, image).await?;
        debug!("Installed {} docs of {} at seq {} on {}", docs, key, base, node);
        let cursor = self.transport.position(node, key).await?.seq;
        Ok(drained + self.replay_from(key, node, leader, cursor, rerun).await?)
    }

    /// Replay the leader's updates after `cursor` until the replica reaches
    /// the leader's position, then keep going while the leader advances or a
    /// rerun is requested, up to `max_catch_up_passes` extra passes
    async fn replay_from(
        &self,
        key: &ReplicaKey,
        node: NodeId,
        leader: NodeId,
        mut cursor: SequenceNumber,
        rerun: &AtomicBool,
    ) -> Result<usize> {
        let batch = usize::try_from(self.config.peer_sync_limit.max(1)).unwrap_or(usize::MAX);
        let mut replayed = 0;
        let mut passes = 0;
        loop {
            let target = self.transport.position(leader, key).await?.seq;
            while cursor < target {
                let entries = self
                    .transport
                    .fetch_updates(leader, key, cursor, batch)
                    .await?;
                if entries.is_empty() {
                    break;
                }
                replayed += self.transport.replay(node, key, entries).await?;
                let next = self.transport.position(node, key).await?.seq;
                if next <= cursor {
                    return Err(Error::SequenceGap {
                        expected: cursor + 1,
                        actual: next,
                    });
                }
                cursor = next;
            }

            let again = rerun.swap(false, Ordering::SeqCst)
                || self.transport.position(leader, key).await?.seq > cursor;
            if !again || passes >= self.config.max_catch_up_passes {
                return Ok(replayed);
            }
            passes += 1;
        }
    }

    /// Commit the caught-up replica and return it to ACTIVE
    async fn finish(&self, key: &ReplicaKey, node: NodeId) -> Result<LogPosition> {
        self.transport.commit(node, key).await?;
        let position = self.transport.position(node, key).await?;
        if self.directory.replica_state(key, node)? == ReplicaState::Recovering {
            self.directory
                .transition_replica(key, node, ReplicaEvent::Recovered)?;
        }
        self.acks.record(key, node, position.seq);
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::transport::LocalTransport;
    use docio_common::{CollectionName, Config, DocId, ShardId};
    use docio_store::{Document, Query, UpdateOp};
    use std::net::SocketAddr;

    struct Fixture {
        directory: Arc<MembershipDirectory>,
        transport: Arc<LocalTransport>,
        manager: Arc<RecoveryManager>,
        key: ReplicaKey,
        epoch: u64,
    }

    fn fixture(config: Config) -> Fixture {
        let directory = Arc::new(MembershipDirectory::new(&config.cluster));
        let transport = Arc::new(LocalTransport::new());
        let name = CollectionName::new("collection1").unwrap();
        directory.create_collection(&name, 1, 2).unwrap();
        let key = ReplicaKey::new(name, ShardId::new(1));
        for i in 1..=2 {
            let address = SocketAddr::from(([127, 0, 0, 1], 7100 + i as u16));
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
        let manager = Arc::new(RecoveryManager::new(
            directory.clone(),
            transport.clone(),
            config.recovery.clone(),
            Duration::from_millis(500),
            Arc::new(ClusterMetrics::new()),
            Arc::new(AckTracker::new()),
        ));
        Fixture {
            directory,
            transport,
            manager,
            key,
            epoch,
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.recovery.initial_backoff_ms = 5;
        config.recovery.max_backoff_ms = 20;
        config.recovery.peer_sync_limit = 10;
        config
    }

    /// Write `n` docs at the leader only, starting at id `from`
    fn write_leader(f: &Fixture, from: u64, n: u64) {
        let leader = f.transport.node(NodeId::new(1)).unwrap();
        for i in from..from + n {
            leader
                .leader_append(&f.key, UpdateOp::Add(Document::new(DocId::from(i))), f.epoch)
                .unwrap();
        }
        leader.replica(&f.key).unwrap().store().commit().unwrap();
    }

    /// Write `n` docs at the leader and forward them to node 2
    fn write_both(f: &Fixture, from: u64, n: u64) {
        let leader = f.transport.node(NodeId::new(1)).unwrap();
        let follower = f.transport.node(NodeId::new(2)).unwrap().replica(&f.key).unwrap();
        for i in from..from + n {
            let entry = leader
                .leader_append(&f.key, UpdateOp::Add(Document::new(DocId::from(i))), f.epoch)
                .unwrap();
            follower.deliver(entry).unwrap();
        }
    }

    fn mark_recovering(f: &Fixture) {
        f.directory
            .transition_replica(&f.key, NodeId::new(2), ReplicaEvent::RecoveryScheduled)
            .unwrap();
    }

    fn follower_count(f: &Fixture) -> u64 {
        f.transport
            .node(NodeId::new(2))
            .unwrap()
            .replica(&f.key)
            .unwrap()
            .store()
            .query(&Query::all())
            .num_found
    }

    #[tokio::test]
    async fn test_peer_sync_small_gap() {
        let f = fixture(fast_config());
        write_both(&f, 0, 5);
        write_leader(&f, 5, 4);
        mark_recovering(&f);

        let outcome = f
            .manager
            .recover_with_retries(&f.key, NodeId::new(2), &AtomicBool::new(false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategy::PeerSync);
        assert_eq!(outcome.replayed, 4);
        assert_eq!(outcome.position.seq, 9);
        assert_eq!(follower_count(&f), 9);
        assert_eq!(
            f.directory.replica_state(&f.key, NodeId::new(2)).unwrap(),
            ReplicaState::Active
        );
    }

    #[tokio::test]
    async fn test_large_gap_uses_full_replication() {
        let f = fixture(fast_config());
        write_both(&f, 0, 2);
        write_leader(&f, 2, 30);
        mark_recovering(&f);

        let outcome = f
            .manager
            .recover_with_retries(&f.key, NodeId::new(2), &AtomicBool::new(false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategy::FullReplication);
        assert_eq!(outcome.position.seq, 32);
        assert_eq!(follower_count(&f), 32);
    }

    #[tokio::test]
    async fn test_empty_replica_uses_full_replication() {
        let f = fixture(fast_config());
        write_leader(&f, 0, 3);
        mark_recovering(&f);

        let outcome = f
            .manager
            .recover_with_retries(&f.key, NodeId::new(2), &AtomicBool::new(false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategy::FullReplication);
        assert_eq!(follower_count(&f), 3);
    }

    #[tokio::test]
    async fn test_up_to_date() {
        let f = fixture(fast_config());
        write_both(&f, 0, 3);
        mark_recovering(&f);

        let outcome = f
            .manager
            .recover_with_retries(&f.key, NodeId::new(2), &AtomicBool::new(false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.strategy, RecoveryStrategy::UpToDate);
        assert_eq!(outcome.replayed, 0);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_mark_failed() {
        let mut config = fast_config();
        config.recovery.max_attempts = 3;
        let f = fixture(config);
        write_leader(&f, 0, 3);
        mark_recovering(&f);
        f.transport.partition(NodeId::new(2));
        let mut events = f.directory.subscribe();

        let err = f
            .manager
            .recover_with_retries(&f.key, NodeId::new(2), &AtomicBool::new(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecoveryFailed { attempts: 3, .. }));
        assert_eq!(
            f.directory.replica_state(&f.key, NodeId::new(2)).unwrap(),
            ReplicaState::RecoveryFailed
        );
        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if let MembershipEvent::ReplicaStateChanged { node, from, to, .. } = event {
                if node == NodeId::new(2) && to == ReplicaState::RecoveryFailed {
                    assert_eq!(from, Some(ReplicaState::Recovering));
                    failed = true;
                }
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_exhausted_from_down_marks_failed() {
        let mut config = fast_config();
        config.recovery.max_attempts = 2;
        let f = fixture(config);
        f.directory
            .transition_replica(&f.key, NodeId::new(2), ReplicaEvent::ForwardFailed)
            .unwrap();
        let mut events = f.directory.subscribe();

        let err = f
            .manager
            .recover_with_retries(&f.key, NodeId::new(2), &AtomicBool::new(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecoveryFailed { attempts: 2, .. }));
        assert_eq!(
            events.try_recv().unwrap(),
            MembershipEvent::ReplicaStateChanged {
                key: f.key.clone(),
                node: NodeId::new(2),
                from: Some(ReplicaState::Down),
                to: ReplicaState::RecoveryFailed,
            }
        );
    }

    #[tokio::test]
    async fn test_watcher_schedules_recovery() {
        let f = fixture(fast_config());
        let watcher = f.manager.spawn_watcher();
        write_leader(&f, 0, 4);
        mark_recovering(&f);

        f.directory
            .wait_for_recoveries(&f.key.collection, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(follower_count(&f), 4);

        // The outcome is recorded right after the replica turns ACTIVE
        let mut outcome = None;
        for _ in 0..100 {
            outcome = f.manager.last_outcome(&f.key, NodeId::new(2));
            if outcome.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outcome.unwrap().strategy, RecoveryStrategy::FullReplication);
        watcher.abort();
    }
}
