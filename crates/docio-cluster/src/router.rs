//! Write routing and fan-out
//!
//! A write is validated, mapped to its shard by document id, appended at the
//! shard leader and acknowledged. Forwarding to the other replicas runs
//! concurrently in a background task: a failed forward never fails the
//! client write, it marks the replica DOWN and reschedules its recovery.

use crate::backoff::Backoff;
use crate::membership::{LeaderInfo, MembershipDirectory, MembershipEvent};
use crate::metrics::ClusterMetrics;
use crate::placement;
use crate::transport::NodeTransport;
use dashmap::DashMap;
use docio_common::config::RouterConfig;
use docio_common::{
    CollectionName, Error, NodeId, ReplicaEvent, ReplicaKey, Result, SequenceNumber,
};
use docio_store::{UpdateLogEntry, UpdateOp};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Acknowledgement of a routed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub key: ReplicaKey,
    pub seq: SequenceNumber,
    pub epoch: u64,
    pub leader: NodeId,
}

/// Highest sequence number each replica is known to have applied
#[derive(Debug, Default)]
pub struct AckTracker {
    acks: DashMap<(ReplicaKey, NodeId), SequenceNumber>,
}

impl AckTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &ReplicaKey, node: NodeId, seq: SequenceNumber) {
        self.acks
            .entry((key.clone(), node))
            .and_modify(|acked| *acked = (*acked).max(seq))
            .or_insert(seq);
    }

    #[must_use]
    pub fn get(&self, key: &ReplicaKey, node: NodeId) -> Option<SequenceNumber> {
        self.acks.get(&(key.clone(), node)).map(|a| *a)
    }

    /// Lowest acknowledgement among `nodes`; `None` if any never acked
    #[must_use]
    pub fn low_water(&self, key: &ReplicaKey, nodes: &[NodeId]) -> Option<SequenceNumber> {
        nodes
            .iter()
            .map(|node| self.get(key, *node))
            .try_fold(SequenceNumber::MAX, |low, ack| ack.map(|a| low.min(a)))
    }
}

/// Count of fan-out tasks still running
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn begin(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct WriteRouter {
    directory: Arc<MembershipDirectory>,
    transport: Arc<dyn NodeTransport>,
    config: RouterConfig,
    metrics: Arc<ClusterMetrics>,
    acks: Arc<AckTracker>,
    leader_cache: DashMap<ReplicaKey, LeaderInfo>,
    in_flight: Arc<InFlight>,
}

impl WriteRouter {
    pub fn new(
        directory: Arc<MembershipDirectory>,
        transport: Arc<dyn NodeTransport>,
        config: RouterConfig,
        metrics: Arc<ClusterMetrics>,
        acks: Arc<AckTracker>,
    ) -> Self {
        Self {
            directory,
            transport,
            config,
            metrics,
            acks,
            leader_cache: DashMap::new(),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Drop cached leaders when the directory reports a change
    pub fn spawn_cache_invalidator(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.directory.subscribe();
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MembershipEvent::LeaderChanged { key, .. }) => {
                        router.leader_cache.remove(&key);
                    }
                    Ok(MembershipEvent::NodeLost { node }) => {
                        router.leader_cache.retain(|_, leader| leader.node != node);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Leader cache missed {} events; clearing", missed);
                        router.leader_cache.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Shard of a document in a collection
    pub fn shard_key(&self, collection: &CollectionName, op: &UpdateOp) -> Result<ReplicaKey> {
        let shard_count = self.directory.shard_count(collection)?;
        Ok(ReplicaKey::new(
            collection.clone(),
            placement::shard_for(op.doc_id(), shard_count),
        ))
    }

    /// Route one write to its shard leader
    pub async fn route(&self, collection: &CollectionName, op: UpdateOp) -> Result<WriteAck> {
        let result = self.route_inner(collection, op).await;
        match &result {
            Ok(_) => ClusterMetrics::incr(&self.metrics.writes_routed),
            Err(_) => ClusterMetrics::incr(&self.metrics.writes_failed),
        }
        result
    }

    async fn route_inner(&self, collection: &CollectionName, op: UpdateOp) -> Result<WriteAck> {
        op.validate()?;
        let key = self.shard_key(collection, &op)?;
        if self.directory.live_replicas(&key)?.is_empty() {
            return Err(Error::ShardUnavailable(key));
        }

        let deadline = Instant::now() + self.config.leader_retry_timeout();
        let mut backoff = Backoff::from_millis(self.config.initial_backoff_ms, self.config.max_backoff_ms);
        loop {
            match self.try_route(&key, &op, deadline).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && Instant::now() < deadline => {
                    debug!("Write to {} failed ({}); retrying", key, e);
                    self.leader_cache.remove(&key);
                    if self.directory.live_replicas(&key)?.is_empty() {
                        return Err(Error::ShardUnavailable(key));
                    }
                    backoff.wait_until(deadline).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn resolve_leader(&self, key: &ReplicaKey, deadline: Instant) -> Result<LeaderInfo> {
        if let Some(leader) = self.leader_cache.get(key) {
            return Ok(*leader);
        }
        let wait = deadline.saturating_duration_since(Instant::now());
        let leader = self.directory.get_leader(key, wait).await?;
        let info = self
            .directory
            .leader_info(key)
            .filter(|l| l.node == leader.node_id)
            .ok_or_else(|| Error::LeaderLost {
                key: key.clone(),
                node: leader.node_id,
            })?;
        self.leader_cache.insert(key.clone(), info);
        Ok(info)
    }

    async fn try_route(&self, key: &ReplicaKey, op: &UpdateOp, deadline: Instant) -> Result<WriteAck> {
        let leader = self.resolve_leader(key, deadline).await?;
        let entry = match self
            .transport
            .leader_append(leader.node, key, op.clone(), leader.epoch)
            .await
        {
            Ok(entry) => entry,
            Err(Error::NodeDown(node)) => {
                return Err(Error::LeaderLost {
                    key: key.clone(),
                    node,
                });
            }
            Err(e) => return Err(e),
        };

        self.acks.record(key, leader.node, entry.seq);
        let ack = WriteAck {
            key: key.clone(),
            seq: entry.seq,
            epoch: entry.epoch,
            leader: leader.node,
        };
        self.fan_out(key.clone(), leader.node, entry);
        Ok(ack)
    }

    /// Forward an entry to every other replica that receives writes
    fn fan_out(&self, key: ReplicaKey, leader: NodeId, entry: UpdateLogEntry) {
        let replicas = match self.directory.replicas(&key) {
            Ok(replicas) => replicas,
            Err(e) => {
                error!("Cannot fan out {} seq {}: {}", key, entry.seq, e);
                return;
            }
        };
        let followers: Vec<NodeId> = replicas
            .iter()
            .filter(|r| r.node_id != leader)
            .map(|r| r.node_id)
            .collect();
        let targets: Vec<NodeId> = replicas
            .iter()
            .filter(|r| {
                r.node_id != leader && r.state.receives_writes() && self.directory.is_live(r.node_id)
            })
            .map(|r| r.node_id)
            .collect();
        if targets.is_empty() {
            return;
        }

        let guard = InFlightGuard::begin(&self.in_flight);
        let directory = Arc::clone(&self.directory);
        let transport = Arc::clone(&self.transport);
        let metrics = Arc::clone(&self.metrics);
        let acks = Arc::clone(&self.acks);
        let timeout = self.config.forward_timeout();

        tokio::spawn(async move {
            let _guard = guard;
            let forwards = targets.into_iter().map(|node| {
                let transport = Arc::clone(&transport);
                let key = key.clone();
                let entry = entry.clone();
                async move {
                    let result = tokio::time::timeout(timeout, transport.deliver(node, &key, entry))
                        .await
                        .unwrap_or(Err(Error::Timeout));
                    (node, result)
                }
            });

            for (node, result) in join_all(forwards).await {
                ClusterMetrics::incr(&metrics.forwards_total);
                match result {
                    Ok(outcome) if outcome.is_applied() => acks.record(&key, node, entry.seq),
                    Ok(_) => {}
                    Err(e) => {
                        ClusterMetrics::incr(&metrics.forward_failures);
                        forward_failed(&directory, &key, node, entry.seq, &e);
                    }
                }
            }

            // Retain the leader log back to the slowest replica
            if let Some(low) = acks.low_water(&key, &followers)
                && low > 0
                && let Err(e) = transport.prune_log(leader, &key, low).await
            {
                debug!("Pruning {} on {} failed: {}", key, leader, e);
            }
        });
    }

    /// Wait for background fan-out to finish
    pub async fn quiesce(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Make every write to the collection visible to queries
    ///
    /// Leader failures fail the commit; replica failures are logged and left
    /// to recovery.
    pub async fn commit(&self, collection: &CollectionName) -> Result<()> {
        let budget = self.config.forward_timeout() * 2;
        if tokio::time::timeout(budget, self.quiesce()).await.is_err() {
            warn!("Fan-out did not quiesce within {:?}; committing anyway", budget);
        }

        for key in self.directory.shard_keys(collection)? {
            let leader = self.directory.leader_info(&key).map(|l| l.node);
            for replica in self.directory.replicas(&key)? {
                let node = replica.node_id;
                if !self.directory.is_live(node) || !replica.state.receives_writes() {
                    continue;
                }
                match self.transport.commit(node, &key).await {
                    Ok(()) => {}
                    Err(e) if Some(node) == leader => return Err(e),
                    Err(e) => warn!("Commit of {} on {} failed: {}", key, node, e),
                }
            }
        }
        debug!("Committed {}", collection);
        Ok(())
    }

    /// Forwards started but not finished
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }
}

/// Demote a replica that missed a live write and queue its recovery
fn forward_failed(
    directory: &MembershipDirectory,
    key: &ReplicaKey,
    node: NodeId,
    seq: SequenceNumber,
    err: &Error,
) {
    warn!("Forward of {} seq {} to {} failed: {}", key, seq, node, err);
    if let Err(e) = directory.transition_replica(key, node, ReplicaEvent::ForwardFailed) {
        debug!("Replica {} on {} not demoted: {}", key, node, e);
        return;
    }
    if directory.is_live(node) {
        match directory.transition_replica(key, node, ReplicaEvent::RecoveryScheduled) {
            Ok(_) => info!("Scheduled recovery of {} on {}", key, node),
            Err(e) => warn!("Cannot schedule recovery of {} on {}: {}", key, node, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ReplicaKey {
        ReplicaKey::new(CollectionName::new_unchecked("c"), docio_common::ShardId::new(1))
    }

    #[test]
    fn test_ack_tracker_low_water() {
        let acks = AckTracker::new();
        let nodes = [NodeId::new(2), NodeId::new(3)];
        assert_eq!(acks.low_water(&key(), &nodes), None);

        acks.record(&key(), NodeId::new(2), 10);
        assert_eq!(acks.low_water(&key(), &nodes), None);
        acks.record(&key(), NodeId::new(3), 7);
        assert_eq!(acks.low_water(&key(), &nodes), Some(7));

        // Acks never move backwards
        acks.record(&key(), NodeId::new(3), 5);
        assert_eq!(acks.get(&key(), NodeId::new(3)), Some(7));
        assert_eq!(acks.low_water(&key(), &[]), Some(SequenceNumber::MAX));
    }

    #[tokio::test]
    async fn test_in_flight_guard() {
        let in_flight = Arc::new(InFlight::default());
        let guard = InFlightGuard::begin(&in_flight);
        assert_eq!(in_flight.count.load(Ordering::SeqCst), 1);
        drop(guard);
        assert_eq!(in_flight.count.load(Ordering::SeqCst), 0);
    }
}
