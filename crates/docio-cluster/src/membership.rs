//! Membership directory
//!
//! The authoritative record of which nodes are live, which collections
//! exist, where every replica lives, what state it is in and which replica
//! leads each shard.
//!
//! State sits behind a single `RwLock` that is never held across an await.
//! Changes are published two ways:
//! - a per-shard `watch` channel carrying the current leader, so holders of
//!   a leader handle see a change promptly
//! - a `broadcast` bus of [`MembershipEvent`]s consumed by the router and
//!   the recovery manager

use crate::lease::Lease;
use docio_common::config::ClusterConfig;
use docio_common::{
    CollectionName, Error, NodeId, ReplicaEvent, ReplicaKey, ReplicaRef, ReplicaState, Result,
    SessionId, ShardId,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the event bus
const EVENT_CAPACITY: usize = 1024;

/// A registered node
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: SocketAddr,
    pub live: bool,
    pub lease: Lease,
}

impl NodeInfo {
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.lease.session()
    }
}

/// Current leader of a shard
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaderInfo {
    pub node: NodeId,
    pub epoch: u64,
}

/// One shard of a collection
#[derive(Clone, Debug, Default)]
pub struct ShardState {
    pub replicas: BTreeMap<NodeId, ReplicaState>,
    pub leader: Option<NodeId>,
    /// Bumped on every leader change
    pub epoch: u64,
}

/// A collection and its shards
#[derive(Clone, Debug)]
pub struct CollectionState {
    pub name: CollectionName,
    pub shard_count: u32,
    pub replication_factor: u32,
    pub shards: BTreeMap<ShardId, ShardState>,
}

/// Change notifications published by the directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeRegistered {
        node: NodeId,
        session: SessionId,
    },
    NodeLost {
        node: NodeId,
    },
    LeaderChanged {
        key: ReplicaKey,
        leader: Option<NodeId>,
        epoch: u64,
    },
    ReplicaStateChanged {
        key: ReplicaKey,
        node: NodeId,
        /// `None` when the replica was just added
        from: Option<ReplicaState>,
        to: ReplicaState,
    },
}

#[derive(Default)]
struct DirectoryState {
    nodes: HashMap<NodeId, NodeInfo>,
    collections: HashMap<CollectionName, CollectionState>,
}

impl DirectoryState {
    fn shard(&self, key: &ReplicaKey) -> Result<&ShardState> {
        self.collections
            .get(&key.collection)
            .ok_or_else(|| Error::CollectionNotFound(key.collection.to_string()))?
            .shards
            .get(&key.shard)
            .ok_or_else(|| Error::invalid_argument(format!("no shard {key}")))
    }

    fn shard_mut(&mut self, key: &ReplicaKey) -> Result<&mut ShardState> {
        self.collections
            .get_mut(&key.collection)
            .ok_or_else(|| Error::CollectionNotFound(key.collection.to_string()))?
            .shards
            .get_mut(&key.shard)
            .ok_or_else(|| Error::invalid_argument(format!("no shard {key}")))
    }

    fn is_live(&self, node: NodeId) -> bool {
        self.nodes.get(&node).is_some_and(|n| n.live)
    }
}

pub struct MembershipDirectory {
    state: RwLock<DirectoryState>,
    leaders: RwLock<HashMap<ReplicaKey, watch::Sender<Option<LeaderInfo>>>>,
    events: broadcast::Sender<MembershipEvent>,
    /// Woken on every replica state or liveness change
    changes: Notify,
    session_ttl: Duration,
}

impl MembershipDirectory {
    #[must_use]
    pub fn new(config: &ClusterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(DirectoryState::default()),
            leaders: RwLock::new(HashMap::new()),
            events,
            changes: Notify::new(),
            session_ttl: config.session_ttl(),
        }
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<MembershipEvent>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        self.changes.notify_waiters();
    }

    // ---- Nodes and sessions ----

    /// Register (or re-register) a node, issuing a new session
    pub fn register_node(&self, id: NodeId, address: SocketAddr) -> SessionId {
        let session = SessionId::new();
        {
            let mut state = self.state.write();
            state.nodes.insert(
                id,
                NodeInfo {
                    id,
                    address,
                    live: true,
                    lease: Lease::grant(session, self.session_ttl),
                },
            );
        }
        info!("Registered {} at {} (session {})", id, address, session);
        self.publish(vec![MembershipEvent::NodeRegistered { node: id, session }]);
        session
    }

    /// Mark a node dead; returns false if it already was
    pub fn mark_dead(&self, id: NodeId) -> Result<bool> {
        {
            let mut state = self.state.write();
            let node = state.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
            if !node.live {
                return Ok(false);
            }
            node.live = false;
            node.lease.revoke();
        }
        self.publish(vec![MembershipEvent::NodeLost { node: id }]);
        Ok(true)
    }

    /// Remove a dead node and all of its replicas
    pub fn decommission_node(&self, id: NodeId) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            let node = state.nodes.get(&id).ok_or(Error::NodeNotFound(id))?;
            if node.live {
                return Err(Error::invalid_argument(format!(
                    "cannot decommission live node {id}"
                )));
            }
            state.nodes.remove(&id);
            for collection in state.collections.values_mut() {
                for (shard_id, shard) in &mut collection.shards {
                    if shard.replicas.remove(&id).is_some() && shard.leader == Some(id) {
                        shard.leader = None;
                        shard.epoch += 1;
                        let key = ReplicaKey::new(collection.name.clone(), *shard_id);
                        self.send_leader(&key, None, shard.epoch);
                        events.push(MembershipEvent::LeaderChanged {
                            key,
                            leader: None,
                            epoch: shard.epoch,
                        });
                    }
                }
            }
        }
        info!("Decommissioned {}", id);
        self.publish(events);
        Ok(())
    }

    /// Renew a node's lease
    ///
    /// Fails with `SessionExpired` if the node is dead, the session is stale
    /// or the lease already ran out.
    pub fn renew_session(&self, id: NodeId, session: SessionId) -> Result<()> {
        let mut state = self.state.write();
        let node = state.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        if !node.live
            || node.session() != session
            || node.lease.is_expired(Instant::now())
            || !node.lease.renew(self.session_ttl)
        {
            return Err(Error::SessionExpired(id));
        }
        Ok(())
    }

    /// Revoke a node's lease; the node stays registered until the failure
    /// detector acts on it
    pub fn expire_session(&self, id: NodeId) -> Result<()> {
        let mut state = self.state.write();
        let node = state.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        node.lease.revoke();
        warn!("Expired session {} of {}", node.session(), id);
        Ok(())
    }

    /// Live nodes whose lease ran out
    #[must_use]
    pub fn expired_sessions(&self, now: Instant) -> Vec<NodeId> {
        let state = self.state.read();
        let mut expired: Vec<NodeId> = state
            .nodes
            .values()
            .filter(|n| n.live && n.lease.is_expired(now))
            .map(|n| n.id)
            .collect();
        expired.sort();
        expired
    }

    #[must_use]
    pub fn is_live(&self, id: NodeId) -> bool {
        self.state.read().is_live(id)
    }

    #[must_use]
    pub fn live_nodes(&self) -> Vec<NodeId> {
        let state = self.state.read();
        let mut nodes: Vec<NodeId> = state
            .nodes
            .values()
            .filter(|n| n.live)
            .map(|n| n.id)
            .collect();
        nodes.sort();
        nodes
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<NodeInfo> {
        self.state.read().nodes.get(&id).cloned()
    }

    // ---- Collections and replicas ----

    pub fn create_collection(
        &self,
        name: &CollectionName,
        shard_count: u32,
        replication_factor: u32,
    ) -> Result<()> {
        if shard_count == 0 || replication_factor == 0 {
            return Err(Error::invalid_argument(
                "shard count and replication factor must be positive",
            ));
        }
        let mut state = self.state.write();
        if state.collections.contains_key(name) {
            return Err(Error::CollectionAlreadyExists(name.to_string()));
        }
        let shards: BTreeMap<ShardId, ShardState> = (0..shard_count)
            .map(|i| (ShardId::from_index(i), ShardState::default()))
            .collect();
        let mut leaders = self.leaders.write();
        for shard in shards.keys() {
            let (tx, _) = watch::channel(None);
            leaders.insert(ReplicaKey::new(name.clone(), *shard), tx);
        }
        state.collections.insert(
            name.clone(),
            CollectionState {
                name: name.clone(),
                shard_count,
                replication_factor,
                shards,
            },
        );
        info!(
            "Created collection {} with {} shards x {} replicas",
            name, shard_count, replication_factor
        );
        Ok(())
    }

    pub fn collection(&self, name: &CollectionName) -> Result<CollectionState> {
        self.state
            .read()
            .collections
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    #[must_use]
    pub fn collections(&self) -> Vec<CollectionName> {
        let mut names: Vec<CollectionName> =
            self.state.read().collections.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn shard_count(&self, name: &CollectionName) -> Result<u32> {
        self.state
            .read()
            .collections
            .get(name)
            .map(|c| c.shard_count)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Shard keys of a collection in shard order
    pub fn shard_keys(&self, name: &CollectionName) -> Result<Vec<ReplicaKey>> {
        let state = self.state.read();
        let collection = state
            .collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))?;
        Ok(collection
            .shards
            .keys()
            .map(|shard| ReplicaKey::new(name.clone(), *shard))
            .collect())
    }

    pub fn shard(&self, key: &ReplicaKey) -> Result<ShardState> {
        self.state.read().shard(key).cloned()
    }

    /// Place a replica of `key` on `node`
    pub fn add_replica(&self, key: &ReplicaKey, node: NodeId, initial: ReplicaState) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.nodes.contains_key(&node) {
                return Err(Error::NodeNotFound(node));
            }
            let shard = state.shard_mut(key)?;
            if shard.replicas.contains_key(&node) {
                return Err(Error::invalid_argument(format!(
                    "{node} already hosts a replica of {key}"
                )));
            }
            shard.replicas.insert(node, initial);
        }
        debug!("Added replica {} on {} ({})", key, node, initial);
        self.publish(vec![MembershipEvent::ReplicaStateChanged {
            key: key.clone(),
            node,
            from: None,
            to: initial,
        }]);
        Ok(())
    }

    pub fn replica_state(&self, key: &ReplicaKey, node: NodeId) -> Result<ReplicaState> {
        self.state
            .read()
            .shard(key)?
            .replicas
            .get(&node)
            .copied()
            .ok_or_else(|| Error::ReplicaNotFound {
                key: key.clone(),
                node,
            })
    }

    /// Drive a replica through its state machine
    pub fn transition_replica(
        &self,
        key: &ReplicaKey,
        node: NodeId,
        event: ReplicaEvent,
    ) -> Result<ReplicaState> {
        let (from, to) = {
            let mut state = self.state.write();
            let shard = state.shard_mut(key)?;
            let current = shard
                .replicas
                .get_mut(&node)
                .ok_or_else(|| Error::ReplicaNotFound {
                    key: key.clone(),
                    node,
                })?;
            let from = *current;
            let to = from.next(event).ok_or_else(|| Error::InvalidTransition {
                key: key.clone(),
                node,
                from,
                event,
            })?;
            *current = to;
            (from, to)
        };
        if from != to {
            debug!("Replica {} on {}: {} -> {} ({})", key, node, from, to, event);
            self.publish(vec![MembershipEvent::ReplicaStateChanged {
                key: key.clone(),
                node,
                from: Some(from),
                to,
            }]);
        }
        Ok(to)
    }

    /// Force a replica state, bypassing the state machine
    pub fn set_replica_state(&self, key: &ReplicaKey, node: NodeId, to: ReplicaState) -> Result<()> {
        let from = {
            let mut state = self.state.write();
            let shard = state.shard_mut(key)?;
            let current = shard
                .replicas
                .get_mut(&node)
                .ok_or_else(|| Error::ReplicaNotFound {
                    key: key.clone(),
                    node,
                })?;
            std::mem::replace(current, to)
        };
        if from != to {
            self.publish(vec![MembershipEvent::ReplicaStateChanged {
                key: key.clone(),
                node,
                from: Some(from),
                to,
            }]);
        }
        Ok(())
    }

    pub fn replicas(&self, key: &ReplicaKey) -> Result<Vec<ReplicaRef>> {
        let state = self.state.read();
        Ok(state
            .shard(key)?
            .replicas
            .iter()
            .map(|(node, s)| ReplicaRef {
                node_id: *node,
                key: key.clone(),
                state: *s,
            })
            .collect())
    }

    /// Replicas on live nodes that have not given up recovering
    pub fn live_replicas(&self, key: &ReplicaKey) -> Result<Vec<ReplicaRef>> {
        let state = self.state.read();
        Ok(state
            .shard(key)?
            .replicas
            .iter()
            .filter(|(node, s)| state.is_live(**node) && **s != ReplicaState::RecoveryFailed)
            .map(|(node, s)| ReplicaRef {
                node_id: *node,
                key: key.clone(),
                state: *s,
            })
            .collect())
    }

    /// Every replica hosted by `node`
    #[must_use]
    pub fn shards_hosted_by(&self, node: NodeId) -> Vec<ReplicaRef> {
        let state = self.state.read();
        let mut hosted = Vec::new();
        for collection in state.collections.values() {
            for (shard_id, shard) in &collection.shards {
                if let Some(s) = shard.replicas.get(&node) {
                    hosted.push(ReplicaRef {
                        node_id: node,
                        key: ReplicaKey::new(collection.name.clone(), *shard_id),
                        state: *s,
                    });
                }
            }
        }
        hosted.sort_by(|a, b| a.key.cmp(&b.key));
        hosted
    }

    /// Shards currently led by `node`
    #[must_use]
    pub fn shards_led_by(&self, node: NodeId) -> Vec<ReplicaKey> {
        let state = self.state.read();
        let mut led = Vec::new();
        for collection in state.collections.values() {
            for (shard_id, shard) in &collection.shards {
                if shard.leader == Some(node) {
                    led.push(ReplicaKey::new(collection.name.clone(), *shard_id));
                }
            }
        }
        led.sort();
        led
    }

    #[must_use]
    pub fn replicas_in_state(&self, wanted: ReplicaState) -> Vec<ReplicaRef> {
        let state = self.state.read();
        let mut found = Vec::new();
        for collection in state.collections.values() {
            for (shard_id, shard) in &collection.shards {
                for (node, s) in &shard.replicas {
                    if *s == wanted {
                        found.push(ReplicaRef {
                            node_id: *node,
                            key: ReplicaKey::new(collection.name.clone(), *shard_id),
                            state: *s,
                        });
                    }
                }
            }
        }
        found.sort_by(|a, b| a.key.cmp(&b.key).then(a.node_id.cmp(&b.node_id)));
        found
    }

    // ---- Leadership ----

    fn send_leader(&self, key: &ReplicaKey, leader: Option<NodeId>, epoch: u64) {
        if let Some(tx) = self.leaders.read().get(key) {
            tx.send_replace(leader.map(|node| LeaderInfo { node, epoch }));
        }
    }

    #[must_use]
    pub fn leader_info(&self, key: &ReplicaKey) -> Option<LeaderInfo> {
        let state = self.state.read();
        let shard = state.shard(key).ok()?;
        shard.leader.map(|node| LeaderInfo {
            node,
            epoch: shard.epoch,
        })
    }

    /// Set (or clear) the leader of a shard, returning the new epoch
    ///
    /// A leader must host a replica of the shard that has not failed
    /// recovery, and its node must be live. Re-setting the current leader
    /// keeps the epoch.
    pub fn set_leader(&self, key: &ReplicaKey, leader: Option<NodeId>) -> Result<u64> {
        let epoch = {
            let mut state = self.state.write();
            if let Some(node) = leader {
                if !state.is_live(node) {
                    return Err(Error::NodeDown(node));
                }
                let replica = state.shard(key)?.replicas.get(&node).copied();
                match replica {
                    None => {
                        return Err(Error::ReplicaNotFound {
                            key: key.clone(),
                            node,
                        });
                    }
                    Some(ReplicaState::RecoveryFailed) => {
                        return Err(Error::invalid_argument(format!(
                            "replica of {key} on {node} failed recovery and cannot lead"
                        )));
                    }
                    Some(_) => {}
                }
            }
            let shard = state.shard_mut(key)?;
            if shard.leader == leader {
                return Ok(shard.epoch);
            }
            shard.leader = leader;
            shard.epoch += 1;
            shard.epoch
        };
        self.send_leader(key, leader, epoch);
        match leader {
            Some(node) => info!("Leader of {} is now {} (epoch {})", key, node, epoch),
            None => warn!("{} has no leader (epoch {})", key, epoch),
        }
        self.publish(vec![MembershipEvent::LeaderChanged {
            key: key.clone(),
            leader,
            epoch,
        }]);
        Ok(epoch)
    }

    /// Watch the leader of a shard
    pub fn watch_leader(&self, key: &ReplicaKey) -> Result<watch::Receiver<Option<LeaderInfo>>> {
        self.leaders
            .read()
            .get(key)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| Error::CollectionNotFound(key.collection.to_string()))
    }

    /// Current leader, waiting up to `max_wait` for one to be elected
    pub async fn get_leader(&self, key: &ReplicaKey, max_wait: Duration) -> Result<ReplicaRef> {
        let mut rx = self.watch_leader(key)?;
        let info = match tokio::time::timeout(max_wait, rx.wait_for(Option::is_some)).await {
            Ok(Ok(info)) => *info,
            Ok(Err(_)) | Err(_) => None,
        };
        let Some(info) = info else {
            return Err(Error::NoLeaderAvailable {
                key: key.clone(),
                waited_ms: u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX),
            });
        };
        let state = self.replica_state(key, info.node)?;
        Ok(ReplicaRef {
            node_id: info.node,
            key: key.clone(),
            state,
        })
    }

    // ---- Recovery waits ----

    /// True when no replica of the collection is recovering or waiting to
    /// recover on a live node
    pub fn recoveries_settled(&self, name: &CollectionName) -> Result<bool> {
        let state = self.state.read();
        let collection = state
            .collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))?;
        Ok(collection.shards.values().all(|shard| {
            shard.replicas.iter().all(|(node, s)| match s {
                ReplicaState::Recovering => false,
                ReplicaState::Down => !state.is_live(*node),
                ReplicaState::Active | ReplicaState::RecoveryFailed => true,
            })
        }))
    }

    /// Wait until every recovery of the collection finished
    pub async fn wait_for_recoveries(&self, name: &CollectionName, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changes.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.recoveries_settled(name)? {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let pending: Vec<String> = self
                    .replicas_in_state(ReplicaState::Recovering)
                    .into_iter()
                    .filter(|r| &r.key.collection == name)
                    .map(|r| r.to_string())
                    .collect();
                warn!(
                    "Timed out waiting for recoveries of {}: {:?}",
                    name, pending
                );
                return Err(Error::Timeout);
            }
        }
    }
}
