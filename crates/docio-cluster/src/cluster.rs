//! In-process cluster
//!
//! Wires the directory, transport, router, failure detector, recovery
//! manager, consistency checker and backup coordinator together and runs
//! their background tasks. Nodes are added one at a time; collections are
//! placed on the live nodes with rendezvous hashing.

use crate::backup::BackupCoordinator;
use crate::client::CloudClient;
use crate::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::detector::FailureDetector;
use crate::fault::FaultInjector;
use crate::membership::MembershipDirectory;
use crate::metrics::ClusterMetrics;
use crate::node::Node;
use crate::placement;
use crate::recovery::RecoveryManager;
use crate::router::{AckTracker, WriteRouter};
use crate::transport::{LocalTransport, NodeTransport};
use async_trait::async_trait;
use docio_common::{
    CollectionName, Config, Error, FailureSignal, NodeId, ReplicaKey, ReplicaState, Result,
    ShardId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// First port handed out to nodes; node N listens on `BASE_PORT + N`
const BASE_PORT: u16 = 7100;

pub struct Cluster {
    config: Config,
    directory: Arc<MembershipDirectory>,
    transport: Arc<LocalTransport>,
    metrics: Arc<ClusterMetrics>,
    router: Arc<WriteRouter>,
    detector: Arc<FailureDetector>,
    recovery: Arc<RecoveryManager>,
    checker: Arc<ConsistencyChecker>,
    backups: Arc<BackupCoordinator>,
    heartbeats: Mutex<HashMap<NodeId, JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Validate the configuration and start the background tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let directory = Arc::new(MembershipDirectory::new(&config.cluster));
        let transport = Arc::new(LocalTransport::new());
        let dyn_transport: Arc<dyn NodeTransport> = transport.clone();
        let metrics = Arc::new(ClusterMetrics::new());
        let acks = Arc::new(AckTracker::new());

        let router = Arc::new(WriteRouter::new(
            directory.clone(),
            dyn_transport.clone(),
            config.router.clone(),
            metrics.clone(),
            acks.clone(),
        ));
        let detector = Arc::new(FailureDetector::new(
            directory.clone(),
            dyn_transport.clone(),
            metrics.clone(),
            &config.cluster,
        ));
        let recovery = Arc::new(RecoveryManager::new(
            directory.clone(),
            dyn_transport.clone(),
            config.recovery.clone(),
            config.cluster.leader_wait(),
            metrics.clone(),
            acks,
        ));
        let checker = Arc::new(ConsistencyChecker::new(
            directory.clone(),
            dyn_transport.clone(),
        ));
        let backups = Arc::new(BackupCoordinator::new(
            directory.clone(),
            dyn_transport,
            config.backup.clone(),
            metrics.clone(),
        ));

        let background = vec![
            recovery.spawn_watcher(),
            router.spawn_cache_invalidator(),
            detector.spawn_lease_sweeper(),
        ];
        info!("Cluster {} started", config.cluster.name);

        Ok(Self {
            config,
            directory,
            transport,
            metrics,
            router,
            detector,
            recovery,
            checker,
            backups,
            heartbeats: Mutex::new(HashMap::new()),
            background: Mutex::new(background),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Add a running node and start its heartbeat
    pub fn add_node(&self) -> NodeId {
        let id = NodeId::new(
            self.transport
                .node_ids()
                .last()
                .map_or(1, |last| last.get() + 1),
        );
        let port = u16::try_from(id.get())
            .ok()
            .and_then(|n| BASE_PORT.checked_add(n))
            .unwrap_or(BASE_PORT);
        let address = SocketAddr::from(([127, 0, 0, 1], port));
        let node = Arc::new(Node::new(id, address, self.directory.clone(), &self.config));
        node.set_running(true);
        self.transport.register(node.clone());
        let session = self.directory.register_node(id, address);
        node.set_session(Some(session));
        self.spawn_heartbeat(node, session);
        id
    }

    pub fn add_nodes(&self, count: usize) -> Vec<NodeId> {
        (0..count).map(|_| self.add_node()).collect()
    }

    fn spawn_heartbeat(&self, node: Arc<Node>, session: docio_common::SessionId) {
        let id = node.id();
        let handle = self.detector.spawn_heartbeat(node, session);
        if let Some(previous) = self.heartbeats.lock().insert(id, handle) {
            previous.abort();
        }
    }

    /// Create a collection and place its replicas on the live nodes
    pub async fn create_collection(
        &self,
        name: &str,
        shard_count: u32,
        replication_factor: u32,
    ) -> Result<CollectionName> {
        let name = CollectionName::new(name)?;
        let live = self.directory.live_nodes();
        let replicas = usize::try_from(replication_factor)
            .map_err(|_| Error::invalid_argument("replication factor out of range"))?;
        if replicas > live.len() {
            return Err(Error::invalid_argument(format!(
                "replication factor {} exceeds {} live nodes",
                replication_factor,
                live.len()
            )));
        }
        self.directory
            .create_collection(&name, shard_count, replication_factor)?;

        for key in self.directory.shard_keys(&name)? {
            for node in placement::assign_replicas(&key, &live, replicas) {
                self.transport.node(node)?.open_replica(&key);
                self.directory.add_replica(&key, node, ReplicaState::Active)?;
            }
            self.detector.elect_leader(&key, false).await?;
        }
        info!(
            "Created {} with {} shards x {} replicas",
            name, shard_count, replication_factor
        );
        Ok(name)
    }

    /// Add a replica of an existing shard on `node`; it recovers from the leader
    pub fn add_replica(&self, name: &CollectionName, shard: ShardId, node: NodeId) -> Result<ReplicaKey> {
        let key = ReplicaKey::new(name.clone(), shard);
        self.directory.shard(&key)?;
        self.transport.node(node)?.open_replica(&key);
        self.directory
            .add_replica(&key, node, ReplicaState::Recovering)?;
        Ok(key)
    }

    /// Client that may talk to any node
    #[must_use]
    pub fn client(&self) -> CloudClient {
        CloudClient::new(
            self.router.clone(),
            self.directory.clone(),
            self.transport.clone(),
            None,
        )
    }

    /// Client connected through `node`
    pub fn node_client(&self, node: NodeId) -> Result<CloudClient> {
        self.transport.node_handle(node)?;
        Ok(CloudClient::new(
            self.router.clone(),
            self.directory.clone(),
            self.transport.clone(),
            Some(node),
        ))
    }

    pub async fn wait_for_recoveries(&self, name: &CollectionName, timeout: Duration) -> Result<()> {
        self.directory.wait_for_recoveries(name, timeout).await
    }

    pub async fn check_shard_consistency(&self, key: &ReplicaKey) -> Result<ConsistencyReport> {
        self.checker.check_shard(key).await
    }

    /// Stop every node hosting a shard except `keep`
    pub async fn stop_shard_except(
        &self,
        name: &CollectionName,
        shard: ShardId,
        keep: NodeId,
    ) -> Result<Vec<NodeId>> {
        let key = ReplicaKey::new(name.clone(), shard);
        let mut stopped = Vec::new();
        for replica in self.directory.replicas(&key)? {
            let node = replica.node_id;
            if node != keep && self.directory.is_live(node) {
                self.stop_node(node).await?;
                stopped.push(node);
            }
        }
        Ok(stopped)
    }

    #[must_use]
    pub fn checker(&self) -> &Arc<ConsistencyChecker> {
        &self.checker
    }

    #[must_use]
    pub fn backups(&self) -> &Arc<BackupCoordinator> {
        &self.backups
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ClusterMetrics> {
        &self.metrics
    }

    /// Metrics in Prometheus text format
    #[must_use]
    pub fn export_metrics(&self) -> String {
        self.metrics.export_prometheus(&self.config.cluster.name)
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<MembershipDirectory> {
        &self.directory
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    #[must_use]
    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    pub fn node(&self, id: NodeId) -> Result<Arc<Node>> {
        self.transport.node_handle(id)
    }

    /// Stop background tasks and every node
    pub fn shutdown(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        for (_, handle) in self.heartbeats.lock().drain() {
            handle.abort();
        }
        for id in self.transport.node_ids() {
            if let Ok(node) = self.transport.node_handle(id) {
                node.set_running(false);
            }
        }
        info!("Cluster {} shut down", self.config.cluster.name);
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
        for (_, handle) in self.heartbeats.get_mut().drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl FaultInjector for Cluster {
    async fn stop_node(&self, node: NodeId) -> Result<()> {
        let handle = self.transport.node_handle(node)?;
        info!("Stopping {}", node);
        handle.set_running(false);
        handle.set_session(None);
        if let Some(heartbeat) = self.heartbeats.lock().remove(&node) {
            heartbeat.abort();
        }
        self.detector
            .on_node_lost(node, FailureSignal::Stopped)
            .await?;
        Ok(())
    }

    async fn start_node(&self, node: NodeId) -> Result<()> {
        let handle = self.transport.node_handle(node)?;
        if handle.is_running() && self.directory.is_live(node) {
            return Ok(());
        }
        info!("Starting {}", node);
        handle.set_running(true);
        let session = self.directory.register_node(node, handle.address());
        handle.set_session(Some(session));
        self.spawn_heartbeat(handle, session);
        self.detector.on_node_joined(node).await
    }

    async fn expire_session(&self, node: NodeId) -> Result<()> {
        self.directory.expire_session(node)?;
        self.detector
            .on_node_lost(node, FailureSignal::SessionExpired)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docio_common::DocId;
    use docio_store::{Document, Query};

    fn config() -> Config {
        let mut config = Config::default();
        config.cluster.heartbeat_interval_ms = 100;
        config.recovery.initial_backoff_ms = 10;
        config.recovery.max_backoff_ms = 50;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_create_collection_places_replicas() {
        let cluster = Cluster::start(config()).unwrap();
        cluster.add_nodes(3);
        let name = cluster.create_collection("collection1", 2, 2).await.unwrap();
        for key in cluster.directory().shard_keys(&name).unwrap() {
            let shard = cluster.directory().shard(&key).unwrap();
            assert_eq!(shard.replicas.len(), 2);
            assert!(shard.leader.is_some());
        }
        assert!(matches!(
            cluster.create_collection("too_wide", 1, 4).await,
            Err(Error::InvalidArgument(_))
        ));
        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_and_query() {
        let cluster = Cluster::start(config()).unwrap();
        cluster.add_nodes(2);
        let name = cluster.create_collection("collection1", 2, 2).await.unwrap();
        let client = cluster.client();
        for i in 0..10u64 {
            client
                .add(&name, Document::new(DocId::from(i)).with_field("n_ti", i))
                .await
                .unwrap();
        }
        client.commit(&name).await.unwrap();
        let result = client.query(&name, &Query::all().rows(3).sort_desc("n_ti")).await.unwrap();
        assert_eq!(result.num_found, 10);
        assert_eq!(result.ids(), vec!["9", "8", "7"]);

        for key in cluster.directory().shard_keys(&name).unwrap() {
            assert!(cluster.check_shard_consistency(&key).await.unwrap().is_consistent());
        }
        cluster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopped_entry_node_rejects_requests() {
        let cluster = Cluster::start(config()).unwrap();
        let nodes = cluster.add_nodes(2);
        let name = cluster.create_collection("collection1", 1, 2).await.unwrap();
        let client = cluster.node_client(nodes[1]).unwrap();
        cluster.stop_node(nodes[1]).await.unwrap();
        assert!(matches!(
            client.add(&name, Document::new(DocId::from(1))).await,
            Err(Error::NodeDown(_))
        ));
        cluster.start_node(nodes[1]).await.unwrap();
        client.add(&name, Document::new(DocId::from(1))).await.unwrap();
        cluster.shutdown();
    }
}
