//! DocIO Cluster - Replication, failure handling and recovery
//!
//! This crate runs a sharded, leader-based document store across a set of
//! nodes:
//! - A membership directory with session leases, replica states and
//!   per-shard leaders
//! - Write routing to shard leaders with concurrent fan-out to replicas
//! - Failure detection and leader election
//! - Two-tier recovery: peer-sync for small gaps, full replication otherwise
//! - Consistency checks and asynchronous backups
//!
//! # Example
//! ```ignore
//! use docio_cluster::{Cluster, FaultInjector};
//!
//! let cluster = Cluster::start(Config::default())?;
//! let nodes = cluster.add_nodes(3);
//! let name = cluster.create_collection("collection1", 2, 3).await?;
//! cluster.client().add(&name, doc).await?;
//! cluster.stop_node(nodes[1]).await?;
//! ```

pub mod backoff;
pub mod backup;
pub mod client;
pub mod cluster;
pub mod consistency;
pub mod detector;
pub mod fault;
pub mod lease;
pub mod membership;
pub mod metrics;
pub mod node;
pub mod placement;
pub mod recovery;
pub mod replica;
pub mod router;
pub mod transport;

// Re-exports
pub use backup::{BackupCoordinator, SnapshotJob};
pub use client::CloudClient;
pub use cluster::Cluster;
pub use consistency::{ConsistencyChecker, ConsistencyReport, ReplicaReport};
pub use detector::FailureDetector;
pub use fault::FaultInjector;
pub use membership::{LeaderInfo, MembershipDirectory, MembershipEvent};
pub use metrics::{ClusterMetrics, MetricsSnapshot};
pub use node::Node;
pub use recovery::{RecoveryManager, RecoveryOutcome, RecoveryStrategy};
pub use replica::{ApplyOutcome, Replica};
pub use router::{AckTracker, WriteAck, WriteRouter};
pub use transport::{LocalTransport, NodeTransport, ReplicaSnapshot, ReplicaStats};
