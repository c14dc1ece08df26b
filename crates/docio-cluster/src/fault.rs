//! Fault injection
//!
//! Injected faults travel the same paths as organic failures: a stopped
//! node is reported to the failure detector, an expired session is noticed
//! by the node's own heartbeat.

use async_trait::async_trait;
use docio_common::{NodeId, Result};

#[async_trait]
pub trait FaultInjector: Send + Sync {
    /// Stop a node; its replicas go DOWN and shards it led re-elect
    async fn stop_node(&self, node: NodeId) -> Result<()>;

    /// Restart a stopped node; its replicas recover
    async fn start_node(&self, node: NodeId) -> Result<()>;

    /// Expire a node's session while it keeps running
    async fn expire_session(&self, node: NodeId) -> Result<()>;
}
