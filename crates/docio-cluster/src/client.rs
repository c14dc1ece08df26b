//! Cluster client
//!
//! Writes go through the [`WriteRouter`]; distributed queries fan out to
//! every shard leader and merge the partial results. A client pinned to an
//! entry node behaves like a client connected to that node: the node must
//! be up, but it need not host the collection.

use crate::backoff::Backoff;
use crate::membership::MembershipDirectory;
use crate::router::{WriteAck, WriteRouter};
use crate::transport::NodeTransport;
use docio_common::{CollectionName, DocId, Error, NodeId, ReplicaKey, Result};
use docio_store::{Document, Query, QueryResult, UpdateOp};
use futures::future::try_join_all;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone)]
pub struct CloudClient {
    router: Arc<WriteRouter>,
    directory: Arc<MembershipDirectory>,
    transport: Arc<dyn NodeTransport>,
    entry: Option<NodeId>,
}

impl CloudClient {
    pub fn new(
        router: Arc<WriteRouter>,
        directory: Arc<MembershipDirectory>,
        transport: Arc<dyn NodeTransport>,
        entry: Option<NodeId>,
    ) -> Self {
        Self {
            router,
            directory,
            transport,
            entry,
        }
    }

    /// Entry node, if the client is pinned to one
    #[must_use]
    pub const fn entry(&self) -> Option<NodeId> {
        self.entry
    }

    fn check_entry(&self) -> Result<()> {
        match self.entry {
            Some(node) if !self.directory.is_live(node) => Err(Error::NodeDown(node)),
            _ => Ok(()),
        }
    }

    /// Add or replace a document
    pub async fn add(&self, collection: &CollectionName, doc: Document) -> Result<WriteAck> {
        self.write(collection, UpdateOp::Add(doc)).await
    }

    /// Add a JSON document; it must carry a string `id`
    pub async fn add_json(&self, collection: &CollectionName, value: Value) -> Result<WriteAck> {
        let doc = Document::from_json(value)?;
        self.add(collection, doc).await
    }

    /// Merge fields into an existing document (creates it if missing)
    pub async fn update(&self, collection: &CollectionName, doc: Document) -> Result<WriteAck> {
        self.write(collection, UpdateOp::Update(doc)).await
    }

    pub async fn delete(&self, collection: &CollectionName, id: DocId) -> Result<WriteAck> {
        self.write(collection, UpdateOp::Delete(id)).await
    }

    async fn write(&self, collection: &CollectionName, op: UpdateOp) -> Result<WriteAck> {
        self.check_entry()?;
        self.router.route(collection, op).await
    }

    /// Make all acknowledged writes visible to queries
    pub async fn commit(&self, collection: &CollectionName) -> Result<()> {
        self.check_entry()?;
        self.router.commit(collection).await
    }

    pub async fn query(&self, collection: &CollectionName, query: &Query) -> Result<QueryResult> {
        self.check_entry()?;
        if query.distrib {
            self.distributed_query(collection, query).await
        } else {
            self.local_query(collection, query).await
        }
    }

    async fn distributed_query(
        &self,
        collection: &CollectionName,
        query: &Query,
    ) -> Result<QueryResult> {
        let keys = self.directory.shard_keys(collection)?;
        let deadline = Instant::now() + self.router.config().leader_retry_timeout();
        let parts = try_join_all(keys.iter().map(|key| self.query_shard(key, query, deadline))).await?;
        Ok(QueryResult::merge(query, parts))
    }

    /// Query a shard's leader, retrying while leadership settles
    async fn query_shard(&self, key: &ReplicaKey, query: &Query, deadline: Instant) -> Result<QueryResult> {
        let config = self.router.config();
        let mut backoff = Backoff::from_millis(config.initial_backoff_ms, config.max_backoff_ms);
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let result = match self.directory.get_leader(key, wait).await {
                Ok(leader) => self.transport.query(leader.node_id, key, query).await,
                Err(e) => Err(e),
            };
            match result {
                Err(e) if e.is_retryable() && Instant::now() < deadline => {
                    debug!("Query of {} failed ({}); retrying", key, e);
                    backoff.wait_until(deadline).await;
                }
                other => return other,
            }
        }
    }

    /// Answer from the entry node's own replicas
    async fn local_query(&self, collection: &CollectionName, query: &Query) -> Result<QueryResult> {
        let node = self.entry.ok_or_else(|| {
            Error::invalid_argument("a non-distributed query needs an entry node")
        })?;
        let keys: Vec<ReplicaKey> = self
            .directory
            .shards_hosted_by(node)
            .into_iter()
            .filter(|r| &r.key.collection == collection)
            .map(|r| r.key)
            .collect();
        let parts = try_join_all(keys.iter().map(|key| self.transport.query(node, key, query))).await?;
        Ok(QueryResult::merge(query, parts))
    }
}
