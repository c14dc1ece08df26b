//! Asynchronous backups
//!
//! A backup snapshots every replica hosted by one node. The snapshot is
//! written into a hidden temporary directory under the target location and
//! renamed to `<location>/<prefix>.<millis>` once complete, so a partially
//! written artifact is never visible under the final name.

use crate::membership::MembershipDirectory;
use crate::metrics::ClusterMetrics;
use crate::transport::{NodeTransport, ReplicaSnapshot};
use docio_common::config::BackupConfig;
use docio_common::{BackupStatus, Error, JobId, NodeId, Result};
use docio_store::document::now_millis;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Interval between status polls in [`BackupCoordinator::wait_for_completion`]
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Record of one backup job
#[derive(Debug, Clone)]
pub struct SnapshotJob {
    pub id: JobId,
    pub node: NodeId,
    pub location: PathBuf,
    pub status: BackupStatus,
    /// Final artifact directory, set on success
    pub artifact: Option<PathBuf>,
    pub replicas: Vec<ReplicaSnapshot>,
    pub error: Option<String>,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
}

pub struct BackupCoordinator {
    directory: Arc<MembershipDirectory>,
    transport: Arc<dyn NodeTransport>,
    config: BackupConfig,
    metrics: Arc<ClusterMetrics>,
    jobs: RwLock<HashMap<JobId, SnapshotJob>>,
    /// Terminal jobs, oldest first
    finished: Mutex<VecDeque<JobId>>,
    /// Serialises artifact naming within one process
    publish: Arc<Mutex<()>>,
}

impl BackupCoordinator {
    pub fn new(
        directory: Arc<MembershipDirectory>,
        transport: Arc<dyn NodeTransport>,
        config: BackupConfig,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        Self {
            directory,
            transport,
            config,
            metrics,
            jobs: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            publish: Arc::new(Mutex::new(())),
        }
    }

    /// Start a backup of `node` into `location`; returns immediately
    pub fn trigger_backup(
        self: &Arc<Self>,
        node: NodeId,
        location: impl Into<PathBuf>,
    ) -> Result<JobId> {
        if !self.directory.is_live(node) {
            return Err(Error::NodeDown(node));
        }
        let location = location.into();
        let id = JobId::new();
        self.jobs.write().insert(
            id,
            SnapshotJob {
                id,
                node,
                location: location.clone(),
                status: BackupStatus::Running,
                artifact: None,
                replicas: Vec::new(),
                error: None,
                started_at_ms: now_millis(),
                finished_at_ms: None,
            },
        );
        ClusterMetrics::incr(&self.metrics.backups_started);
        info!("Backup {} of {} into {} started", id, node, location.display());

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = coordinator.write_artifact(id, node, location).await;
            coordinator.complete(id, result);
        });
        Ok(id)
    }

    async fn write_artifact(
        &self,
        id: JobId,
        node: NodeId,
        location: PathBuf,
    ) -> Result<(PathBuf, Vec<ReplicaSnapshot>)> {
        let tmp = location.join(format!(".{}.{}.tmp", self.config.snapshot_prefix, id));
        let replicas = match self.transport.snapshot(node, tmp.clone()).await {
            Ok(replicas) => replicas,
            Err(e) => {
                remove_partial(&tmp).await;
                return Err(e);
            }
        };

        let prefix = self.config.snapshot_prefix.clone();
        let publish = Arc::clone(&self.publish);
        let staged = tmp.clone();
        let published = tokio::task::spawn_blocking(move || {
            let _naming = publish.lock();
            publish_artifact(&staged, &location, &prefix)
        })
        .await
        .map_err(|e| Error::internal(format!("backup task failed: {e}")))
        .and_then(|r| r);

        let artifact = match published {
            Ok(artifact) => artifact,
            Err(e) => {
                remove_partial(&tmp).await;
                return Err(e);
            }
        };
        let replicas = replicas
            .into_iter()
            .map(|mut r| {
                if let Some(name) = r.path.file_name() {
                    r.path = artifact.join(name);
                }
                r
            })
            .collect();
        Ok((artifact, replicas))
    }

    fn complete(&self, id: JobId, result: Result<(PathBuf, Vec<ReplicaSnapshot>)>) {
        {
            let mut jobs = self.jobs.write();
            let Some(job) = jobs.get_mut(&id) else {
                return;
            };
            job.finished_at_ms = Some(now_millis());
            match result {
                Ok((artifact, replicas)) => {
                    info!(
                        "Backup {} of {} succeeded: {} replicas in {}",
                        id,
                        job.node,
                        replicas.len(),
                        artifact.display()
                    );
                    job.status = BackupStatus::Success;
                    job.artifact = Some(artifact);
                    job.replicas = replicas;
                    ClusterMetrics::incr(&self.metrics.backups_succeeded);
                }
                Err(e) => {
                    error!("Backup {} of {} failed: {}", id, job.node, e);
                    job.status = BackupStatus::Failed;
                    job.error = Some(e.to_string());
                    ClusterMetrics::incr(&self.metrics.backups_failed);
                }
            }
        }

        let expired: Vec<JobId> = {
            let mut finished = self.finished.lock();
            finished.push_back(id);
            let excess = finished.len().saturating_sub(self.config.max_retained_jobs);
            finished.drain(..excess).collect()
        };
        if !expired.is_empty() {
            let mut jobs = self.jobs.write();
            for old in expired {
                jobs.remove(&old);
            }
        }
    }

    /// Current status of a job; never re-runs it
    pub fn poll_status(&self, node: NodeId, id: JobId) -> Result<BackupStatus> {
        self.job(node, id).map(|job| job.status)
    }

    /// Full record of a job
    pub fn job(&self, node: NodeId, id: JobId) -> Result<SnapshotJob> {
        self.jobs
            .read()
            .get(&id)
            .filter(|job| job.node == node)
            .cloned()
            .ok_or(Error::JobNotFound(id))
    }

    /// Jobs known to the coordinator, oldest first
    #[must_use]
    pub fn jobs(&self) -> Vec<SnapshotJob> {
        let mut jobs: Vec<SnapshotJob> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|job| job.started_at_ms);
        jobs
    }

    /// Wait until a job reaches a terminal status
    pub async fn wait_for_completion(
        &self,
        node: NodeId,
        id: JobId,
        timeout: Duration,
    ) -> Result<SnapshotJob> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.job(node, id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if Instant::now() >= deadline {
                warn!("Backup {} of {} still running after {:?}", id, node, timeout);
                return Err(Error::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Forget a finished job
    pub fn discard(&self, id: JobId) -> Result<SnapshotJob> {
        let mut jobs = self.jobs.write();
        match jobs.get(&id) {
            None => return Err(Error::JobNotFound(id)),
            Some(job) if !job.status.is_terminal() => {
                return Err(Error::invalid_argument(format!(
                    "backup {id} is still running"
                )));
            }
            Some(_) => {}
        }
        self.finished.lock().retain(|j| *j != id);
        jobs.remove(&id).ok_or(Error::JobNotFound(id))
    }
}

/// Rename a staged snapshot to the first free `<prefix>.<millis>` name
fn publish_artifact(staged: &Path, location: &Path, prefix: &str) -> Result<PathBuf> {
    let mut stamp = now_millis();
    loop {
        let artifact = location.join(format!("{prefix}.{stamp}"));
        if !artifact.exists() {
            std::fs::rename(staged, &artifact).map_err(|e| {
                Error::storage(format!(
                    "failed to rename {} to {}: {e}",
                    staged.display(),
                    artifact.display()
                ))
            })?;
            return Ok(artifact);
        }
        stamp += 1;
    }
}

async fn remove_partial(tmp: &Path) {
    match tokio::fs::remove_dir_all(tmp).await {
        Ok(()) => debug!("Removed partial backup {}", tmp.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial backup {}: {}", tmp.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::transport::LocalTransport;
    use docio_common::{CollectionName, Config, DocId, ReplicaKey, ReplicaState, ShardId};
    use docio_store::{Document, UpdateOp, read_snapshot};
    use std::net::SocketAddr;
    use tempfile::TempDir;

    fn setup(max_retained_jobs: usize) -> (Arc<LocalTransport>, Arc<BackupCoordinator>, ReplicaKey) {
        let config = Config::default();
        let directory = Arc::new(MembershipDirectory::new(&config.cluster));
        let transport = Arc::new(LocalTransport::new());
        let name = CollectionName::new("c").unwrap();
        directory.create_collection(&name, 1, 1).unwrap();
        let key = ReplicaKey::new(name, ShardId::new(1));
        let address = SocketAddr::from(([127, 0, 0, 1], 7001));
        let node = Arc::new(Node::new(NodeId::new(1), address, directory.clone(), &config));
        node.open_replica(&key);
        node.set_running(true);
        transport.register(node.clone());
        directory.register_node(NodeId::new(1), address);
        directory
            .add_replica(&key, NodeId::new(1), ReplicaState::Active)
            .unwrap();
        let epoch = directory.set_leader(&key, Some(NodeId::new(1))).unwrap();
        for i in 0..5u64 {
            node.leader_append(&key, UpdateOp::Add(Document::new(DocId::from(i))), epoch)
                .unwrap();
        }
        node.replica(&key).unwrap().store().commit().unwrap();

        let backup_config = BackupConfig {
            max_retained_jobs,
            ..BackupConfig::default()
        };
        let coordinator = Arc::new(BackupCoordinator::new(
            directory,
            transport.clone(),
            backup_config,
            Arc::new(ClusterMetrics::new()),
        ));
        (transport, coordinator, key)
    }

    fn artifacts(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("snapshot."))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_backup_success() {
        let (_transport, coordinator, key) = setup(8);
        let dir = TempDir::new().unwrap();
        let node = NodeId::new(1);
        let id = coordinator.trigger_backup(node, dir.path()).unwrap();
        let job = coordinator
            .wait_for_completion(node, id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(job.status, BackupStatus::Success);

        // Repeated polls neither change the status nor write another artifact
        for _ in 0..3 {
            assert_eq!(coordinator.poll_status(node, id).unwrap(), BackupStatus::Success);
        }
        let written = artifacts(dir.path());
        assert_eq!(written.len(), 1);
        assert_eq!(Some(&written[0]), job.artifact.as_ref());

        assert_eq!(job.replicas.len(), 1);
        assert_eq!(job.replicas[0].key, key);
        let image = read_snapshot(&job.replicas[0].path).unwrap();
        assert_eq!(image.docs.len(), 5);
    }

    #[tokio::test]
    async fn test_backup_of_dead_node() {
        let (_transport, coordinator, _key) = setup(8);
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            coordinator.trigger_backup(NodeId::new(9), dir.path()),
            Err(Error::NodeDown(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_job() {
        let (transport, coordinator, _key) = setup(8);
        let dir = TempDir::new().unwrap();
        let node = NodeId::new(1);
        transport.partition(node);
        let id = coordinator.trigger_backup(node, dir.path()).unwrap();
        let job = coordinator
            .wait_for_completion(node, id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(job.status, BackupStatus::Failed);
        assert!(job.error.is_some());
        assert!(artifacts(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_job_lookup_and_discard() {
        let (_transport, coordinator, _key) = setup(8);
        let dir = TempDir::new().unwrap();
        let node = NodeId::new(1);
        let id = coordinator.trigger_backup(node, dir.path()).unwrap();
        assert!(matches!(
            coordinator.poll_status(NodeId::new(2), id),
            Err(Error::JobNotFound(_))
        ));
        coordinator
            .wait_for_completion(node, id, Duration::from_secs(5))
            .await
            .unwrap();
        coordinator.discard(id).unwrap();
        assert!(coordinator.poll_status(node, id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (_transport, coordinator, _key) = setup(2);
        let dir = TempDir::new().unwrap();
        let node = NodeId::new(1);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = coordinator.trigger_backup(node, dir.path()).unwrap();
            coordinator
                .wait_for_completion(node, id, Duration::from_secs(5))
                .await
                .unwrap();
            ids.push(id);
        }
        assert!(coordinator.poll_status(node, ids[0]).is_err());
        assert_eq!(coordinator.jobs().len(), 2);
        assert_eq!(artifacts(dir.path()).len(), 3);
    }
}
