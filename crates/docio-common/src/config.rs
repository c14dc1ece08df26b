//! Configuration types for DocIO
//!
//! This module defines configuration structures used across components.
//! Every section falls back to its defaults so partial configuration files
//! are accepted.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for DocIO
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster membership and session configuration
    pub cluster: ClusterConfig,
    /// Write routing configuration
    pub router: RouterConfig,
    /// Replica recovery configuration
    pub recovery: RecoveryConfig,
    /// Update log configuration
    pub update_log: UpdateLogConfig,
    /// Backup configuration
    pub backup: BackupConfig,
}

impl Config {
    /// Check that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.cluster.heartbeat_interval_ms == 0 {
            return Err(Error::Configuration(
                "cluster.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.cluster.session_ttl_ms <= self.cluster.heartbeat_interval_ms {
            return Err(Error::Configuration(format!(
                "cluster.session_ttl_ms ({}) must exceed cluster.heartbeat_interval_ms ({})",
                self.cluster.session_ttl_ms, self.cluster.heartbeat_interval_ms
            )));
        }
        if self.recovery.peer_sync_limit == 0 {
            return Err(Error::Configuration(
                "recovery.peer_sync_limit must be positive".into(),
            ));
        }
        if self.recovery.max_attempts == 0 {
            return Err(Error::Configuration(
                "recovery.max_attempts must be positive".into(),
            ));
        }
        if self.router.initial_backoff_ms > self.router.max_backoff_ms
            || self.recovery.initial_backoff_ms > self.recovery.max_backoff_ms
        {
            return Err(Error::Configuration(
                "initial backoff cannot exceed max backoff".into(),
            ));
        }
        if self.update_log.max_retained_entries == 0 {
            return Err(Error::Configuration(
                "update_log.max_retained_entries must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Cluster membership configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Lease length; a node that does not renew within it is considered lost
    pub session_ttl_ms: u64,
    /// Interval between lease renewals
    pub heartbeat_interval_ms: u64,
    /// How long lookups wait for a shard leader
    pub leader_wait_ms: u64,
    /// How long `wait_for_recoveries` waits by default
    pub recovery_wait_ms: u64,
}

impl ClusterConfig {
    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn leader_wait(&self) -> Duration {
        Duration::from_millis(self.leader_wait_ms)
    }

    #[must_use]
    pub const fn recovery_wait(&self) -> Duration {
        Duration::from_millis(self.recovery_wait_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "docio".to_string(),
            session_ttl_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            leader_wait_ms: 3_000,
            recovery_wait_ms: 60_000,
        }
    }
}

/// Write routing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Overall budget for finding a leader before a write fails
    pub leader_retry_timeout_ms: u64,
    /// First backoff between leader lookups
    pub initial_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Timeout of a single forward to a replica
    pub forward_timeout_ms: u64,
}

impl RouterConfig {
    #[must_use]
    pub const fn leader_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_retry_timeout_ms)
    }

    #[must_use]
    pub const fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            leader_retry_timeout_ms: 5_000,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
            forward_timeout_ms: 2_000,
        }
    }
}

/// Replica recovery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Largest gap (in updates) closed by peer-sync; larger gaps use full replication
    pub peer_sync_limit: u64,
    /// Consecutive failed attempts before a replica is marked RECOVERY_FAILED
    pub max_attempts: u32,
    /// Fetch-and-replay passes allowed while the leader keeps advancing
    pub max_catch_up_passes: u32,
    /// First backoff between attempts
    pub initial_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Out-of-order live writes buffered per replica
    pub max_buffered_entries: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            peer_sync_limit: 100,
            max_attempts: 5,
            max_catch_up_passes: 8,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            max_buffered_entries: 10_000,
        }
    }
}

/// Update log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateLogConfig {
    /// Hard cap on retained entries, regardless of acknowledgements
    pub max_retained_entries: usize,
}

impl Default for UpdateLogConfig {
    fn default() -> Self {
        Self {
            max_retained_entries: 1_000,
        }
    }
}

/// Backup configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Name prefix of snapshot artifacts
    pub snapshot_prefix: String,
    /// Finished jobs remembered per coordinator
    pub max_retained_jobs: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            snapshot_prefix: "snapshot".to_string(),
            max_retained_jobs: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cluster.name, "docio");
        assert_eq!(config.recovery.peer_sync_limit, 100);
        assert_eq!(config.backup.snapshot_prefix, "snapshot");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_session_ttl() {
        let mut config = Config::default();
        config.cluster.session_ttl_ms = config.cluster.heartbeat_interval_ms;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_backoff() {
        let mut config = Config::default();
        config.recovery.initial_backoff_ms = config.recovery.max_backoff_ms + 1;
        assert!(config.validate().is_err());
    }
}
