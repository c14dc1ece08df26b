//! Error types for DocIO
//!
//! This module defines the common error types used throughout the system.

use crate::types::{
    CollectionNameError, DocIdError, JobId, NodeId, ReplicaEvent, ReplicaKey, ReplicaState,
    SequenceNumber,
};
use thiserror::Error;

/// Common result type for DocIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for DocIO
#[derive(Debug, Error)]
pub enum Error {
    // Leadership and routing errors
    #[error("no leader available for {key} after {waited_ms} ms")]
    NoLeaderAvailable { key: ReplicaKey, waited_ms: u64 },

    #[error("shard unavailable: {0} has no live replicas")]
    ShardUnavailable(ReplicaKey),

    #[error("leader lost for {key}: {node} no longer leads this shard")]
    LeaderLost { key: ReplicaKey, node: NodeId },

    // Recovery and consistency errors
    #[error("recovery failed for {key} on {node} after {attempts} attempts: {reason}")]
    RecoveryFailed {
        key: ReplicaKey,
        node: NodeId,
        attempts: u32,
        reason: String,
    },

    #[error("consistency fault on {key}: {details}")]
    ConsistencyFault { key: ReplicaKey, details: String },

    #[error("update log truncated: requested entries after {requested}, oldest retained is {oldest}")]
    LogTruncated {
        requested: SequenceNumber,
        oldest: SequenceNumber,
    },

    #[error("sequence gap: expected {expected}, got {actual}")]
    SequenceGap {
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    // Document errors
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("invalid document id: {0}")]
    InvalidDocId(#[from] DocIdError),

    // Membership errors
    #[error("invalid collection name: {0}")]
    InvalidCollectionName(#[from] CollectionNameError),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node is down: {0}")]
    NodeDown(NodeId),

    #[error("replica not found: {key} on {node}")]
    ReplicaNotFound { key: ReplicaKey, node: NodeId },

    #[error("session expired for {0}")]
    SessionExpired(NodeId),

    #[error("invalid replica transition for {key} on {node}: {from} on {event}")]
    InvalidTransition {
        key: ReplicaKey,
        node: NodeId,
        from: ReplicaState,
        event: ReplicaEvent,
    },

    // Backup errors
    #[error("backup job not found: {0}")]
    JobNotFound(JobId),

    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    // Internal errors
    #[error("request timeout")]
    Timeout,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a malformed document error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedDocument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if the operation may succeed when retried after a backoff
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoLeaderAvailable { .. }
                | Self::LeaderLost { .. }
                | Self::NodeDown(_)
                | Self::Timeout
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::CollectionNotFound(_)
                | Self::NodeNotFound(_)
                | Self::ReplicaNotFound { .. }
                | Self::JobNotFound(_)
        )
    }

    /// Check if the error was caused by the caller's input
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedDocument(_)
                | Self::InvalidDocId(_)
                | Self::InvalidCollectionName(_)
                | Self::InvalidArgument(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionName, ShardId};

    fn key() -> ReplicaKey {
        ReplicaKey::new(CollectionName::new_unchecked("c"), ShardId::new(1))
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(
            Error::NoLeaderAvailable {
                key: key(),
                waited_ms: 10
            }
            .is_retryable()
        );
        assert!(
            Error::LeaderLost {
                key: key(),
                node: NodeId::new(1)
            }
            .is_retryable()
        );
        assert!(!Error::ShardUnavailable(key()).is_retryable());
        assert!(!Error::malformed("no id").is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::CollectionNotFound("c".into()).is_not_found());
        assert!(Error::JobNotFound(JobId::new()).is_not_found());
        assert!(!Error::Timeout.is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = Error::ShardUnavailable(key());
        assert_eq!(err.to_string(), "shard unavailable: c/shard1 has no live replicas");
        assert!(Error::malformed("missing id").is_client_error());
    }
}
