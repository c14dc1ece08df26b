//! Core type definitions for DocIO
//!
//! This module defines the identifiers, replica addressing and the replica
//! state machine shared by the store, the cluster control plane and the
//! binaries.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sequence number assigned by a shard leader to every update
pub type SequenceNumber = u64;

/// Identifier of a cluster node
///
/// Node ids are ordered; leader elections break ties on the lowest id.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("node-{_0}")]
pub struct NodeId(u64);

impl NodeId {
    /// Create a node id from its numeric value
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the numeric value
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Get as big-endian bytes (used for placement hashing)
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Membership session of a node
///
/// A new session is issued every time a node registers; a node that loses
/// its session must register again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a shard within a collection (1-based)
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("shard{_0}")]
pub struct ShardId(u32);

impl ShardId {
    /// Create a shard id
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the numeric value
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Shard id for a zero-based shard index
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index + 1)
    }

    /// Zero-based index of this shard
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.0.saturating_sub(1)
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

/// Name of a collection
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct CollectionName(String);

impl CollectionName {
    /// Create a new collection name (validated)
    pub fn new(name: impl Into<String>) -> Result<Self, CollectionNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the collection name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), CollectionNameError> {
        if name.is_empty() {
            return Err(CollectionNameError::Empty);
        }
        if name.len() > 128 {
            return Err(CollectionNameError::TooLong);
        }
        if name.starts_with('-') || name.starts_with('.') {
            return Err(CollectionNameError::InvalidStartChar);
        }
        for c in name.chars() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.' {
                return Err(CollectionNameError::InvalidChar(c));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionName({:?})", self.0)
    }
}

/// Errors that can occur when creating a collection name
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollectionNameError {
    #[error("collection name cannot be empty")]
    Empty,
    #[error("collection name must be at most 128 characters")]
    TooLong,
    #[error("collection name cannot start with '-' or '.'")]
    InvalidStartChar,
    #[error("collection name contains invalid character: {0}")]
    InvalidChar(char),
}

/// Document identifier (the `id` field of every document)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct DocId(String);

impl DocId {
    /// Maximum length of a document id in bytes
    pub const MAX_LEN: usize = 512;

    /// Create a document id (must be non-empty)
    pub fn new(id: impl Into<String>) -> Result<Self, DocIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DocIdError::Empty);
        }
        if id.len() > Self::MAX_LEN {
            return Err(DocIdError::TooLong);
        }
        Ok(Self(id))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({:?})", self.0)
    }
}

impl From<u64> for DocId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Errors that can occur when creating a document id
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocIdError {
    #[error("document id cannot be empty")]
    Empty,
    #[error("document id cannot exceed 512 bytes")]
    TooLong,
}

/// Addresses one shard of one collection
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaKey {
    pub collection: CollectionName,
    pub shard: ShardId,
}

impl ReplicaKey {
    /// Create a new replica key
    #[must_use]
    pub const fn new(collection: CollectionName, shard: ShardId) -> Self {
        Self { collection, shard }
    }
}

impl fmt::Debug for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaKey({}/{})", self.collection, self.shard)
    }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.shard)
    }
}

/// Position of the last applied update of a store
///
/// The epoch is the leader epoch that issued the entry at `seq`; two stores
/// at the same sequence number but different epochs have diverged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub seq: SequenceNumber,
    pub epoch: u64,
}

impl LogPosition {
    /// Position of an empty store
    pub const ZERO: Self = Self { seq: 0, epoch: 0 };

    /// Create a new position
    #[must_use]
    pub const fn new(seq: SequenceNumber, epoch: u64) -> Self {
        Self { seq, epoch }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@e{}", self.seq, self.epoch)
    }
}

/// Replica state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    /// Serving and receiving live writes
    #[default]
    Active,
    /// Node lost or a forward failed; waiting for recovery
    Down,
    /// Catching up with the shard leader
    Recovering,
    /// Recovery gave up after bounded retries; not serving
    RecoveryFailed,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Down => write!(f, "down"),
            Self::Recovering => write!(f, "recovering"),
            Self::RecoveryFailed => write!(f, "recovery_failed"),
        }
    }
}

/// Event driving a replica state transition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaEvent {
    /// The hosting node stopped or lost its session
    NodeLost,
    /// A live write could not be forwarded to the replica
    ForwardFailed,
    /// The replica (re)joined or was added and must catch up
    RecoveryScheduled,
    /// Catch-up finished
    Recovered,
    /// Catch-up failed too many times
    RecoveryExhausted,
    /// The replica was elected leader with its own data
    Promoted,
}

impl fmt::Display for ReplicaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ReplicaState {
    /// Apply an event, returning the next state or `None` if the transition
    /// is not allowed from the current state.
    #[must_use]
    pub const fn next(self, event: ReplicaEvent) -> Option<Self> {
        use ReplicaEvent as E;
        match (self, event) {
            (_, E::NodeLost) => Some(Self::Down),
            (Self::Active | Self::Recovering, E::ForwardFailed) => Some(Self::Down),
            (Self::Down, E::ForwardFailed) => Some(Self::Down),
            (
                Self::Active | Self::Down | Self::Recovering | Self::RecoveryFailed,
                E::RecoveryScheduled,
            ) => Some(Self::Recovering),
            (Self::Recovering, E::Recovered) => Some(Self::Active),
            (Self::Active | Self::Down | Self::Recovering, E::RecoveryExhausted) => {
                Some(Self::RecoveryFailed)
            }
            (Self::Active | Self::Down | Self::Recovering, E::Promoted) => Some(Self::Active),
            _ => None,
        }
    }

    /// Whether the replica accepts live fan-out writes in this state
    #[must_use]
    pub const fn receives_writes(&self) -> bool {
        matches!(self, Self::Active | Self::Recovering)
    }

    /// Whether the replica serves reads and counts for consistency checks
    #[must_use]
    pub const fn is_serving(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// A replica of a shard as seen by the membership directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRef {
    pub node_id: NodeId,
    pub key: ReplicaKey,
    pub state: ReplicaState,
}

impl fmt::Display for ReplicaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.key, self.node_id, self.state)
    }
}

/// Signal that a node is gone
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureSignal {
    /// Explicit (administrative or fault-injected) stop
    Stopped,
    /// The node's lease ran out without renewal
    SessionExpired,
}

impl fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::SessionExpired => write!(f, "session expired"),
        }
    }
}

/// Identifier of an asynchronous backup job
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a new random job id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a backup job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupStatus {
    Running,
    Success,
    Failed,
}

impl BackupStatus {
    /// Whether the job has finished
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
