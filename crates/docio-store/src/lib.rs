//! DocIO Store - Local store adapter
//!
//! This crate implements the per-replica document store used by every
//! DocIO node:
//! - Documents keyed by id with JSON fields
//! - A bounded, sequence-indexed update log for peer-sync
//! - Commit-based visibility for queries
//! - Point-in-time images for full replication
//! - On-disk snapshot artifacts for backups

pub mod document;
pub mod query;
pub mod snapshot;
pub mod store;
pub mod update_log;

// Re-exports
pub use document::{Document, UpdateLogEntry, UpdateOp};
pub use query::{Filter, Query, QueryResult, SortField, SortOrder};
pub use snapshot::{SnapshotManifest, read_snapshot, write_snapshot};
pub use store::{DocumentStore, MemoryStore, StoreImage};
pub use update_log::UpdateLog;
