//! Local document store
//!
//! The store is the only component that touches replica data. The leader
//! path assigns sequence numbers (`append`); the replica path applies entries
//! issued by a leader (`apply`). Queries only see state as of the last
//! `commit`.

use crate::document::{Document, UpdateLogEntry, UpdateOp};
use crate::query::{Query, QueryResult};
use crate::snapshot::{self, SnapshotManifest};
use crate::update_log::UpdateLog;
use docio_common::{
    ContentDigest, DigestBuilder, DocId, Error, LogPosition, Result, SequenceNumber,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Point-in-time copy of a store
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreImage {
    pub docs: BTreeMap<DocId, Document>,
    /// Last update reflected in `docs`
    pub position: LogPosition,
}

impl StoreImage {
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Local store adapter
pub trait DocumentStore: Send + Sync {
    /// Assign the next sequence number to `op` and apply it (leader path)
    fn append(&self, op: UpdateOp, epoch: u64) -> Result<UpdateLogEntry>;

    /// Apply an entry issued by a leader (replica path)
    ///
    /// Returns `Ok(false)` if the entry was already applied. An entry that
    /// skips ahead of the applied sequence fails with `SequenceGap`.
    fn apply(&self, entry: &UpdateLogEntry) -> Result<bool>;

    /// Make applied updates visible to queries
    fn commit(&self) -> Result<()>;

    /// Run a query against the committed view
    fn query(&self, query: &Query) -> QueryResult;

    /// Position of the last applied update
    fn applied_position(&self) -> LogPosition;

    /// Up to `limit` retained entries with `seq > after`
    fn updates_since(&self, after: SequenceNumber, limit: usize) -> Result<Vec<UpdateLogEntry>>;

    /// Epoch of the entry at `seq`, if still known
    fn epoch_at(&self, seq: SequenceNumber) -> Option<u64>;

    /// Copy of every applied document plus the applied position
    fn export(&self) -> StoreImage;

    /// Replace the whole store with `image` and commit it
    fn install(&self, image: StoreImage) -> Result<()>;

    /// Number of committed documents
    fn doc_count(&self) -> u64;

    /// Digest of the committed documents in id order
    fn digest(&self) -> Result<ContentDigest>;

    /// Drop retained log entries with `seq <= through`
    fn prune_log_through(&self, through: SequenceNumber) -> usize;

    /// Write the committed view as a snapshot artifact into `dir`
    fn snapshot_to(&self, dir: &Path) -> Result<SnapshotManifest>;

    fn applied_sequence(&self) -> SequenceNumber {
        self.applied_position().seq
    }

    fn add(&self, doc: Document) -> Result<UpdateLogEntry> {
        self.append(UpdateOp::Add(doc), self.applied_position().epoch)
    }

    fn update(&self, doc: Document) -> Result<UpdateLogEntry> {
        self.append(UpdateOp::Update(doc), self.applied_position().epoch)
    }

    fn delete(&self, id: DocId) -> Result<UpdateLogEntry> {
        self.append(UpdateOp::Delete(id), self.applied_position().epoch)
    }
}

struct StoreInner {
    /// Applied (possibly uncommitted) documents
    docs: BTreeMap<DocId, Document>,
    /// View served to queries
    committed: Arc<BTreeMap<DocId, Document>>,
    /// Position of `committed`
    committed_position: LogPosition,
    applied: LogPosition,
    log: UpdateLog,
}

/// In-memory `DocumentStore`
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(max_log_entries: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                docs: BTreeMap::new(),
                committed: Arc::new(BTreeMap::new()),
                committed_position: LogPosition::ZERO,
                applied: LogPosition::ZERO,
                log: UpdateLog::new(max_log_entries),
            }),
        }
    }

    /// Load a store from a snapshot directory
    pub fn restore(dir: &Path, max_log_entries: usize) -> Result<Self> {
        let store = Self::new(max_log_entries);
        store.install(snapshot::read_snapshot(dir)?)?;
        Ok(store)
    }

    /// Position of the committed view
    pub fn committed_position(&self) -> LogPosition {
        self.inner.read().committed_position
    }

    /// Number of retained log entries
    pub fn log_len(&self) -> usize {
        self.inner.read().log.len()
    }

    fn apply_op(docs: &mut BTreeMap<DocId, Document>, op: &UpdateOp) {
        match op {
            UpdateOp::Add(doc) => {
                docs.insert(doc.id().clone(), doc.clone());
            }
            UpdateOp::Update(doc) => {
                docs.entry(doc.id().clone())
                    .and_modify(|existing| existing.merge(doc))
                    .or_insert_with(|| doc.clone());
            }
            UpdateOp::Delete(id) => {
                docs.remove(id);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl DocumentStore for MemoryStore {
    fn append(&self, op: UpdateOp, epoch: u64) -> Result<UpdateLogEntry> {
        op.validate()?;
        let mut inner = self.inner.write();
        if epoch < inner.applied.epoch {
            return Err(Error::invalid_argument(format!(
                "append at epoch {epoch} behind store epoch {}",
                inner.applied.epoch
            )));
        }
        let entry = UpdateLogEntry::new(inner.applied.seq + 1, epoch, op);
        if inner.log.last_seq() != inner.applied.seq {
            let base = inner.applied.seq;
            inner.log.reset(base);
        }
        inner.log.append(entry.clone())?;
        Self::apply_op(&mut inner.docs, &entry.op);
        inner.applied = entry.position();
        trace!("Appended {} {} at {}", entry.op.kind(), entry.op.doc_id(), entry.seq);
        Ok(entry)
    }

    fn apply(&self, entry: &UpdateLogEntry) -> Result<bool> {
        let mut inner = self.inner.write();
        if entry.seq <= inner.applied.seq {
            return Ok(false);
        }
        let expected = inner.applied.seq + 1;
        if entry.seq != expected {
            return Err(Error::SequenceGap {
                expected,
                actual: entry.seq,
            });
        }
        if inner.log.last_seq() != inner.applied.seq {
            let base = inner.applied.seq;
            inner.log.reset(base);
        }
        inner.log.append(entry.clone())?;
        Self::apply_op(&mut inner.docs, &entry.op);
        inner.applied = entry.position();
        Ok(true)
    }

    fn commit(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.committed_position != inner.applied {
            inner.committed = Arc::new(inner.docs.clone());
            inner.committed_position = inner.applied;
        }
        Ok(())
    }

    fn query(&self, query: &Query) -> QueryResult {
        let committed = Arc::clone(&self.inner.read().committed);
        query.execute(committed.values())
    }

    fn applied_position(&self) -> LogPosition {
        self.inner.read().applied
    }

    fn updates_since(&self, after: SequenceNumber, limit: usize) -> Result<Vec<UpdateLogEntry>> {
        self.inner.read().log.range_after(after, limit)
    }

    fn epoch_at(&self, seq: SequenceNumber) -> Option<u64> {
        let inner = self.inner.read();
        if seq == 0 {
            return Some(0);
        }
        if seq == inner.applied.seq {
            return Some(inner.applied.epoch);
        }
        inner.log.entry(seq).map(|e| e.epoch)
    }

    fn export(&self) -> StoreImage {
        let inner = self.inner.read();
        StoreImage {
            docs: inner.docs.clone(),
            position: inner.applied,
        }
    }

    fn install(&self, image: StoreImage) -> Result<()> {
        let mut inner = self.inner.write();
        let count = image.docs.len();
        inner.committed = Arc::new(image.docs.clone());
        inner.docs = image.docs;
        inner.applied = image.position;
        inner.committed_position = image.position;
        inner.log.reset(image.position.seq);
        debug!("Installed image of {} docs at {}", count, image.position);
        Ok(())
    }

    fn doc_count(&self) -> u64 {
        self.inner.read().committed.len() as u64
    }

    fn digest(&self) -> Result<ContentDigest> {
        let committed = Arc::clone(&self.inner.read().committed);
        let mut builder = DigestBuilder::new();
        for doc in committed.values() {
            builder.record(&doc.to_bytes()?);
        }
        Ok(builder.finish())
    }

    fn prune_log_through(&self, through: SequenceNumber) -> usize {
        self.inner.write().log.prune_through(through)
    }

    fn snapshot_to(&self, dir: &Path) -> Result<SnapshotManifest> {
        let (committed, position) = {
            let inner = self.inner.read();
            (Arc::clone(&inner.committed), inner.committed_position)
        };
        snapshot::write_snapshot(dir, &committed, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(id: u64, text: &str) -> Document {
        Document::new(DocId::from(id)).with_field("t1", text)
    }

    #[test]
    fn test_visibility_after_commit() {
        let store = MemoryStore::default();
        store.add(doc(1, "a")).unwrap();
        assert_eq!(store.doc_count(), 0);
        assert_eq!(store.query(&Query::all()).num_found, 0);
        store.commit().unwrap();
        assert_eq!(store.doc_count(), 1);
        assert_eq!(store.applied_sequence(), 1);
    }

    #[test]
    fn test_delete_then_readd() {
        let store = MemoryStore::default();
        store.add(doc(1, "a")).unwrap();
        store.delete(DocId::from(1)).unwrap();
        store.commit().unwrap();
        assert_eq!(store.query(&Query::id(DocId::from(1))).num_found, 0);
        store.add(doc(1, "b")).unwrap();
        store.commit().unwrap();
        assert_eq!(store.query(&Query::id(DocId::from(1))).num_found, 1);
    }

    #[test]
    fn test_partial_update() {
        let store = MemoryStore::default();
        store.add(doc(1, "a").with_field("n", 1)).unwrap();
        store
            .update(Document::new(DocId::from(1)).with_field("n", 2))
            .unwrap();
        store.commit().unwrap();
        let result = store.query(&Query::id(DocId::from(1)));
        assert_eq!(result.docs[0].get("t1"), Some(&json!("a")));
        assert_eq!(result.docs[0].get("n"), Some(&json!(2)));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let leader = MemoryStore::default();
        let replica = MemoryStore::default();
        let e1 = leader.append(UpdateOp::Add(doc(1, "a")), 1).unwrap();
        let e2 = leader.append(UpdateOp::Add(doc(2, "b")), 1).unwrap();

        assert!(replica.apply(&e1).unwrap());
        assert!(replica.apply(&e2).unwrap());
        assert!(!replica.apply(&e1).unwrap());
        assert!(!replica.apply(&e2).unwrap());

        leader.commit().unwrap();
        replica.commit().unwrap();
        assert_eq!(leader.digest().unwrap(), replica.digest().unwrap());
        assert_eq!(replica.applied_position(), LogPosition::new(2, 1));
    }

    #[test]
    fn test_apply_gap_rejected() {
        let leader = MemoryStore::default();
        let replica = MemoryStore::default();
        leader.add(doc(1, "a")).unwrap();
        let e2 = leader.add(doc(2, "b")).unwrap();
        let err = replica.apply(&e2).unwrap_err();
        assert!(matches!(err, Error::SequenceGap { expected: 1, actual: 2 }));
    }

    #[test]
    fn test_updates_since_and_truncation() {
        let store = MemoryStore::new(5);
        for i in 1..=8 {
            store.add(doc(i, "x")).unwrap();
        }
        assert_eq!(store.updates_since(5, 10).unwrap().len(), 3);
        assert!(matches!(
            store.updates_since(1, 10),
            Err(Error::LogTruncated { .. })
        ));
        assert_eq!(store.prune_log_through(6), 3);
        assert_eq!(store.log_len(), 2);
    }

    #[test]
    fn test_epoch_at() {
        let store = MemoryStore::default();
        store.append(UpdateOp::Add(doc(1, "a")), 1).unwrap();
        store.append(UpdateOp::Add(doc(2, "b")), 3).unwrap();
        assert_eq!(store.epoch_at(0), Some(0));
        assert_eq!(store.epoch_at(1), Some(1));
        assert_eq!(store.epoch_at(2), Some(3));
        assert_eq!(store.epoch_at(9), None);
        assert!(store.append(UpdateOp::Add(doc(3, "c")), 2).is_err());
    }

    #[test]
    fn test_export_install() {
        let source = MemoryStore::default();
        for i in 1..=10 {
            source.append(UpdateOp::Add(doc(i, "x")), 2).unwrap();
        }
        source.commit().unwrap();

        let target = MemoryStore::default();
        target.add(doc(99, "stale")).unwrap();
        target.install(source.export()).unwrap();

        assert_eq!(target.doc_count(), 10);
        assert_eq!(target.applied_position(), LogPosition::new(10, 2));
        assert_eq!(target.digest().unwrap(), source.digest().unwrap());
        assert!(target.updates_since(10, 5).unwrap().is_empty());

        let next = source.append(UpdateOp::Delete(DocId::from(1)), 2).unwrap();
        assert!(target.apply(&next).unwrap());
    }

    #[test]
    fn test_snapshot_and_restore() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::default();
        for i in 1..=5 {
            store.add(doc(i, "snap")).unwrap();
        }
        store.commit().unwrap();
        store.add(doc(6, "uncommitted")).unwrap();

        let manifest = store.snapshot_to(dir.path()).unwrap();
        assert_eq!(manifest.doc_count, 5);
        assert_eq!(manifest.position.seq, 5);

        let restored = MemoryStore::restore(dir.path(), 100).unwrap();
        assert_eq!(restored.doc_count(), 5);
        assert_eq!(restored.digest().unwrap(), manifest.digest);
    }

    #[test]
    fn test_malformed_op_rejected() {
        let store = MemoryStore::default();
        let bad = Document::new(DocId::from(1)).with_field("", 1);
        assert!(matches!(store.add(bad), Err(Error::MalformedDocument(_))));
        assert_eq!(store.applied_sequence(), 0);
    }
}
