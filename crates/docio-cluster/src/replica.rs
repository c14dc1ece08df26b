//! Replica apply queue
//!
//! Every mutation of a replica goes through one mutex: leader appends, live
//! fan-out deliveries, recovery replay and image installs. Entries are
//! applied strictly in sequence order; an entry that arrives ahead of its
//! predecessor is buffered until the gap is filled, and an entry that was
//! already applied is a no-op.

use docio_common::{Error, LogPosition, ReplicaKey, Result, SequenceNumber};
use docio_store::{DocumentStore, StoreImage, UpdateLogEntry, UpdateOp};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// What happened to a delivered entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied, together with this many buffered successors
    Applied(usize),
    /// Already applied earlier
    Duplicate,
    /// Held until its predecessor arrives
    Buffered,
}

impl ApplyOutcome {
    /// Whether the entry is reflected in the store
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_) | Self::Duplicate)
    }
}

#[derive(Default)]
struct ApplyQueue {
    pending: BTreeMap<SequenceNumber, UpdateLogEntry>,
}

pub struct Replica {
    key: ReplicaKey,
    store: Arc<dyn DocumentStore>,
    queue: Mutex<ApplyQueue>,
    max_buffered: usize,
}

impl Replica {
    pub fn new(key: ReplicaKey, store: Arc<dyn DocumentStore>, max_buffered: usize) -> Self {
        Self {
            key,
            store,
            queue: Mutex::new(ApplyQueue::default()),
            max_buffered,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &ReplicaKey {
        &self.key
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    #[must_use]
    pub fn position(&self) -> LogPosition {
        self.store.applied_position()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Assign a sequence number as shard leader
    pub fn leader_append(&self, op: UpdateOp, epoch: u64) -> Result<UpdateLogEntry> {
        let _queue = self.queue.lock();
        self.store.append(op, epoch)
    }

    /// Deliver one entry from the leader
    pub fn deliver(&self, entry: UpdateLogEntry) -> Result<ApplyOutcome> {
        let mut queue = self.queue.lock();
        self.deliver_locked(&mut queue, entry)
    }

    /// Deliver a batch of entries in order; returns how many were applied
    pub fn replay(&self, entries: Vec<UpdateLogEntry>) -> Result<usize> {
        let mut queue = self.queue.lock();
        let mut applied = 0;
        for entry in entries {
            if let ApplyOutcome::Applied(n) = self.deliver_locked(&mut queue, entry)? {
                applied += n;
            }
        }
        Ok(applied)
    }

    fn deliver_locked(&self, queue: &mut ApplyQueue, entry: UpdateLogEntry) -> Result<ApplyOutcome> {
        let applied = self.store.applied_sequence();
        if entry.seq <= applied {
            return Ok(ApplyOutcome::Duplicate);
        }
        if entry.seq > applied + 1 {
            if queue.pending.len() >= self.max_buffered && !queue.pending.contains_key(&entry.seq)
            {
                return Err(Error::SequenceGap {
                    expected: applied + 1,
                    actual: entry.seq,
                });
            }
            trace!("{}: buffering seq {} (applied {})", self.key, entry.seq, applied);
            queue.pending.insert(entry.seq, entry);
            return Ok(ApplyOutcome::Buffered);
        }
        self.store.apply(&entry)?;
        Ok(ApplyOutcome::Applied(1 + self.drain(queue)?))
    }

    /// Apply buffered entries that became contiguous
    fn drain(&self, queue: &mut ApplyQueue) -> Result<usize> {
        let mut drained = 0;
        loop {
            let applied = self.store.applied_sequence();
            // Stale entries already covered by the store
            while queue
                .pending
                .first_key_value()
                .is_some_and(|(seq, _)| *seq <= applied)
            {
                queue.pending.pop_first();
            }
            let Some(entry) = queue.pending.remove(&(applied + 1)) else {
                return Ok(drained);
            };
            self.store.apply(&entry)?;
            drained += 1;
        }
    }

    /// Drop buffered entries issued by leaders older than `epoch`
    pub fn discard_stale(&self, epoch: u64) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.pending.len();
        queue.pending.retain(|_, e| e.epoch >= epoch);
        let dropped = before - queue.pending.len();
        if dropped > 0 {
            debug!("{}: dropped {} buffered entries older than epoch {}", self.key, dropped, epoch);
        }
        dropped
    }

    /// Replace the replica's contents with a leader image
    ///
    /// Buffered entries covered by the image are discarded; later ones are
    /// applied on top. Returns how many buffered entries were applied.
    pub fn install_image(&self, image: StoreImage) -> Result<usize> {
        let mut queue = self.queue.lock();
        let position = image.position;
        self.store.install(image)?;
        queue.pending.retain(|seq, _| *seq > position.seq);
        self.drain(&mut queue)
    }
}
