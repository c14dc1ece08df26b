//! Bounded update log
//!
//! Each shard leader keeps the most recent updates in memory so lagging
//! replicas can peer-sync. The log covers the contiguous range
//! `(base, base + len]`; entries at or below `base` have been pruned, either
//! because every replica acknowledged them or because the hard cap was hit.

use crate::document::UpdateLogEntry;
use docio_common::{Error, Result, SequenceNumber};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct UpdateLog {
    entries: VecDeque<UpdateLogEntry>,
    /// Sequence number immediately preceding the first retained entry
    base: SequenceNumber,
    max_retained: usize,
}

impl UpdateLog {
    #[must_use]
    pub fn new(max_retained: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            base: 0,
            max_retained: max_retained.max(1),
        }
    }

    /// Drop every entry and restart the log after `base`
    pub fn reset(&mut self, base: SequenceNumber) {
        self.entries.clear();
        self.base = base;
    }

    /// Append the next entry; sequence numbers must be contiguous
    pub fn append(&mut self, entry: UpdateLogEntry) -> Result<()> {
        let expected = self.last_seq() + 1;
        if entry.seq != expected {
            return Err(Error::SequenceGap {
                expected,
                actual: entry.seq,
            });
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.max_retained {
            self.pop_front();
        }
        Ok(())
    }

    /// Sequence number of the newest entry (or the base if empty)
    #[must_use]
    pub fn last_seq(&self) -> SequenceNumber {
        self.base + self.entries.len() as u64
    }

    /// Sequence number of the oldest retained entry
    #[must_use]
    pub fn oldest_seq(&self) -> Option<SequenceNumber> {
        self.entries.front().map(|e| e.seq)
    }

    /// Whether entries after `after` can be served without a gap
    #[must_use]
    pub fn covers(&self, after: SequenceNumber) -> bool {
        after >= self.base
    }

    /// Up to `limit` entries with `seq > after`, in order
    ///
    /// Fails with `LogTruncated` if entries after `after` were pruned.
    pub fn range_after(&self, after: SequenceNumber, limit: usize) -> Result<Vec<UpdateLogEntry>> {
        if !self.covers(after) {
            return Err(Error::LogTruncated {
                requested: after,
                oldest: self.base + 1,
            });
        }
        let skip = usize::try_from(after - self.base).unwrap_or(usize::MAX);
        Ok(self.entries.iter().skip(skip).take(limit).cloned().collect())
    }

    #[must_use]
    pub fn entry(&self, seq: SequenceNumber) -> Option<&UpdateLogEntry> {
        if seq <= self.base {
            return None;
        }
        let idx = usize::try_from(seq - self.base - 1).ok()?;
        self.entries.get(idx)
    }

    /// Drop entries with `seq <= through`; returns how many were removed
    pub fn prune_through(&mut self, through: SequenceNumber) -> usize {
        let mut removed = 0;
        while self.entries.front().is_some_and(|e| e.seq <= through) {
            self.pop_front();
            removed += 1;
        }
        removed
    }

    fn pop_front(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            self.base = entry.seq;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::UpdateOp;
    use docio_common::DocId;

    fn entry(seq: u64) -> UpdateLogEntry {
        UpdateLogEntry::new(seq, 1, UpdateOp::Delete(DocId::from(seq)))
    }

    fn log_with(n: u64, cap: usize) -> UpdateLog {
        let mut log = UpdateLog::new(cap);
        for seq in 1..=n {
            log.append(entry(seq)).unwrap();
        }
        log
    }

    #[test]
    fn test_append_contiguous() {
        let mut log = log_with(3, 10);
        assert_eq!(log.last_seq(), 3);
        let err = log.append(entry(5)).unwrap_err();
        assert!(matches!(err, Error::SequenceGap { expected: 4, actual: 5 }));
    }

    #[test]
    fn test_range_after() {
        let log = log_with(10, 100);
        let range = log.range_after(4, 3).unwrap();
        assert_eq!(range.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![5, 6, 7]);
        assert!(log.range_after(10, 5).unwrap().is_empty());
        assert_eq!(log.range_after(0, 100).unwrap().len(), 10);
    }

    #[test]
    fn test_cap_truncates() {
        let log = log_with(10, 4);
        assert_eq!(log.len(), 4);
        assert_eq!(log.oldest_seq(), Some(7));
        assert!(log.range_after(6, 10).is_ok());
        let err = log.range_after(5, 10).unwrap_err();
        assert!(matches!(err, Error::LogTruncated { requested: 5, oldest: 7 }));
    }

    #[test]
    fn test_prune_and_entry() {
        let mut log = log_with(6, 100);
        assert_eq!(log.prune_through(3), 3);
        assert!(log.entry(3).is_none());
        assert_eq!(log.entry(4).map(|e| e.seq), Some(4));
        assert_eq!(log.last_seq(), 6);
        assert_eq!(log.prune_through(100), 3);
        assert!(log.is_empty());
        assert_eq!(log.last_seq(), 6);
        log.append(entry(7)).unwrap();
    }

    #[test]
    fn test_reset() {
        let mut log = log_with(5, 100);
        log.reset(40);
        assert!(log.is_empty());
        assert!(!log.covers(39));
        log.append(entry(41)).unwrap();
        assert_eq!(log.entry(41).map(|e| e.seq), Some(41));
    }
}
