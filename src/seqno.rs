// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire, Release},
    },
    Arc,
};

/// Log sequence number - a monotonically increasing counter
/// assigned by the host write-ahead log to each committed write.
///
/// A version with a higher LSN shadows a version of the
/// same key with a lower LSN. This enables MVCC.
///
/// Stale versions are lazily garbage-collected during compaction.
pub type Lsn = u64;

/// Committed LSNs stay below this base; a statement written during
/// transaction prepare carries `TX_LSN_BASE + psn` until its commit
/// LSN is known. Relabeling a prepared statement to its commit LSN
/// never reorders it, since every prepare LSN exceeds every real LSN.
pub const TX_LSN_BASE: Lsn = 1 << 62;

/// The visibility ceiling of the global read view; every version,
/// prepared statements included, is visible below it.
pub const VLSN_INF: Lsn = u64::MAX;

/// Returns `true` if the LSN belongs to a committed statement.
#[must_use]
pub fn is_committed(lsn: Lsn) -> bool {
    lsn < TX_LSN_BASE
}

/// Thread-safe sequence number generator
///
/// Used for LSNs handed in by the host, prepare sequence numbers,
/// and object ids (mems, ranges, runs).
#[derive(Clone, Default, Debug)]
pub struct SequenceNumberCounter(Arc<AtomicU64>);

impl SequenceNumberCounter {
    /// Creates a new counter, setting it to some previous value
    #[must_use]
    pub fn new(prev: u64) -> Self {
        Self(Arc::new(AtomicU64::new(prev)))
    }

    /// Gets the current value, without incrementing the counter.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Acquire)
    }

    /// Gets the next sequence number.
    #[must_use]
    #[allow(clippy::missing_panics_doc, reason = "we should never run out of u64s")]
    pub fn next(&self) -> u64 {
        let seqno = self.0.fetch_add(1, AcqRel) + 1;

        // Keep clear of the prepare LSN space.
        assert!(seqno < TX_LSN_BASE, "ran out of sequence numbers");

        seqno
    }

    /// Sets the sequence number.
    pub fn set(&self, seqno: u64) {
        self.0.store(seqno, Release);
    }

    /// Maximizes the sequence number.
    pub fn fetch_max(&self, seqno: u64) {
        self.0.fetch_max(seqno, AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn seqno_next_is_one_based() {
        let counter = SequenceNumberCounter::default();
        assert_eq!(1, counter.next());
        assert_eq!(2, counter.next());
        assert_eq!(2, counter.get());
    }

    #[test]
    #[should_panic = "ran out of sequence numbers"]
    fn seqno_overflow() {
        let counter = SequenceNumberCounter::new(TX_LSN_BASE - 1);
        let _ = counter.next();
    }

    #[test]
    fn seqno_committed_split() {
        assert!(is_committed(0));
        assert!(is_committed(TX_LSN_BASE - 1));
        assert!(!is_committed(TX_LSN_BASE));
        assert!(!is_committed(VLSN_INF));
    }
}
