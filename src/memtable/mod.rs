// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::key::InternalKey;
use crate::seqno::{is_committed, Lsn};
use crate::statement::{Statement, StatementType};
use crate::{UserKey, UserValue};
use crossbeam_skiplist::SkipMap;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicU64, Ordering::AcqRel, Ordering::Acquire};

/// Monotonic mem id; drives FIFO ordering in the dump queue.
pub type MemId = u64;

/// Statement payload inside a mem; identity lives in the skip-list key.
#[derive(Clone)]
pub(crate) struct MemEntry {
    pub stmt_type: StatementType,
    pub value: UserValue,
    pub upsert_count: u8,
    pub column_mask: u64,
}

impl MemEntry {
    fn from_statement(stmt: &Statement) -> Self {
        Self {
            stmt_type: stmt.stmt_type,
            value: stmt.value.clone(),
            upsert_count: stmt.upsert_count,
            column_mask: stmt.column_mask,
        }
    }

    fn into_statement(self, key: InternalKey) -> Statement {
        Statement {
            key,
            stmt_type: self.stmt_type,
            value: self.value,
            upsert_count: self.upsert_count,
            column_mask: self.column_mask,
        }
    }
}

/// An in-memory sorted multi-version tree inside a range
///
/// The comparator orders first by user key ascending, then by LSN
/// descending, so the newest version of a key comes first. Prepared
/// statements (LSN above [`crate::seqno::TX_LSN_BASE`]) are relabelled
/// in place at commit and do not contribute to `min_lsn`/`max_lsn`
/// until then.
pub struct Mem {
    id: MemId,

    /// Engine generation (snapshot/schema) at creation; a generation
    /// change between inserts forces rotation.
    generation: u64,

    items: SkipMap<InternalKey, MemEntry>,

    /// Approximate retained bytes, for quota and dump accounting.
    used: AtomicU64,

    /// Smallest committed LSN, `u64::MAX` while empty.
    min_lsn: AtomicU64,

    /// Largest committed LSN, `0` while empty.
    max_lsn: AtomicU64,

    /// Transactions that prepared into this mem hold a pin until
    /// commit or rollback; a pinned mem must not be dumped.
    pin_count: AtomicU64,
}

impl Mem {
    #[must_use]
    pub fn new(id: MemId, generation: u64) -> Self {
        Self {
            id,
            generation,
            items: SkipMap::new(),
            used: AtomicU64::new(0),
            min_lsn: AtomicU64::new(u64::MAX),
            max_lsn: AtomicU64::new(0),
            pin_count: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> MemId {
        self.id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Inserts a committed (or replayed) statement.
    ///
    /// Returns the number of bytes retained.
    pub fn insert(&self, stmt: Statement) -> u64 {
        debug_assert!(is_committed(stmt.key.lsn));

        let size = stmt.size() as u64;
        let lsn = stmt.key.lsn;

        self.items
            .insert(stmt.key.clone(), MemEntry::from_statement(&stmt));

        self.used.fetch_add(size, AcqRel);
        self.min_lsn.fetch_min(lsn, AcqRel);
        self.max_lsn.fetch_max(lsn, AcqRel);

        size
    }

    /// Inserts a prepared statement under its tentative LSN.
    ///
    /// `min_lsn`/`max_lsn` are untouched until [`Mem::commit`]
    /// relabels the entry.
    pub fn insert_prepared(&self, stmt: Statement) -> u64 {
        debug_assert!(!is_committed(stmt.key.lsn));

        let size = stmt.size() as u64;

        self.items
            .insert(stmt.key.clone(), MemEntry::from_statement(&stmt));

        self.used.fetch_add(size, AcqRel);

        size
    }

    /// Relabels a prepared entry to its commit LSN.
    ///
    /// Ordering within the key is preserved, since prepare LSNs exceed
    /// any real LSN.
    pub fn commit(&self, user_key: &UserKey, prepare_lsn: Lsn, commit_lsn: Lsn) {
        debug_assert!(!is_committed(prepare_lsn));
        debug_assert!(is_committed(commit_lsn));

        let prepared_key = InternalKey::new(user_key.clone(), prepare_lsn);

        if let Some(entry) = self.items.remove(&prepared_key) {
            self.items.insert(
                InternalKey::new(user_key.clone(), commit_lsn),
                entry.value().clone(),
            );
            self.min_lsn.fetch_min(commit_lsn, AcqRel);
            self.max_lsn.fetch_max(commit_lsn, AcqRel);
        }
    }

    /// Erases a prepared entry after rollback.
    pub fn rollback(&self, user_key: &UserKey, prepare_lsn: Lsn) {
        debug_assert!(!is_committed(prepare_lsn));

        let prepared_key = InternalKey::new(user_key.clone(), prepare_lsn);

        if let Some(entry) = self.items.remove(&prepared_key) {
            let freed = (entry.key().user_key.len()
                + entry.value().value.len()
                + std::mem::size_of::<Statement>()) as u64;
            self.used.fetch_sub(freed, AcqRel);
        }
    }

    /// Returns the newest version of `key` visible below `vlsn`.
    pub fn get(&self, key: &[u8], vlsn: Lsn) -> Option<Statement> {
        if vlsn == 0 {
            return None;
        }

        // Entries of one key are ordered newest-LSN-first, so the first
        // entry at or after (key, vlsn) is the newest visible version.
        let lower_bound = InternalKey::new(key, vlsn);

        let entry = self.items.range(lower_bound..).next()?;

        if &*entry.key().user_key == key {
            Some(entry.value().clone().into_statement(entry.key().clone()))
        } else {
            None
        }
    }

    /// Creates an iterator over all statements.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Statement> + '_ {
        self.items
            .iter()
            .map(|entry| entry.value().clone().into_statement(entry.key().clone()))
    }

    /// Creates an iterator over a range of statements.
    pub(crate) fn range<'a, R: RangeBounds<InternalKey> + 'a>(
        &'a self,
        range: R,
    ) -> impl DoubleEndedIterator<Item = Statement> + 'a {
        self.items
            .range((
                clone_bound(range.start_bound()),
                clone_bound(range.end_bound()),
            ))
            .map(|entry| entry.value().clone().into_statement(entry.key().clone()))
    }

    /// Smallest committed LSN, `None` while no statement committed.
    #[must_use]
    pub fn min_lsn(&self) -> Option<Lsn> {
        match self.min_lsn.load(Acquire) {
            u64::MAX => None,
            lsn => Some(lsn),
        }
    }

    /// Largest committed LSN, `None` while no statement committed.
    #[must_use]
    pub fn max_lsn(&self) -> Option<Lsn> {
        match self.max_lsn.load(Acquire) {
            0 => None,
            lsn => Some(lsn),
        }
    }

    /// Gets the approximate size of the mem in bytes.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, AcqRel);
        debug_assert!(prev > 0, "unbalanced mem unpin");
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Acquire) > 0
    }
}

fn clone_bound(bound: Bound<&InternalKey>) -> Bound<InternalKey> {
    match bound {
        Bound::Included(k) => Bound::Included(k.clone()),
        Bound::Excluded(k) => Bound::Excluded(k.clone()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seqno::TX_LSN_BASE;
    use test_log::test;

    #[test]
    fn mem_mvcc_point_read() {
        let mem = Mem::new(0, 0);

        mem.insert(Statement::replace(*b"a", *b"a1", 1));
        mem.insert(Statement::replace(*b"a", *b"a5", 5));

        assert_eq!(*b"a5", &*mem.get(b"a", Lsn::MAX).unwrap().value);
        assert_eq!(*b"a1", &*mem.get(b"a", 1).unwrap().value);
        assert_eq!(*b"a1", &*mem.get(b"a", 4).unwrap().value);
        assert_eq!(None, mem.get(b"a", 0));
        assert_eq!(None, mem.get(b"b", Lsn::MAX));
    }

    #[test]
    fn mem_lsn_bounds_track_commits_only() {
        let mem = Mem::new(0, 0);

        assert_eq!(None, mem.min_lsn());
        assert_eq!(None, mem.max_lsn());

        mem.insert_prepared(Statement::replace(*b"a", *b"x", TX_LSN_BASE + 1));

        assert_eq!(None, mem.min_lsn(), "prepared inserts do not count");

        mem.insert(Statement::replace(*b"b", *b"y", 7));
        assert_eq!(Some(7), mem.min_lsn());
        assert_eq!(Some(7), mem.max_lsn());

        mem.commit(&(*b"a").into(), TX_LSN_BASE + 1, 9);
        assert_eq!(Some(7), mem.min_lsn());
        assert_eq!(Some(9), mem.max_lsn());
    }

    #[test]
    fn mem_commit_relabels_in_place() {
        let mem = Mem::new(0, 0);
        let key: UserKey = (*b"k").into();

        mem.insert_prepared(Statement::replace(*b"k", *b"v", TX_LSN_BASE + 3));

        // Invisible to any non-global view
        assert_eq!(None, mem.get(b"k", TX_LSN_BASE - 1));

        mem.commit(&key, TX_LSN_BASE + 3, 42);

        let stmt = mem.get(b"k", TX_LSN_BASE - 1).unwrap();
        assert_eq!(42, stmt.key.lsn);
        assert_eq!(*b"v", &*stmt.value);
        assert_eq!(1, mem.len());
    }

    #[test]
    fn mem_rollback_erases() {
        let mem = Mem::new(0, 0);
        let key: UserKey = (*b"k").into();

        mem.insert_prepared(Statement::replace(*b"k", *b"v", TX_LSN_BASE + 3));
        mem.rollback(&key, TX_LSN_BASE + 3);

        assert!(mem.is_empty());
        assert_eq!(None, mem.get(b"k", Lsn::MAX));
    }

    #[test]
    fn mem_pin_balance() {
        let mem = Mem::new(0, 0);
        assert!(!mem.is_pinned());

        mem.pin();
        mem.pin();
        assert!(mem.is_pinned());

        mem.unpin();
        assert!(mem.is_pinned());

        mem.unpin();
        assert!(!mem.is_pinned());
    }

    #[test]
    fn mem_statement_invariant() {
        let mem = Mem::new(0, 0);

        for lsn in [3, 9, 4, 7] {
            mem.insert(Statement::replace(*b"k", *b"v", lsn));
        }

        let min = mem.min_lsn().unwrap();
        let max = mem.max_lsn().unwrap();

        for stmt in mem.iter() {
            assert!(min <= stmt.key.lsn && stmt.key.lsn <= max);
        }
    }
}
