// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Optimistic MVCC: serial prepare plus read-view-on-conflict.
//!
//! Writes are buffered in a per-transaction write set and flushed into
//! the ranges' active mems at prepare under a tentative LSN. Commit
//! relabels the tentative LSNs; rollback erases them. A prepare that
//! would invalidate what another READY transaction has read promotes
//! that reader to a read view pinned just before the commit.

pub(crate) mod read_set;
pub mod read_view;
pub(crate) mod write_set;

use crate::index::{Index, IndexId};
use crate::memtable::Mem;
use crate::range::Range;
use crate::seqno::{Lsn, SequenceNumberCounter, TX_LSN_BASE, VLSN_INF};
use crate::statement::{Statement, StatementType, UPSERT_THRESHOLD};
use crate::UserKey;
use read_view::ReadView;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering::AcqRel};
use std::sync::{Arc, Mutex, RwLock};
use write_set::WriteSet;

/// Monotonic transaction id.
pub type TxId = u64;

/// Shared registry of live indexes.
pub(crate) type IndexRegistry = Arc<RwLock<FxHashMap<IndexId, Arc<Index>>>>;

/// Transaction state machine
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxState {
    /// Accepting reads and writes
    Ready,

    /// Prepared, awaiting its commit LSN
    Commit,

    /// Aborted by another transaction's prepare; every subsequent
    /// operation fails with a conflict
    Abort,
}

/// A write flushed to a mem at prepare.
struct Applied {
    range: Arc<Range>,
    mem: Arc<Mem>,
    key: UserKey,
    prepare_lsn: Lsn,

    /// The statement's upsert chain hit the squash threshold
    squash_on_commit: bool,

    index_id: IndexId,
}

/// One undo step for savepoint rollback.
struct UndoEntry {
    index_id: IndexId,
    key: UserKey,
    prev: Option<Statement>,
}

struct TxData {
    state: TxState,
    psn: u64,

    /// `None` means the global read view
    read_view: Option<Arc<ReadView>>,

    /// Read view created on behalf of this transaction while it was
    /// the last prepared one; stamped with the commit LSN
    stamp_view: Option<Arc<ReadView>>,

    write_set: WriteSet,
    undo: Vec<UndoEntry>,

    /// Keys tracked in per-index read sets, for cleanup
    reads: Vec<(IndexId, UserKey)>,

    applied: Vec<Applied>,
}

struct ManagerInner {
    txs: FxHashMap<TxId, TxData>,

    /// Prepare sequence counter; orders only unprepared/preparing
    /// transactions
    psn: u64,

    /// Last committed LSN
    lsn: Lsn,

    last_prepared: Option<TxId>,

    /// Active read views, oldest first
    read_views: Vec<Arc<ReadView>>,
}

/// Counters the engine keeps about transaction traffic.
#[derive(Default)]
pub struct TxStats {
    pub tx_conflict: AtomicU64,
    pub tx_rollback: AtomicU64,
    pub tx_commit: AtomicU64,
    pub upsert_squash_queued: AtomicU64,
}

/// What a commit asks the environment to do next.
pub(crate) struct CommitOutcome {
    /// Ranges whose mem LSN bounds moved; the scheduler re-sorts them
    pub dirty_ranges: Vec<Arc<Range>>,

    /// Keys whose upsert chains hit the threshold
    pub squash: Vec<(IndexId, UserKey)>,
}

pub struct TxManager {
    inner: Mutex<ManagerInner>,

    indexes: IndexRegistry,

    tx_ids: SequenceNumberCounter,

    pub stats: TxStats,
}

impl TxManager {
    pub(crate) fn new(indexes: IndexRegistry) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                txs: FxHashMap::default(),
                psn: 0,
                lsn: 0,
                last_prepared: None,
                read_views: Vec::new(),
            }),
            indexes,
            tx_ids: SequenceNumberCounter::default(),
            stats: TxStats::default(),
        }
    }

    /// Last committed LSN.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn lsn(&self) -> Lsn {
        self.inner.lock().expect("lock is poisoned").lsn
    }

    /// Fast-forwards the committed LSN (recovery replay).
    #[allow(clippy::expect_used)]
    pub(crate) fn set_lsn(&self, lsn: Lsn) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.lsn = inner.lsn.max(lsn);
    }

    /// The lowest LSN any current or future read view can observe;
    /// history below it is garbage during compaction.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn oldest_vlsn(&self) -> Lsn {
        let inner = self.inner.lock().expect("lock is poisoned");

        inner
            .read_views
            .iter()
            .map(|rv| rv.vlsn())
            .min()
            .unwrap_or(inner.lsn)
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn begin(&self) -> TxId {
        let id = self.tx_ids.next();

        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.txs.insert(
            id,
            TxData {
                state: TxState::Ready,
                psn: 0,
                read_view: None,
                stamp_view: None,
                write_set: WriteSet::new(),
                undo: Vec::new(),
                reads: Vec::new(),
                applied: Vec::new(),
            },
        );

        id
    }

    #[must_use]
    #[allow(clippy::expect_used)]
    pub(crate) fn exists(&self, tx_id: TxId) -> bool {
        self.inner
            .lock()
            .expect("lock is poisoned")
            .txs
            .contains_key(&tx_id)
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn state(&self, tx_id: TxId) -> Option<TxState> {
        self.inner
            .lock()
            .expect("lock is poisoned")
            .txs
            .get(&tx_id)
            .map(|tx| tx.state)
    }

    /// Buffers a write into the transaction's write set.
    #[allow(clippy::expect_used)]
    pub(crate) fn write(
        &self,
        tx_id: TxId,
        index: &Index,
        stmt: Statement,
    ) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let tx = inner.txs.get_mut(&tx_id).ok_or(crate::Error::Conflict)?;

        if tx.state != TxState::Ready {
            self.stats.tx_conflict.fetch_add(1, AcqRel);
            return Err(crate::Error::Conflict);
        }

        let key = stmt.key.user_key.clone();
        let prev = tx
            .write_set
            .insert(index.id(), stmt, &*index.upsert_executor);

        tx.undo.push(UndoEntry {
            index_id: index.id(),
            key,
            prev,
        });

        Ok(())
    }

    /// The visibility ceiling of the transaction's reads.
    #[allow(clippy::expect_used)]
    pub(crate) fn read_vlsn(&self, tx_id: TxId) -> crate::Result<Lsn> {
        let inner = self.inner.lock().expect("lock is poisoned");

        let tx = inner.txs.get(&tx_id).ok_or(crate::Error::Conflict)?;

        match &tx.read_view {
            Some(rv) if rv.is_aborted() => Err(crate::Error::ReadViewAborted),
            Some(rv) => Ok(rv.vlsn()),
            None => Ok(VLSN_INF),
        }
    }

    /// Remembers a read in the per-index read set.
    ///
    /// Reads are only tracked while the transaction still sees the
    /// global view; reading a key the transaction itself already
    /// REPLACEd or DELETEd is serializable by itself.
    #[allow(clippy::expect_used)]
    pub(crate) fn track_read(
        &self,
        tx_id: TxId,
        index: &Index,
        key: &UserKey,
        is_gap: bool,
    ) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let tx = inner.txs.get_mut(&tx_id).ok_or(crate::Error::Conflict)?;

        if tx.state == TxState::Abort {
            return Err(crate::Error::Conflict);
        }

        if tx.read_view.is_some() {
            return Ok(());
        }

        if !is_gap {
            if let Some(own) = tx.write_set.get(index.id(), key) {
                if matches!(
                    own.stmt_type,
                    StatementType::Replace | StatementType::Delete
                ) {
                    return Ok(());
                }
            }
        }

        index
            .read_set
            .lock()
            .expect("lock is poisoned")
            .track(key.clone(), tx_id, is_gap);

        tx.reads.push((index.id(), key.clone()));

        Ok(())
    }

    /// Number of buffered operations; savepoint marker.
    #[allow(clippy::expect_used)]
    pub(crate) fn savepoint(&self, tx_id: TxId) -> usize {
        self.inner
            .lock()
            .expect("lock is poisoned")
            .txs
            .get(&tx_id)
            .map_or(0, |tx| tx.undo.len())
    }

    /// Rolls the write set back to a savepoint.
    #[allow(clippy::expect_used)]
    pub(crate) fn rollback_to_savepoint(
        &self,
        tx_id: TxId,
        savepoint: usize,
    ) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let tx = inner.txs.get_mut(&tx_id).ok_or(crate::Error::Conflict)?;

        if tx.state != TxState::Ready {
            return Err(crate::Error::Conflict);
        }

        while tx.undo.len() > savepoint {
            #[allow(clippy::expect_used)]
            let entry = tx.undo.pop().expect("undo log is long enough");
            tx.write_set.restore(entry.index_id, &entry.key, entry.prev);
        }

        Ok(())
    }

    /// Write-set probe for the merge source.
    #[allow(clippy::expect_used)]
    pub(crate) fn write_set_seek(
        &self,
        tx_id: TxId,
        index_id: IndexId,
        forward: bool,
        from: Option<(UserKey, bool)>,
    ) -> Option<Statement> {
        let inner = self.inner.lock().expect("lock is poisoned");
        let tx = inner.txs.get(&tx_id)?;
        tx.write_set.seek(index_id, forward, from)
    }

    /// Creates or reuses the read view at the current observation
    /// point: the tentative LSN of the pending prepared transaction if
    /// any, else the last committed LSN.
    fn read_view_at_observation_point(inner: &mut ManagerInner) -> Arc<ReadView> {
        let (target, stamp_tx) = match inner.last_prepared {
            Some(tid) => {
                let psn = inner.txs.get(&tid).map_or(0, |tx| tx.psn);
                (TX_LSN_BASE + psn, Some(tid))
            }
            None => (inner.lsn, None),
        };

        if let Some(tail) = inner.read_views.last() {
            if tail.vlsn() == target && !tail.is_aborted() {
                tail.ref_inc();
                return tail.clone();
            }
        }

        let rv = Arc::new(ReadView::new(target));
        inner.read_views.push(rv.clone());

        if let Some(tid) = stamp_tx {
            if let Some(tx) = inner.txs.get_mut(&tid) {
                rv.ref_inc();
                tx.stamp_view = Some(rv.clone());
            }
        }

        rv
    }

    fn drop_view(inner: &mut ManagerInner, rv: &Arc<ReadView>) {
        if rv.ref_dec() {
            inner.read_views.retain(|v| !Arc::ptr_eq(v, rv));
        }
    }

    /// Serial prepare: conflict detection, then flushing the write set
    /// into the ranges' active mems under the tentative LSN.
    ///
    /// Returns the number of bytes written into mems; the caller
    /// charges them against the memory quota.
    #[allow(clippy::expect_used)]
    pub(crate) fn prepare(
        &self,
        tx_id: TxId,
        generation: u64,
        mem_ids: &SequenceNumberCounter,
    ) -> crate::Result<u64> {
        let mut guard = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *guard;

        let mut tx = inner.txs.remove(&tx_id).ok_or(crate::Error::Conflict)?;

        let has_writes = !tx.write_set.is_empty();

        if tx.state != TxState::Ready || (has_writes && tx.read_view.is_some()) {
            inner.txs.insert(tx_id, tx);
            self.stats.tx_conflict.fetch_add(1, AcqRel);
            return Err(crate::Error::Conflict);
        }

        tx.state = TxState::Commit;

        if !has_writes {
            inner.txs.insert(tx_id, tx);
            return Ok(0);
        }

        inner.psn += 1;
        tx.psn = inner.psn;
        inner.last_prepared = Some(tx_id);

        // Send every read/write intersection to a read view
        let writes = tx
            .write_set
            .iter()
            .map(|(index_id, stmt)| {
                (index_id, stmt.key.user_key.clone(), stmt.stmt_type)
            })
            .collect::<Vec<_>>();

        // Preparing tx is out of the map; re-insert before promoting
        // so the observation point can see its psn
        inner.txs.insert(tx_id, tx);

        let registry = self.indexes.read().expect("lock is poisoned");

        for (index_id, key, stmt_type) in &writes {
            let Some(index) = registry.get(index_id) else {
                continue;
            };

            let readers = index
                .read_set
                .lock()
                .expect("lock is poisoned")
                .readers_of(key);

            for (reader_id, is_gap) in readers {
                // Don't abort self
                if reader_id == tx_id {
                    continue;
                }

                // Delete of nothing does not cause a conflict
                if is_gap && *stmt_type == StatementType::Delete {
                    continue;
                }

                let needs_promotion = inner.txs.get(&reader_id).is_some_and(|reader| {
                    reader.state == TxState::Ready && reader.read_view.is_none()
                });

                if !needs_promotion {
                    continue;
                }

                let rv = Self::read_view_at_observation_point(inner);

                #[allow(clippy::expect_used)]
                let reader = inner.txs.get_mut(&reader_id).expect("reader exists");
                reader.read_view = Some(rv);
            }
        }

        // Flush the write set into the active mems
        let mut tx = inner.txs.remove(&tx_id).expect("preparing tx exists");
        let prepare_lsn = TX_LSN_BASE + tx.psn;

        let mut written = 0u64;

        let flushes = tx
            .write_set
            .iter()
            .map(|(index_id, stmt)| (index_id, stmt.clone()))
            .collect::<Vec<_>>();

        for (index_id, stmt) in flushes {
            let Some(index) = registry.get(&index_id) else {
                continue;
            };

            let mut to_insert = stmt.with_lsn(prepare_lsn);
            let key = to_insert.key.user_key.clone();

            // Insert and pin under the range-state lock, so a
            // concurrent seal cannot capture the mem in between;
            // shadowed ranges route to their split children
            let (range, mem, squash_on_commit) = loop {
                let range = index.locate_for_write(&key);
                let state = range.state.read().expect("lock is poisoned");

                if state.is_shadow {
                    drop(state);
                    std::thread::yield_now();
                    continue;
                }

                // Rotate on generation change between inserts
                if state.active.generation() != generation {
                    drop(state);
                    range.rotate_mem(Arc::new(Mem::new(mem_ids.next(), generation)));
                    continue;
                }

                let mem = state.active.clone();
                let mut squash_on_commit = false;

                if to_insert.stmt_type == StatementType::Upsert {
                    // Chain depth continues from the newest version
                    // already in the mem
                    let below = mem
                        .get(&key, VLSN_INF)
                        .filter(|prev| prev.stmt_type == StatementType::Upsert)
                        .map(|prev| prev.upsert_count);

                    if let Some(below) = below {
                        to_insert.bump_upsert_count(below);
                    }

                    squash_on_commit = to_insert.upsert_count >= UPSERT_THRESHOLD
                        && to_insert.upsert_count % UPSERT_THRESHOLD == 0;
                }

                written += mem.insert_prepared(to_insert);
                mem.pin();

                drop(state);
                break (range, mem, squash_on_commit);
            };

            tx.applied.push(Applied {
                range,
                mem,
                key,
                prepare_lsn,
                squash_on_commit,
                index_id,
            });
        }

        drop(registry);
        inner.txs.insert(tx_id, tx);

        Ok(written)
    }

    /// Commits a prepared transaction under its WAL-assigned LSN.
    #[allow(clippy::expect_used)]
    pub(crate) fn commit(&self, tx_id: TxId, lsn: Lsn) -> crate::Result<CommitOutcome> {
        let mut guard = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *guard;

        let mut tx = inner.txs.remove(&tx_id).ok_or(crate::Error::Conflict)?;
        debug_assert_eq!(TxState::Commit, tx.state, "commit without prepare");

        if inner.last_prepared == Some(tx_id) {
            inner.last_prepared = None;
        }

        inner.lsn = inner.lsn.max(lsn);

        let mut outcome = CommitOutcome {
            dirty_ranges: Vec::new(),
            squash: Vec::new(),
        };

        let registry = self.indexes.read().expect("lock is poisoned");

        for applied in &tx.applied {
            applied.mem.commit(&applied.key, applied.prepare_lsn, lsn);
            applied.mem.unpin();

            // Invalidate the cache element
            if let Some(index) = registry.get(&applied.index_id) {
                index.cache.on_write(applied.index_id, &applied.key);
            }

            if applied.squash_on_commit {
                self.stats.upsert_squash_queued.fetch_add(1, AcqRel);
                outcome.squash.push((applied.index_id, applied.key.clone()));
            }

            if !outcome
                .dirty_ranges
                .iter()
                .any(|r| Arc::ptr_eq(r, &applied.range))
            {
                outcome.dirty_ranges.push(applied.range.clone());
            }
        }

        drop(registry);

        // Dependent read views now observe everything up to this commit
        if let Some(rv) = &tx.stamp_view {
            rv.set_vlsn(lsn);
            Self::drop_view(inner, rv);
            tx.stamp_view = None;
        }

        self.destroy(inner, tx_id, tx);
        self.stats.tx_commit.fetch_add(1, AcqRel);

        Ok(outcome)
    }

    /// Rolls a transaction back; prepared writes are erased from the
    /// mems, and every reader promoted to this transaction's read view
    /// is aborted along with its READY readers.
    #[allow(clippy::expect_used)]
    pub(crate) fn rollback(&self, tx_id: TxId) {
        let mut guard = self.inner.lock().expect("lock is poisoned");
        let inner = &mut *guard;

        let Some(mut tx) = inner.txs.remove(&tx_id) else {
            return;
        };

        if tx.state == TxState::Commit && !tx.applied.is_empty() {
            // Cascading rollback happens in reverse prepare order
            debug_assert_eq!(inner.last_prepared, Some(tx_id));
            if inner.last_prepared == Some(tx_id) {
                inner.last_prepared = None;
            }

            let registry = self.indexes.read().expect("lock is poisoned");

            for applied in tx.applied.iter().rev() {
                applied.mem.rollback(&applied.key, applied.prepare_lsn);
                applied.mem.unpin();

                // Invalidate the cache element
                if let Some(index) = registry.get(&applied.index_id) {
                    index.cache.on_write(applied.index_id, &applied.key);
                }
            }

            if let Some(rv) = &tx.stamp_view {
                rv.abort();
                Self::drop_view(inner, rv);
                tx.stamp_view = None;
            }

            // Abort everyone who read what this transaction wrote

            for (index_id, stmt) in tx.write_set.iter() {
                let Some(index) = registry.get(&index_id) else {
                    continue;
                };

                let readers = index
                    .read_set
                    .lock()
                    .expect("lock is poisoned")
                    .readers_of(&stmt.key.user_key);

                for (reader_id, is_gap) in readers {
                    if reader_id == tx_id {
                        continue;
                    }
                    if is_gap && stmt.stmt_type == StatementType::Delete {
                        continue;
                    }
                    if let Some(reader) = inner.txs.get_mut(&reader_id) {
                        if reader.state == TxState::Ready {
                            reader.state = TxState::Abort;
                        }
                    }
                }
            }

            drop(registry);
        } else if inner.last_prepared == Some(tx_id) {
            inner.last_prepared = None;
        }

        self.destroy(inner, tx_id, tx);
        self.stats.tx_rollback.fetch_add(1, AcqRel);
    }

    /// Common teardown: read-set entries, read-view reference.
    #[allow(clippy::expect_used)]
    fn destroy(&self, inner: &mut ManagerInner, tx_id: TxId, tx: TxData) {
        let registry = self.indexes.read().expect("lock is poisoned");

        for (index_id, key) in &tx.reads {
            if let Some(index) = registry.get(index_id) {
                index
                    .read_set
                    .lock()
                    .expect("lock is poisoned")
                    .remove(key, tx_id);
            }
        }

        drop(registry);

        if let Some(rv) = &tx.read_view {
            Self::drop_view(inner, rv);
        }
    }

    /// Number of live transactions.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn tx_count(&self) -> usize {
        self.inner.lock().expect("lock is poisoned").txs.len()
    }

    /// Number of active read views.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn read_view_count(&self) -> usize {
        self.inner.lock().expect("lock is poisoned").read_views.len()
    }

    #[cfg(test)]
    pub(crate) fn read_view_of(&self, tx_id: TxId) -> Option<Lsn> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock is poisoned");
        inner
            .txs
            .get(&tx_id)
            .and_then(|tx| tx.read_view.as_ref())
            .map(|rv| rv.vlsn())
    }
}

impl std::fmt::Debug for TxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TxManager(txs={})", self.tx_count())
    }
}
