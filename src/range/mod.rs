// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod tree;

use crate::memtable::Mem;
use crate::run::Run;
use crate::seqno::Lsn;
use crate::UserKey;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::AcqRel, Ordering::Acquire};
use std::sync::{Arc, RwLock};

/// Monotonic range id, unique across the environment.
pub type RangeId = u64;

/// Heap position marking "not in this heap" (detached or under task).
pub const HEAP_POS_NONE: u32 = u32::MAX;

/// Mutable contents of a range.
pub(crate) struct RangeState {
    /// Insertions land here
    pub active: Arc<Mem>,

    /// Frozen mems, most recent first, owned by the dump FIFO
    pub sealed: VecDeque<Arc<Mem>>,

    /// On-disk runs, most recent first
    pub runs: Vec<Arc<Run>>,

    /// While this range is a split child, reads also traverse the
    /// shadowed parent's mems and runs through this pointer
    pub split_parent: Option<Arc<Range>>,

    /// Set on the parent when it is replaced by split children; a
    /// shadow range no longer lives in the range tree
    pub is_shadow: bool,
}

/// An interval `[begin, end)` of the key space
///
/// `None` boundaries are infinite. Ranges of an index tile the key
/// space exactly: no gaps, no overlaps, the leftmost `begin` and the
/// rightmost `end` are infinite.
pub struct Range {
    id: RangeId,

    begin: Option<UserKey>,
    end: Option<UserKey>,

    pub(crate) state: RwLock<RangeState>,

    /// Bumped whenever mems or runs change; open merge iterators
    /// treat a bump as invalidation
    version: AtomicU64,

    /// Position in the scheduler's dump heap
    pub(crate) in_dump: AtomicU32,

    /// Position in the scheduler's compact heap
    pub(crate) in_compact: AtomicU32,

    /// Number of runs worth compacting, recomputed after every dump
    pub(crate) compact_priority: AtomicU32,

    /// How often this range was compacted; a range is never split
    /// before its first compaction
    pub(crate) n_compactions: AtomicU32,
}

impl Range {
    #[must_use]
    pub(crate) fn new(
        id: RangeId,
        begin: Option<UserKey>,
        end: Option<UserKey>,
        active: Arc<Mem>,
    ) -> Self {
        Self {
            id,
            begin,
            end,
            state: RwLock::new(RangeState {
                active,
                sealed: VecDeque::new(),
                runs: Vec::new(),
                split_parent: None,
                is_shadow: false,
            }),
            version: AtomicU64::new(0),
            in_dump: AtomicU32::new(HEAP_POS_NONE),
            in_compact: AtomicU32::new(HEAP_POS_NONE),
            compact_priority: AtomicU32::new(0),
            n_compactions: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> RangeId {
        self.id
    }

    /// Lower bound; `None` is negative infinity.
    #[must_use]
    pub fn begin(&self) -> Option<&UserKey> {
        self.begin.as_ref()
    }

    /// Exclusive upper bound; `None` is positive infinity.
    #[must_use]
    pub fn end(&self) -> Option<&UserKey> {
        self.end.as_ref()
    }

    /// Returns `true` if the key falls into `[begin, end)`.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(begin) = &self.begin {
            if key < &**begin {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if key >= &**end {
                return false;
            }
        }
        true
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, AcqRel);
    }

    /// Smallest committed LSN over the active and sealed mems; drives
    /// the dump heap. `u64::MAX` means nothing to dump.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn mem_min_lsn(&self) -> Lsn {
        let state = self.state.read().expect("lock is poisoned");

        let mut min = state.active.min_lsn().unwrap_or(u64::MAX);
        for mem in &state.sealed {
            min = min.min(mem.min_lsn().unwrap_or(u64::MAX));
        }
        min
    }

    /// In-memory bytes plus run bytes.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn size(&self) -> u64 {
        let state = self.state.read().expect("lock is poisoned");

        state.active.used()
            + state.sealed.iter().map(|m| m.used()).sum::<u64>()
            + state.runs.iter().map(|r| r.size()).sum::<u64>()
    }

    /// In-memory bytes only.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn mem_used(&self) -> u64 {
        let state = self.state.read().expect("lock is poisoned");
        state.active.used() + state.sealed.iter().map(|m| m.used()).sum::<u64>()
    }

    /// Seals the active mem and installs a fresh one.
    ///
    /// An empty, unpinned active is freed instead of sealed.
    #[allow(clippy::expect_used)]
    pub(crate) fn rotate_mem(&self, fresh: Arc<Mem>) {
        let mut state = self.state.write().expect("lock is poisoned");

        let old = std::mem::replace(&mut state.active, fresh);

        if !old.is_empty() || old.is_pinned() {
            state.sealed.push_front(old);
        }

        drop(state);
        self.bump_version();
    }

    /// Removes dumped sealed mems: every unpinned sealed mem whose
    /// `min_lsn` is at or below `dump_lsn`. Dumps always write chosen
    /// mems in full, so `min_lsn` is the membership test.
    /// Returns the number of bytes freed, for quota release.
    #[allow(clippy::expect_used)]
    pub(crate) fn gc_mems(&self, dump_lsn: Lsn) -> u64 {
        let mut state = self.state.write().expect("lock is poisoned");

        let mut freed = 0;

        state.sealed.retain(|mem| {
            let dumped = mem.min_lsn().is_none_or(|min| min <= dump_lsn);
            let keep = !(dumped && !mem.is_pinned());
            if !keep {
                freed += mem.used();
            }
            keep
        });

        drop(state);
        self.bump_version();

        freed
    }

    /// Returns the split key if the range wants to be split in two:
    /// the newest run exceeds 4/3 of the target range size, the range
    /// has been compacted at least once, and neither child would be
    /// empty.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub(crate) fn needs_split(&self, range_size_target: u64) -> Option<UserKey> {
        if self.n_compactions.load(Acquire) == 0 {
            return None;
        }

        let state = self.state.read().expect("lock is poisoned");

        let run = state.runs.first()?;

        if run.size() < range_size_target * 4 / 3 {
            return None;
        }

        let mid = run.mid_key()?.clone();

        // No point in splitting if a new range is going to be empty
        if !self.contains(&mid) {
            return None;
        }
        if let Some(begin) = &self.begin {
            if mid == *begin {
                return None;
            }
        }

        drop(state);
        Some(mid)
    }

    /// Recomputes how many runs of this range are worth compacting.
    ///
    /// Walks the runs newest to oldest, assigning them to levels by a
    /// target size that starts at the newest run's size and grows by
    /// `run_size_ratio` per level. A level holding more than
    /// `run_count_per_level` runs schedules a compaction of itself and
    /// every younger level above it.
    #[allow(clippy::expect_used)]
    pub(crate) fn update_compact_priority(&self, run_count_per_level: u32, run_size_ratio: f64) {
        debug_assert!(run_count_per_level > 0);
        debug_assert!(run_size_ratio > 1.0);

        let state = self.state.read().expect("lock is poisoned");

        let mut priority = 0u32;
        let mut total_run_count = 0u32;
        let mut total_size = 0u64;
        let mut est_new_run_size = 0u64;
        let mut level_run_count = 0u32;
        let mut target_run_size = 0u64;

        for run in &state.runs {
            let run_size = run.size();

            // The first level is sized by the most recent run
            if target_run_size == 0 {
                target_run_size = run_size.max(1);
            }

            total_size += run_size;
            level_run_count += 1;
            total_run_count += 1;

            while run_size > target_run_size {
                // The run belongs to a lower level; switch levels until
                // it fits
                level_run_count = 1;

                // If an upper-level compaction output is estimated to
                // land at this level, count it in right away so the two
                // compactions fuse instead of cascading
                if est_new_run_size > target_run_size {
                    level_run_count += 1;
                }

                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    target_run_size = (target_run_size as f64 * run_size_ratio) as u64;
                }
            }

            if level_run_count > run_count_per_level {
                priority = total_run_count;
                est_new_run_size = total_size;
            }
        }

        drop(state);
        self.compact_priority.store(priority, std::sync::atomic::Ordering::Release);
    }
}

impl std::fmt::Debug for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Range#{} [{}..{})",
            self.id,
            self.begin
                .as_ref()
                .map_or_else(|| "-inf".into(), |k| format!("{k:?}")),
            self.end
                .as_ref()
                .map_or_else(|| "+inf".into(), |k| format!("{k:?}")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::Statement;
    use test_log::test;

    fn range_with_mem() -> Range {
        Range::new(1, None, None, Arc::new(Mem::new(1, 0)))
    }

    #[test]
    fn range_contains() {
        let range = Range::new(
            1,
            Some((*b"b").into()),
            Some((*b"m").into()),
            Arc::new(Mem::new(1, 0)),
        );

        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"m"));
        assert!(!range.contains(b"z"));
    }

    #[test]
    fn range_infinite_bounds() {
        let range = range_with_mem();
        assert!(range.contains(b""));
        assert!(range.contains(b"anything"));
    }

    #[test]
    fn range_mem_min_lsn_spans_active_and_sealed() {
        let range = range_with_mem();

        assert_eq!(u64::MAX, range.mem_min_lsn());

        {
            let state = range.state.read().unwrap();
            state.active.insert(Statement::replace(*b"a", *b"v", 7));
        }
        assert_eq!(7, range.mem_min_lsn());

        range.rotate_mem(Arc::new(Mem::new(2, 0)));
        {
            let state = range.state.read().unwrap();
            state.active.insert(Statement::replace(*b"b", *b"v", 9));
        }

        assert_eq!(7, range.mem_min_lsn(), "sealed mem still counts");
    }

    #[test]
    fn range_rotate_frees_empty_active() {
        let range = range_with_mem();

        range.rotate_mem(Arc::new(Mem::new(2, 0)));

        let state = range.state.read().unwrap();
        assert!(state.sealed.is_empty(), "empty unpinned mem is freed");
    }

    #[test]
    fn range_gc_mems_respects_pins() {
        let range = range_with_mem();

        {
            let state = range.state.read().unwrap();
            state.active.insert(Statement::replace(*b"a", *b"v", 3));
        }
        range.rotate_mem(Arc::new(Mem::new(2, 0)));

        let pinned = {
            let state = range.state.read().unwrap();
            let mem = state.sealed.front().unwrap().clone();
            mem.pin();
            mem
        };

        range.gc_mems(5);
        assert_eq!(
            1,
            range.state.read().unwrap().sealed.len(),
            "pinned mem survives"
        );

        pinned.unpin();
        range.gc_mems(5);
        assert!(range.state.read().unwrap().sealed.is_empty());
    }
}
