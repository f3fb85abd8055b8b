// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::index::Index;
use crate::range::{Range, HEAP_POS_NONE};
use std::sync::atomic::{AtomicU32, Ordering::Acquire, Ordering::Release};
use std::sync::Arc;

/// Which of the two scheduler heaps this is; decides both the sort key
/// and which position cell of the range is maintained.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum HeapKind {
    /// Ordered by `mem_min_lsn` ascending: the oldest unpersisted data
    /// dumps first
    Dump,

    /// Ordered by `compact_priority` descending: the worst read
    /// amplification compacts first
    Compact,
}

/// A binary heap over ranges that writes every element's position back
/// into the range, so membership checks and removal are O(1) lookups.
/// A range under task is in neither heap and holds `u32::MAX` in both
/// position cells.
pub(crate) struct RangeHeap {
    kind: HeapKind,
    data: Vec<(Arc<Index>, Arc<Range>)>,
}

impl RangeHeap {
    pub fn new(kind: HeapKind) -> Self {
        Self {
            kind,
            data: Vec::new(),
        }
    }

    fn pos_cell<'a>(&self, range: &'a Range) -> &'a AtomicU32 {
        match self.kind {
            HeapKind::Dump => &range.in_dump,
            HeapKind::Compact => &range.in_compact,
        }
    }

    /// Smaller key = closer to the top.
    fn key(&self, range: &Range) -> u64 {
        match self.kind {
            HeapKind::Dump => range.mem_min_lsn(),
            HeapKind::Compact => {
                // Max-heap via inversion
                u64::MAX - u64::from(range.compact_priority.load(Acquire))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Arc<Index>, Arc<Range>)> {
        self.data.iter()
    }

    #[allow(clippy::indexing_slicing)]
    fn set_pos(&self, idx: usize) {
        let (_, range) = &self.data[idx];
        #[allow(clippy::cast_possible_truncation)]
        self.pos_cell(range).store(idx as u32, Release);
    }

    #[allow(clippy::indexing_slicing)]
    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.key(&self.data[idx].1) < self.key(&self.data[parent].1) {
                self.data.swap(idx, parent);
                self.set_pos(idx);
                idx = parent;
            } else {
                break;
            }
        }
        self.set_pos(idx);
    }

    #[allow(clippy::indexing_slicing)]
    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = idx * 2 + 1;
            let right = idx * 2 + 2;
            let mut smallest = idx;

            if left < self.data.len()
                && self.key(&self.data[left].1) < self.key(&self.data[smallest].1)
            {
                smallest = left;
            }
            if right < self.data.len()
                && self.key(&self.data[right].1) < self.key(&self.data[smallest].1)
            {
                smallest = right;
            }

            if smallest == idx {
                break;
            }

            self.data.swap(idx, smallest);
            self.set_pos(idx);
            idx = smallest;
        }
        self.set_pos(idx);
    }

    pub fn push(&mut self, index: Arc<Index>, range: Arc<Range>) {
        debug_assert_eq!(
            HEAP_POS_NONE,
            self.pos_cell(&range).load(Acquire),
            "range is already in the heap"
        );

        self.data.push((index, range));
        self.sift_up(self.data.len() - 1);
    }

    pub fn peek(&self) -> Option<&(Arc<Index>, Arc<Range>)> {
        self.data.first()
    }

    #[allow(clippy::indexing_slicing)]
    pub fn remove(&mut self, range: &Range) -> Option<(Arc<Index>, Arc<Range>)> {
        let pos = self.pos_cell(range).load(Acquire);
        if pos == HEAP_POS_NONE {
            return None;
        }

        let idx = pos as usize;
        debug_assert!(idx < self.data.len());

        let last = self.data.len() - 1;
        self.data.swap(idx, last);
        let removed = self.data.pop();

        self.pos_cell(range).store(HEAP_POS_NONE, Release);

        if idx < self.data.len() {
            self.sift_down(idx);
            self.sift_up(idx);
        }

        removed
    }

    pub fn pop(&mut self) -> Option<(Arc<Index>, Arc<Range>)> {
        let (_, range) = self.peek()?.clone();
        self.remove(&range)
    }

    /// Restores the heap property after a range's key changed.
    pub fn update(&mut self, range: &Range) {
        let pos = self.pos_cell(range).load(Acquire);
        if pos == HEAP_POS_NONE {
            return;
        }

        let idx = pos as usize;
        self.sift_up(idx);

        let pos = self.pos_cell(range).load(Acquire) as usize;
        self.sift_down(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Mem;
    use crate::statement::Statement;
    use test_log::test;

    fn index() -> Arc<Index> {
        use crate::cache::ReadCache;
        use crate::index::IndexOptions;
        use crate::page_cache::PageCache;
        use crate::upsert::OverwriteExecutor;

        Arc::new(Index::new(
            1,
            "test".into(),
            IndexOptions::default(),
            std::path::Path::new("/tmp"),
            Arc::new(ReadCache::with_capacity_bytes(1_024)),
            Arc::new(PageCache::with_capacity_bytes(1_024)),
            Arc::new(OverwriteExecutor),
        ))
    }

    fn range_with_min_lsn(id: u64, lsn: u64) -> Arc<Range> {
        let mem = Arc::new(Mem::new(id, 0));
        mem.insert(Statement::replace(*b"k", *b"v", lsn));
        Arc::new(Range::new(id, None, None, mem))
    }

    #[test]
    fn heap_dump_order_is_min_lsn_first() {
        let index = index();
        let mut heap = RangeHeap::new(HeapKind::Dump);

        let a = range_with_min_lsn(1, 50);
        let b = range_with_min_lsn(2, 10);
        let c = range_with_min_lsn(3, 30);

        heap.push(index.clone(), a);
        heap.push(index.clone(), b);
        heap.push(index, c);

        assert_eq!(2, heap.pop().unwrap().1.id());
        assert_eq!(3, heap.pop().unwrap().1.id());
        assert_eq!(1, heap.pop().unwrap().1.id());
        assert!(heap.pop().is_none());
    }

    #[test]
    fn heap_positions_track_membership() {
        let index = index();
        let mut heap = RangeHeap::new(HeapKind::Dump);

        let a = range_with_min_lsn(1, 50);
        let b = range_with_min_lsn(2, 10);

        assert_eq!(HEAP_POS_NONE, a.in_dump.load(Acquire));

        heap.push(index.clone(), a.clone());
        heap.push(index, b.clone());

        assert_ne!(HEAP_POS_NONE, a.in_dump.load(Acquire));
        assert_ne!(HEAP_POS_NONE, b.in_dump.load(Acquire));

        heap.remove(&a);
        assert_eq!(HEAP_POS_NONE, a.in_dump.load(Acquire));
        assert_eq!(1, heap.len());

        // The compact position is untouched by the dump heap
        assert_eq!(HEAP_POS_NONE, b.in_compact.load(Acquire));
    }

    #[test]
    fn heap_compact_order_is_priority_first() {
        let index = index();
        let mut heap = RangeHeap::new(HeapKind::Compact);

        let a = range_with_min_lsn(1, 1);
        let b = range_with_min_lsn(2, 1);
        a.compact_priority.store(3, Release);
        b.compact_priority.store(7, Release);

        heap.push(index.clone(), a);
        heap.push(index, b);

        assert_eq!(2, heap.pop().unwrap().1.id());
        assert_eq!(1, heap.pop().unwrap().1.id());
    }

    #[test]
    fn heap_update_resorts() {
        let index = index();
        let mut heap = RangeHeap::new(HeapKind::Compact);

        let a = range_with_min_lsn(1, 1);
        let b = range_with_min_lsn(2, 1);
        a.compact_priority.store(5, Release);
        b.compact_priority.store(1, Release);

        heap.push(index.clone(), a.clone());
        heap.push(index, b.clone());
        assert_eq!(1, heap.peek().unwrap().1.id());

        b.compact_priority.store(9, Release);
        heap.update(&b);

        assert_eq!(2, heap.peek().unwrap().1.id());
    }
}
