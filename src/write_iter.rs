// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::seqno::Lsn;
use crate::statement::{Statement, StatementType, UPSERT_INF};
use crate::upsert::{squash_chain, UpsertExecutor};
use interval_heap::IntervalHeap as Heap;
use std::sync::Arc;

pub(crate) type BoxedStream<'a> = Box<dyn Iterator<Item = crate::Result<Statement>> + Send + 'a>;

#[derive(Eq)]
struct HeapItem(usize, Statement);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.1.key == other.1.key
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.1.key.cmp(&other.1.key)
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Plain k-way merge over statement streams in (user key, -lsn) order,
/// deduplicating identical (key, lsn) pairs - the same statement can
/// sit in a mem and a run during the dump-to-GC window.
struct Merger<'a> {
    sources: Vec<BoxedStream<'a>>,
    heap: Heap<HeapItem>,
    initialized: bool,
    last: Option<(crate::UserKey, Lsn)>,
}

impl<'a> Merger<'a> {
    fn new(sources: Vec<BoxedStream<'a>>) -> Self {
        let heap = Heap::with_capacity(sources.len());

        Self {
            sources,
            heap,
            initialized: false,
            last: None,
        }
    }

    #[allow(clippy::indexing_slicing)]
    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.sources.len() {
            if let Some(item) = self.sources[idx].next() {
                self.heap.push(HeapItem(idx, item?));
            }
        }
        self.initialized = true;
        Ok(())
    }
}

impl<'a> Iterator for Merger<'a> {
    type Item = crate::Result<Statement>;

    #[allow(clippy::indexing_slicing)]
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.initialize());
        }

        loop {
            let min_item = self.heap.pop_min()?;

            if let Some(next_item) = self.sources[min_item.0].next() {
                let next_item = fail_iter!(next_item);
                self.heap.push(HeapItem(min_item.0, next_item));
            }

            let identity = (min_item.1.key.user_key.clone(), min_item.1.key.lsn);
            if self.last.as_ref() == Some(&identity) {
                continue;
            }
            self.last = Some(identity);

            return Some(Ok(min_item.1));
        }
    }
}

/// The compaction-time merging stream whose output becomes a new run.
///
/// Versions above `oldest_vlsn` pass through untouched; at or below
/// it, at most one statement per key survives: a REPLACE or DELETE
/// wins outright, an UPSERT chain is folded onto its base. On the
/// last level, DELETEs are dropped and baseless UPSERT chains are
/// converted to REPLACE by applying against nothing.
pub(crate) struct WriteIterator<'a> {
    merger: Merger<'a>,

    /// Oldest LSN any read view can still observe
    oldest_vlsn: Lsn,

    /// Compacting every run of the range
    is_last_level: bool,

    executor: Arc<dyn UpsertExecutor>,

    /// Secondary-index optimisation: statements whose column mask does
    /// not intersect are suppressed
    index_column_mask: Option<u64>,

    /// Lookahead pushed back by the key-group logic
    peeked: Option<Statement>,
}

impl<'a> WriteIterator<'a> {
    pub fn new(
        sources: Vec<BoxedStream<'a>>,
        oldest_vlsn: Lsn,
        is_last_level: bool,
        executor: Arc<dyn UpsertExecutor>,
        index_column_mask: Option<u64>,
    ) -> Self {
        Self {
            merger: Merger::new(sources),
            oldest_vlsn,
            is_last_level,
            executor,
            index_column_mask,
            peeked: None,
        }
    }

    fn pull(&mut self) -> crate::Result<Option<Statement>> {
        if let Some(stmt) = self.peeked.take() {
            return Ok(Some(stmt));
        }

        loop {
            let Some(stmt) = self.merger.next().transpose()? else {
                return Ok(None);
            };

            if let Some(mask) = self.index_column_mask {
                if stmt.column_mask & mask == 0 {
                    // The update did not touch any indexed column
                    continue;
                }
            }

            return Ok(Some(stmt));
        }
    }

    /// Consumes and discards the remaining versions of `key`.
    fn drain_key(&mut self, key: &crate::UserKey) -> crate::Result<()> {
        loop {
            match self.pull()? {
                Some(stmt) if stmt.key.user_key == *key => {}
                Some(stmt) => {
                    self.peeked = Some(stmt);
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    /// Handles the youngest statement at or below `oldest_vlsn`.
    fn collapse(&mut self, head: Statement) -> crate::Result<Option<Statement>> {
        let key = head.key.user_key.clone();

        match head.stmt_type {
            StatementType::Replace => {
                self.drain_key(&key)?;
                Ok(Some(head))
            }
            StatementType::Delete => {
                self.drain_key(&key)?;
                if self.is_last_level {
                    // Nothing below the last level can resurrect
                    Ok(None)
                } else {
                    Ok(Some(head))
                }
            }
            StatementType::Upsert => {
                let mut chain = vec![head];
                let mut base = None;

                loop {
                    match self.pull()? {
                        Some(stmt) if stmt.key.user_key == key => {
                            if stmt.stmt_type == StatementType::Upsert {
                                chain.push(stmt);
                            } else {
                                base = Some(stmt);
                                self.drain_key(&key)?;
                                break;
                            }
                        }
                        Some(stmt) => {
                            self.peeked = Some(stmt);
                            break;
                        }
                        None => break,
                    }
                }

                if base.is_none() && !self.is_last_level {
                    // The true base may live in a deeper level; merge
                    // the chain into a single UPSERT instead
                    return Ok(Some(Self::merge_upsert_chain(&*self.executor, &chain)));
                }

                // Chain with a REPLACE/DELETE base, or the last level:
                // fold into a REPLACE (against nothing if baseless)
                Ok(squash_chain(&*self.executor, &chain, base.as_ref()))
            }
            StatementType::Select => unreachable!("SELECT is never stored"),
        }
    }

    /// Folds an UPSERT chain (newest first) into one UPSERT.
    fn merge_upsert_chain(executor: &dyn UpsertExecutor, chain: &[Statement]) -> Statement {
        #[allow(clippy::expect_used)]
        let newest = chain.first().expect("chain is not empty");

        let mut ops = None;
        for stmt in chain.iter().rev() {
            ops = Some(match ops {
                Some(older) => executor.merge(&older, &stmt.value),
                None => stmt.value.clone(),
            });
        }

        #[allow(clippy::expect_used)]
        let mut merged = Statement::upsert(
            newest.key.user_key.clone(),
            ops.expect("chain is not empty"),
            newest.key.lsn,
        );
        merged.column_mask = chain.iter().fold(0, |acc, s| acc | s.column_mask);
        merged.upsert_count = chain
            .iter()
            .fold(0u8, |acc, s| acc.saturating_add(s.upsert_count.max(1)))
            .min(UPSERT_INF);

        merged
    }
}

impl<'a> Iterator for WriteIterator<'a> {
    type Item = crate::Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let head = fail_iter!(self.pull())?;

            if head.key.lsn > self.oldest_vlsn {
                // Still visible to some read view; emitted untouched
                return Some(Ok(head));
            }

            match fail_iter!(self.collapse(head)) {
                Some(stmt) => return Some(Ok(stmt)),
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upsert::OverwriteExecutor;
    use crate::UserValue;
    use test_log::test;

    struct AddExecutor;

    impl UpsertExecutor for AddExecutor {
        fn apply(&self, base: Option<&UserValue>, ops: &UserValue) -> Option<UserValue> {
            let delta = u64::from_le_bytes(ops.as_ref().try_into().ok()?);
            let base = match base {
                Some(v) => u64::from_le_bytes(v.as_ref().try_into().ok()?),
                None => 0,
            };
            Some(base.wrapping_add(delta).to_le_bytes().to_vec().into())
        }

        fn merge(&self, older: &UserValue, newer: &UserValue) -> UserValue {
            #[allow(clippy::expect_used)]
            let a = u64::from_le_bytes(older.as_ref().try_into().expect("8 bytes"));
            #[allow(clippy::expect_used)]
            let b = u64::from_le_bytes(newer.as_ref().try_into().expect("8 bytes"));
            a.wrapping_add(b).to_le_bytes().to_vec().into()
        }
    }

    fn stream(stmts: Vec<Statement>) -> BoxedStream<'static> {
        Box::new(stmts.into_iter().map(Ok))
    }

    fn collect(iter: WriteIterator<'_>) -> Vec<Statement> {
        iter.collect::<crate::Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn write_iter_keeps_versions_above_watermark() {
        let src = stream(vec![
            Statement::replace(*b"a", *b"3", 3),
            Statement::replace(*b"a", *b"2", 2),
            Statement::replace(*b"a", *b"1", 1),
        ]);

        let iter = WriteIterator::new(
            vec![src],
            /* everything visible */ 0,
            false,
            Arc::new(OverwriteExecutor),
            None,
        );

        assert_eq!(3, collect(iter).len());
    }

    #[test]
    fn write_iter_collapses_below_watermark() {
        let src = stream(vec![
            Statement::replace(*b"a", *b"3", 3),
            Statement::replace(*b"a", *b"2", 2),
            Statement::replace(*b"a", *b"1", 1),
        ]);

        let iter = WriteIterator::new(
            vec![src],
            10,
            false,
            Arc::new(OverwriteExecutor),
            None,
        );

        let out = collect(iter);
        assert_eq!(1, out.len());
        assert_eq!(3, out.first().unwrap().key.lsn);
    }

    #[test]
    fn write_iter_drops_delete_on_last_level() {
        let src = stream(vec![
            Statement::delete(*b"a", 5),
            Statement::replace(*b"a", *b"old", 1),
            Statement::replace(*b"b", *b"kept", 2),
        ]);

        let iter = WriteIterator::new(
            vec![src],
            10,
            true,
            Arc::new(OverwriteExecutor),
            None,
        );

        let out = collect(iter);
        assert_eq!(1, out.len());
        assert_eq!(*b"b", &*out.first().unwrap().key.user_key);
    }

    #[test]
    fn write_iter_keeps_delete_on_intermediate_level() {
        let src = stream(vec![
            Statement::delete(*b"a", 5),
            Statement::replace(*b"a", *b"old", 1),
        ]);

        let iter = WriteIterator::new(
            vec![src],
            10,
            false,
            Arc::new(OverwriteExecutor),
            None,
        );

        let out = collect(iter);
        assert_eq!(1, out.len());
        assert_eq!(StatementType::Delete, out.first().unwrap().stmt_type);
    }

    #[test]
    fn write_iter_folds_upsert_chain_onto_base() {
        let src = stream(vec![
            Statement::upsert(*b"k", 2u64.to_le_bytes(), 3),
            Statement::upsert(*b"k", 1u64.to_le_bytes(), 2),
            Statement::replace(*b"k", 10u64.to_le_bytes(), 1),
        ]);

        let iter = WriteIterator::new(vec![src], 10, false, Arc::new(AddExecutor), None);

        let out = collect(iter);
        assert_eq!(1, out.len());

        let stmt = out.first().unwrap();
        assert_eq!(StatementType::Replace, stmt.stmt_type);
        assert_eq!(3, stmt.key.lsn);
        assert_eq!(13u64.to_le_bytes().as_slice(), &*stmt.value);
    }

    #[test]
    fn write_iter_baseless_chain_last_level_applies_against_nothing() {
        let src = stream(vec![
            Statement::upsert(*b"k", 2u64.to_le_bytes(), 3),
            Statement::upsert(*b"k", 1u64.to_le_bytes(), 2),
        ]);

        let iter = WriteIterator::new(vec![src], 10, true, Arc::new(AddExecutor), None);

        let out = collect(iter);
        assert_eq!(1, out.len());

        let stmt = out.first().unwrap();
        assert_eq!(StatementType::Replace, stmt.stmt_type);
        assert_eq!(3u64.to_le_bytes().as_slice(), &*stmt.value);
    }

    #[test]
    fn write_iter_baseless_chain_intermediate_level_stays_upsert() {
        let src = stream(vec![
            Statement::upsert(*b"k", 2u64.to_le_bytes(), 3),
            Statement::upsert(*b"k", 1u64.to_le_bytes(), 2),
        ]);

        let iter = WriteIterator::new(vec![src], 10, false, Arc::new(AddExecutor), None);

        let out = collect(iter);
        assert_eq!(1, out.len());

        let stmt = out.first().unwrap();
        assert_eq!(StatementType::Upsert, stmt.stmt_type);
        assert_eq!(
            3u64.to_le_bytes().as_slice(),
            &*stmt.value,
            "operations are merged"
        );
    }

    #[test]
    fn write_iter_merges_sources_and_dedups() {
        let a = stream(vec![
            Statement::replace(*b"a", *b"v", 7),
            Statement::replace(*b"c", *b"v", 2),
        ]);
        // Same statement again: mem + run overlap
        let b = stream(vec![
            Statement::replace(*b"a", *b"v", 7),
            Statement::replace(*b"b", *b"v", 4),
        ]);

        let iter = WriteIterator::new(
            vec![a, b],
            0,
            false,
            Arc::new(OverwriteExecutor),
            None,
        );

        let keys = collect(iter)
            .into_iter()
            .map(|s| (s.key.user_key.to_vec(), s.key.lsn))
            .collect::<Vec<_>>();

        assert_eq!(
            vec![
                (b"a".to_vec(), 7),
                (b"b".to_vec(), 4),
                (b"c".to_vec(), 2)
            ],
            keys
        );
    }

    #[test]
    fn write_iter_secondary_mask_suppression() {
        let src = stream(vec![
            Statement::replace(*b"a", *b"v", 3).with_column_mask(0b0100),
            Statement::replace(*b"b", *b"v", 2).with_column_mask(0b0011),
        ]);

        // Index covers columns 0-1 only
        let iter = WriteIterator::new(
            vec![src],
            0,
            false,
            Arc::new(OverwriteExecutor),
            Some(0b0011),
        );

        let out = collect(iter);
        assert_eq!(1, out.len());
        assert_eq!(*b"b", &*out.first().unwrap().key.user_key);
    }
}
