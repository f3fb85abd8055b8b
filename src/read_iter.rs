// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::index::Index;
use crate::merge::{
    CacheSource, MemSource, MergeIterator, MergeNext, RunSource, SeekParams, Source,
    WriteSetSource,
};
use crate::range::tree::SearchMode;
use crate::range::Range;
use crate::seqno::{Lsn, VLSN_INF};
use crate::statement::{Statement, StatementType};
use crate::tx::{TxId, TxManager};
use crate::upsert::squash_chain;
use crate::UserKey;
use std::sync::Arc;

/// The user-visible range-walking stream: composes a per-range merge
/// iterator with UPSERT squashing, DELETE skipping and cache filling,
/// yielding at most one materialised REPLACE per user key.
pub struct ReadIterator {
    index: Arc<Index>,
    manager: Arc<TxManager>,
    tx_id: Option<TxId>,

    mode: SearchMode,
    search_key: UserKey,
    vlsn: Lsn,

    /// Full-part-count key: stop after the first hit
    unique: bool,

    curr_range: Option<Arc<Range>>,
    merge: Option<MergeIterator>,

    /// Restore point after invalidation; also the key-skip marker
    last: Option<Statement>,

    /// Previous successfully yielded key, for cache chaining
    prev_key: Option<UserKey>,

    /// Reads are remembered in the index read set while the
    /// transaction has no read view
    track_reads: bool,

    yielded_any: bool,

    finished: bool,
}

impl ReadIterator {
    pub(crate) fn new(
        index: Arc<Index>,
        manager: Arc<TxManager>,
        tx_id: Option<TxId>,
        mode: SearchMode,
        search_key: UserKey,
        vlsn: Lsn,
        unique: bool,
    ) -> Self {
        Self {
            index,
            manager,
            tx_id,
            mode,
            search_key,
            vlsn,
            unique,
            curr_range: None,
            merge: None,
            last: None,
            prev_key: None,
            track_reads: tx_id.is_some(),
            yielded_any: false,
            finished: false,
        }
    }

    fn params(&self) -> SeekParams {
        SeekParams {
            mode: self.mode,
            search_key: self.search_key.clone(),
            vlsn: self.vlsn,
        }
    }

    /// (Re)locates the current range, after open, invalidation, or a
    /// range step.
    #[allow(clippy::expect_used)]
    fn locate_range(&mut self) {
        let tree = self.index.tree.read().expect("lock is poisoned");

        let range = match &self.last {
            // Restore: the range holding the last emitted key
            Some(last) => tree.locate_for_write(&last.key.user_key),
            None => tree.locate_for_read(self.mode, &self.search_key),
        };

        self.curr_range = Some(range);
    }

    /// Builds the merge iterator for the current range: write set,
    /// cache, active mem, sealed mems newest-first, runs newest-first;
    /// a split child also traverses its shadowed parent.
    #[allow(clippy::expect_used)]
    fn build_merge(&mut self) {
        let range = self
            .curr_range
            .clone()
            .expect("range is located before building");

        let params = self.params();
        let mut sources = Vec::<Source>::new();

        if let Some(tx_id) = self.tx_id {
            sources.push(Source::from(WriteSetSource::new(
                self.manager.clone(),
                tx_id,
                self.index.id(),
                params.clone(),
            )));
        }

        // Stale views must not read (or fill) the cache
        if self.vlsn == VLSN_INF {
            sources.push(Source::from(CacheSource::new(
                self.index.cache.clone(),
                self.index.id(),
                params.clone(),
            )));
        }

        let mut push_range_sources = |range: &Arc<Range>| {
            let state = range.state.read().expect("lock is poisoned");

            sources.push(Source::from(MemSource::new(
                state.active.clone(),
                params.clone(),
            )));

            for mem in &state.sealed {
                sources.push(Source::from(MemSource::new(mem.clone(), params.clone())));
            }

            for run in &state.runs {
                if run.is_empty() {
                    continue;
                }
                sources.push(Source::from(RunSource::new(
                    run.clone(),
                    self.index.page_cache.clone(),
                    params.clone(),
                    self.unique,
                )));
            }

            state.split_parent.clone()
        };

        let parent = push_range_sources(&range);

        // During a split, the child's history still lives in the
        // shadowed parent
        if let Some(parent) = parent {
            let _ = push_range_sources(&parent);
        }

        let range_bound = if self.mode.is_forward() {
            range.end().cloned()
        } else {
            range.begin().cloned()
        };

        let tree_version = self.index.tree_version();
        let index = self.index.clone();

        self.merge = Some(
            MergeIterator::new(
                sources,
                params,
                range_bound,
                self.unique,
                self.last.clone(),
            )
            .with_version_guard(
                range,
                tree_version,
                Arc::new(move || index.tree_version()),
            ),
        );
    }

    fn invalidate(&mut self) {
        if let Some(mut merge) = self.merge.take() {
            merge.close();
        }
        self.curr_range = None;
    }

    /// Steps to the next range, or finishes.
    #[allow(clippy::expect_used)]
    fn step_range(&mut self) {
        if let Some(mut merge) = self.merge.take() {
            merge.close();
        }

        let tree = self.index.tree.read().expect("lock is poisoned");

        let next = self
            .curr_range
            .as_ref()
            .and_then(|curr| tree.walk(curr, self.mode, &self.search_key));

        drop(tree);

        match next {
            Some(range) => self.curr_range = Some(range),
            None => self.finished = true,
        }
    }

    /// Collapses an UPSERT head into a materialised REPLACE by walking
    /// the key's older versions.
    fn materialize_upsert(&mut self, head: Statement) -> crate::Result<Option<Statement>> {
        #[allow(clippy::expect_used)]
        let merge = self.merge.as_mut().expect("merge is built");

        let mut chain = vec![head];
        let mut base = None;

        loop {
            match merge.next_lsn()? {
                Some(stmt) if stmt.stmt_type == StatementType::Upsert => {
                    chain.push(stmt);
                }
                Some(stmt) => {
                    base = Some(stmt);
                    break;
                }
                None => break,
            }
        }

        Ok(squash_chain(
            &*self.index.upsert_executor,
            &chain,
            base.as_ref(),
        ))
    }

    fn fill_cache(&mut self, stmt: &Statement) {
        if self.vlsn != VLSN_INF {
            return;
        }

        // Never cache prepared statements or own uncommitted writes
        if stmt.key.lsn > self.manager.lsn() {
            return;
        }

        self.index.cache.add(
            self.index.id(),
            stmt.clone(),
            self.prev_key.as_ref(),
            self.mode.is_forward(),
        );
    }

    fn track(&mut self, key: &UserKey, is_gap: bool) -> crate::Result<()> {
        if !self.track_reads {
            return Ok(());
        }

        if let Some(tx_id) = self.tx_id {
            self.manager.track_read(tx_id, &self.index, key, is_gap)?;
        }

        Ok(())
    }

    /// Yields the next materialised statement, or `None` at the end.
    pub fn next(&mut self) -> crate::Result<Option<Statement>> {
        loop {
            if self.finished {
                // An equality probe that found nothing is a gap read
                if !self.yielded_any && self.mode == SearchMode::Eq {
                    let key = self.search_key.clone();
                    self.track(&key, true)?;
                }
                return Ok(None);
            }

            if self.curr_range.is_none() {
                self.locate_range();
                self.build_merge();
            } else if self.merge.is_none() {
                self.build_merge();
            }

            #[allow(clippy::expect_used)]
            let merge = self.merge.as_mut().expect("merge is built");

            let step = match merge.next_key() {
                Ok(step) => step,
                Err(crate::Error::Invalidated) => {
                    self.invalidate();
                    continue;
                }
                Err(e) => return Err(e),
            };

            match step {
                MergeNext::End => {
                    self.finished = true;
                }
                MergeNext::RangeEnded => {
                    self.step_range();
                }
                MergeNext::Item(head) => {
                    let result = match head.stmt_type {
                        StatementType::Replace => Some(head.clone()),
                        StatementType::Delete => None,
                        StatementType::Upsert => {
                            match self.materialize_upsert(head.clone()) {
                                Ok(result) => result,
                                Err(crate::Error::Invalidated) => {
                                    // Re-read this key from scratch
                                    self.invalidate();
                                    continue;
                                }
                                Err(e) => return Err(e),
                            }
                        }
                        StatementType::Select => unreachable!("SELECT is never stored"),
                    };

                    // Position past this key, whether or not it
                    // produced a result
                    self.last = Some(head.clone());

                    let Some(result) = result else {
                        // DELETE (or a void UPSERT chain): skip
                        continue;
                    };

                    self.track(&result.key.user_key, false)?;
                    self.fill_cache(&result);
                    self.prev_key = Some(result.key.user_key.clone());
                    self.yielded_any = true;

                    return Ok(Some(result));
                }
            }
        }
    }

    /// Releases all resources.
    pub fn close(&mut self) {
        if let Some(mut merge) = self.merge.take() {
            merge.close();
        }
        self.finished = true;
    }
}

impl Drop for ReadIterator {
    fn drop(&mut self) {
        self.close();
    }
}
