// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The layered merge iterator.
//!
//! Sources are appended oldest-suppresses-newest: transaction write
//! set first, then the read cache, the active mem, sealed mems (newest
//! to oldest) and runs (newest to oldest). Mutable sources (write set,
//! cache) are re-positioned via `restore` on every step, immutable
//! sources only advance when they sat on the front.

use crate::cache::ReadCache;
use crate::key::InternalKey;
use crate::memtable::Mem;
use crate::page_cache::PageCache;
use crate::range::tree::SearchMode;
use crate::range::Range;
use crate::run::{reader::RunCursor, Run};
use crate::seqno::{Lsn, VLSN_INF};
use crate::statement::Statement;
use crate::tx::{TxId, TxManager};
use crate::UserKey;
use enum_dispatch::enum_dispatch;
use std::sync::Arc;

/// A source's current candidate: the newest visible version of the
/// key the source is positioned on.
pub(crate) struct SourceItem {
    pub stmt: Statement,

    /// Raised by chained cache hits; suppresses all older sources
    /// for this key.
    pub stop: bool,
}

/// The five-method contract every merge source implements.
#[enum_dispatch]
pub(crate) trait MergeSource {
    /// Advances past all versions of the current key and yields the
    /// newest visible version of the next key in direction.
    fn next_key(&mut self) -> crate::Result<Option<SourceItem>>;

    /// Yields the next older visible version of the current key, or
    /// `None` when the key's history ends in this source.
    fn next_lsn(&mut self) -> crate::Result<Option<Statement>>;

    /// Repositions just past `last` (`None` = the iteration start) and
    /// yields the resulting candidate. The flag reports whether the
    /// position actually moved.
    fn restore(&mut self, last: Option<&Statement>)
        -> crate::Result<(Option<SourceItem>, bool)>;

    /// Releases per-step resources held on behalf of a worker.
    fn cleanup(&mut self) {}

    /// Releases all resources.
    fn close(&mut self) {}

    /// Mutable sources may change underneath an open iterator and are
    /// restored on every step.
    fn is_mutable(&self) -> bool;

    /// Range-bound sources end with their range; the others span the
    /// whole index.
    fn belongs_to_range(&self) -> bool;
}

#[enum_dispatch(MergeSource)]
pub(crate) enum Source {
    WriteSetSource,
    CacheSource,
    MemSource,
    RunSource,
}

/// Shared positioning parameters.
#[derive(Clone)]
pub(crate) struct SeekParams {
    pub mode: SearchMode,
    pub search_key: UserKey,
    pub vlsn: Lsn,
}

impl SeekParams {
    fn forward(&self) -> bool {
        self.mode.is_forward()
    }
}

// === Mem source ===

pub(crate) struct MemSource {
    mem: Arc<Mem>,
    params: SeekParams,

    /// Version most recently yielded
    pos: Option<InternalKey>,

    exhausted: bool,
}

impl MemSource {
    pub fn new(mem: Arc<Mem>, params: SeekParams) -> Self {
        Self {
            mem,
            params,
            pos: None,
            exhausted: false,
        }
    }

    /// Newest visible version of `key`, if any.
    fn newest_visible(&self, key: &UserKey) -> Option<Statement> {
        let probe = InternalKey::new(key.clone(), self.params.vlsn);
        let stmt = self.mem.range(probe..).next()?;

        (stmt.key.user_key == *key).then_some(stmt)
    }

    fn step_forward(&mut self, past_key: Option<&UserKey>) -> Option<Statement> {
        use std::ops::Bound::{Excluded, Included, Unbounded};

        let mut lower = match past_key {
            // Oldest possible version of the key sorts last within it
            Some(key) => Excluded(InternalKey::new(key.clone(), 0)),
            None => match self.params.mode {
                SearchMode::Ge | SearchMode::Eq => {
                    Included(InternalKey::new(self.params.search_key.clone(), u64::MAX))
                }
                SearchMode::Gt => {
                    Excluded(InternalKey::new(self.params.search_key.clone(), 0))
                }
                _ => unreachable!("forward step in backward iteration"),
            },
        };

        loop {
            let head = self.mem.range((lower.clone(), Unbounded)).next()?;
            let key = head.key.user_key.clone();

            if head.key.lsn <= self.params.vlsn {
                return Some(head);
            }

            // Newest version is above the snapshot; look for an older
            // visible one within the same key
            if let Some(stmt) = self.newest_visible(&key) {
                return Some(stmt);
            }

            // Key entirely invisible
            lower = Excluded(InternalKey::new(key, 0));
        }
    }

    fn step_backward(&mut self, before_key: Option<&UserKey>) -> Option<Statement> {
        use std::ops::Bound::{Excluded, Included, Unbounded};

        let mut upper = match before_key {
            // Newest version of the key sorts first within it
            Some(key) => Excluded(InternalKey::new(key.clone(), u64::MAX)),
            None => match self.params.mode {
                SearchMode::Le => {
                    Included(InternalKey::new(self.params.search_key.clone(), 0))
                }
                SearchMode::Lt => {
                    Excluded(InternalKey::new(self.params.search_key.clone(), u64::MAX))
                }
                _ => unreachable!("backward step in forward iteration"),
            },
        };

        loop {
            let tail = self.mem.range((Unbounded, upper.clone())).next_back()?;
            let key = tail.key.user_key.clone();

            if let Some(stmt) = self.newest_visible(&key) {
                return Some(stmt);
            }

            upper = Excluded(InternalKey::new(key, u64::MAX));
        }
    }

    fn step(&mut self, last_key: Option<&UserKey>) -> Option<SourceItem> {
        let stmt = if self.params.forward() {
            self.step_forward(last_key)
        } else {
            self.step_backward(last_key)
        };

        match stmt {
            Some(stmt) => {
                self.pos = Some(stmt.key.clone());
                Some(SourceItem { stmt, stop: false })
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

impl MergeSource for MemSource {
    fn next_key(&mut self) -> crate::Result<Option<SourceItem>> {
        if self.exhausted {
            return Ok(None);
        }
        let last_key = self.pos.as_ref().map(|p| p.user_key.clone());
        Ok(self.step(last_key.as_ref()))
    }

    fn next_lsn(&mut self) -> crate::Result<Option<Statement>> {
        use std::ops::Bound::{Excluded, Unbounded};

        let Some(pos) = self.pos.clone() else {
            return Ok(None);
        };

        let Some(stmt) = self.mem.range((Excluded(pos.clone()), Unbounded)).next() else {
            return Ok(None);
        };

        if stmt.key.user_key == pos.user_key {
            self.pos = Some(stmt.key.clone());
            Ok(Some(stmt))
        } else {
            Ok(None)
        }
    }

    fn restore(
        &mut self,
        last: Option<&Statement>,
    ) -> crate::Result<(Option<SourceItem>, bool)> {
        let target = last.map(|s| s.key.clone());
        let changed = self.pos != target;

        self.exhausted = false;
        let last_key = last.map(|s| s.key.user_key.clone());
        Ok((self.step(last_key.as_ref()), changed))
    }

    fn is_mutable(&self) -> bool {
        false
    }

    fn belongs_to_range(&self) -> bool {
        true
    }
}

// === Run source ===

pub(crate) struct RunSource {
    run: Arc<Run>,
    cursor: RunCursor,
    params: SeekParams,

    pos: Option<InternalKey>,
    exhausted: bool,
}

impl RunSource {
    pub fn new(
        run: Arc<Run>,
        page_cache: Arc<PageCache>,
        params: SeekParams,
        unique: bool,
    ) -> Self {
        // Equality search with a full key: let the bloom filter rule
        // the whole run out without touching the disk
        let bloom_miss = unique
            && params.mode == SearchMode::Eq
            && !run.may_contain(&params.search_key);

        let cursor = RunCursor::new(run.clone(), page_cache);

        Self {
            run,
            cursor,
            params,
            pos: None,
            exhausted: bloom_miss,
        }
    }

    /// Positions the cursor on the newest visible version of the next
    /// relevant key.
    fn step(&mut self, last_key: Option<&UserKey>) -> crate::Result<Option<SourceItem>> {
        if self.params.forward() {
            self.step_forward(last_key)
        } else {
            self.step_backward(last_key)
        }
    }

    fn step_forward(
        &mut self,
        last_key: Option<&UserKey>,
    ) -> crate::Result<Option<SourceItem>> {
        let found = match last_key {
            Some(key) => {
                // Just past the oldest version of the previous key
                if self.cursor.seek(&InternalKey::new(key.clone(), 0))? {
                    let same = self
                        .cursor
                        .current()?
                        .is_some_and(|s| s.key.user_key == *key);
                    if same {
                        self.cursor.advance()?
                    } else {
                        true
                    }
                } else {
                    false
                }
            }
            None => match self.params.mode {
                SearchMode::Ge | SearchMode::Eq => self.cursor.seek(&InternalKey::new(
                    self.params.search_key.clone(),
                    u64::MAX,
                ))?,
                SearchMode::Gt => {
                    let key = self.params.search_key.clone();
                    if self.cursor.seek(&InternalKey::new(key.clone(), 0))? {
                        let same = self
                            .cursor
                            .current()?
                            .is_some_and(|s| s.key.user_key == key);
                        if same {
                            self.cursor.advance()?
                        } else {
                            true
                        }
                    } else {
                        false
                    }
                }
                _ => unreachable!("forward step in backward iteration"),
            },
        };

        if !found {
            self.exhausted = true;
            return Ok(None);
        }

        loop {
            let Some(head) = self.cursor.current()? else {
                self.exhausted = true;
                return Ok(None);
            };

            if head.key.lsn <= self.params.vlsn {
                self.pos = Some(head.key.clone());
                return Ok(Some(SourceItem {
                    stmt: head,
                    stop: false,
                }));
            }

            // Version above the snapshot: try an older one of the
            // same key
            let key = head.key.user_key.clone();
            if !self
                .cursor
                .seek(&InternalKey::new(key.clone(), self.params.vlsn))?
            {
                self.exhausted = true;
                return Ok(None);
            }

            let Some(stmt) = self.cursor.current()? else {
                self.exhausted = true;
                return Ok(None);
            };

            if stmt.key.user_key == key {
                self.pos = Some(stmt.key.clone());
                return Ok(Some(SourceItem { stmt, stop: false }));
            }

            // Key entirely invisible; the cursor already sits on the
            // next key
        }
    }

    fn step_backward(
        &mut self,
        last_key: Option<&UserKey>,
    ) -> crate::Result<Option<SourceItem>> {
        let found = match last_key {
            Some(key) => self
                .cursor
                .seek_before(&InternalKey::new(key.clone(), u64::MAX))?,
            None => match self.params.mode {
                SearchMode::Le => {
                    // Position after the oldest version of the search
                    // key, then step back
                    let key = self.params.search_key.clone();
                    if self.cursor.seek(&InternalKey::new(key.clone(), 0))? {
                        let same = self
                            .cursor
                            .current()?
                            .is_some_and(|s| s.key.user_key == key);
                        if same {
                            true
                        } else {
                            self.cursor.retreat()?
                        }
                    } else {
                        self.cursor.seek_to_last()?
                    }
                }
                SearchMode::Lt => self
                    .cursor
                    .seek_before(&InternalKey::new(self.params.search_key.clone(), u64::MAX))?,
                _ => unreachable!("backward step in forward iteration"),
            },
        };

        if !found {
            self.exhausted = true;
            return Ok(None);
        }

        loop {
            let Some(tail) = self.cursor.current()? else {
                self.exhausted = true;
                return Ok(None);
            };

            let key = tail.key.user_key.clone();

            // Find the newest visible version of this key
            if self
                .cursor
                .seek(&InternalKey::new(key.clone(), self.params.vlsn))?
            {
                if let Some(stmt) = self.cursor.current()? {
                    if stmt.key.user_key == key {
                        self.pos = Some(stmt.key.clone());
                        return Ok(Some(SourceItem { stmt, stop: false }));
                    }
                }
            }

            // Key entirely invisible; continue before it
            if !self
                .cursor
                .seek_before(&InternalKey::new(key, u64::MAX))?
            {
                self.exhausted = true;
                return Ok(None);
            }
        }
    }
}

impl MergeSource for RunSource {
    fn next_key(&mut self) -> crate::Result<Option<SourceItem>> {
        if self.exhausted {
            return Ok(None);
        }
        let last_key = self.pos.as_ref().map(|p| p.user_key.clone());
        self.step(last_key.as_ref())
    }

    fn next_lsn(&mut self) -> crate::Result<Option<Statement>> {
        let Some(pos) = self.pos.clone() else {
            return Ok(None);
        };

        if !self.cursor.seek(&InternalKey::new(pos.user_key.clone(), pos.lsn))? {
            return Ok(None);
        }
        if !self.cursor.advance()? {
            return Ok(None);
        }

        let Some(stmt) = self.cursor.current()? else {
            return Ok(None);
        };

        if stmt.key.user_key == pos.user_key {
            self.pos = Some(stmt.key.clone());
            Ok(Some(stmt))
        } else {
            Ok(None)
        }
    }

    fn restore(
        &mut self,
        last: Option<&Statement>,
    ) -> crate::Result<(Option<SourceItem>, bool)> {
        let target = last.map(|s| s.key.clone());
        let changed = self.pos != target;

        if self.exhausted && self.run.is_empty() {
            return Ok((None, false));
        }

        self.exhausted = false;
        let last_key = last.map(|s| s.key.user_key.clone());
        let item = self.step(last_key.as_ref())?;
        Ok((item, changed))
    }

    fn is_mutable(&self) -> bool {
        false
    }

    fn belongs_to_range(&self) -> bool {
        true
    }
}

// === Transaction write set source ===

pub(crate) struct WriteSetSource {
    manager: Arc<TxManager>,
    tx_id: TxId,
    index_id: u64,
    params: SeekParams,

    pos: Option<UserKey>,
    exhausted: bool,
}

impl WriteSetSource {
    pub fn new(
        manager: Arc<TxManager>,
        tx_id: TxId,
        index_id: u64,
        params: SeekParams,
    ) -> Self {
        Self {
            manager,
            tx_id,
            index_id,
            params,
            pos: None,
            exhausted: false,
        }
    }

    fn step(&mut self, last_key: Option<&UserKey>) -> Option<SourceItem> {
        let forward = self.params.forward();

        let from = match last_key {
            Some(key) => Some((key.clone(), false)),
            None => match self.params.mode {
                SearchMode::Ge | SearchMode::Eq => {
                    Some((self.params.search_key.clone(), true))
                }
                SearchMode::Gt => Some((self.params.search_key.clone(), false)),
                SearchMode::Le => Some((self.params.search_key.clone(), true)),
                SearchMode::Lt => Some((self.params.search_key.clone(), false)),
            },
        };

        let stmt = self
            .manager
            .write_set_seek(self.tx_id, self.index_id, forward, from)?;

        // Own writes shadow every other source
        let stmt = stmt.with_lsn(Lsn::MAX);
        self.pos = Some(stmt.key.user_key.clone());
        Some(SourceItem { stmt, stop: false })
    }
}

impl MergeSource for WriteSetSource {
    fn next_key(&mut self) -> crate::Result<Option<SourceItem>> {
        if self.exhausted {
            return Ok(None);
        }
        let last = self.pos.clone();
        let item = self.step(last.as_ref());
        if item.is_none() {
            self.exhausted = true;
        }
        Ok(item)
    }

    fn next_lsn(&mut self) -> crate::Result<Option<Statement>> {
        // The write set holds one statement per key
        Ok(None)
    }

    fn restore(
        &mut self,
        last: Option<&Statement>,
    ) -> crate::Result<(Option<SourceItem>, bool)> {
        let target = last.map(|s| s.key.user_key.clone());
        let changed = self.pos != target;

        self.exhausted = false;
        let item = self.step(target.as_ref());
        Ok((item, changed))
    }

    fn is_mutable(&self) -> bool {
        true
    }

    fn belongs_to_range(&self) -> bool {
        false
    }
}

// === Read cache source ===

pub(crate) struct CacheSource {
    cache: Arc<ReadCache>,
    index_id: u64,
    params: SeekParams,

    pos: Option<UserKey>,
    exhausted: bool,
}

impl CacheSource {
    pub fn new(cache: Arc<ReadCache>, index_id: u64, params: SeekParams) -> Self {
        debug_assert_eq!(
            VLSN_INF, params.vlsn,
            "the cache only serves the global read view"
        );

        Self {
            cache,
            index_id,
            params,
            pos: None,
            exhausted: false,
        }
    }

    fn step(&mut self, last_key: Option<&UserKey>) -> Option<SourceItem> {
        if self.params.forward() {
            // Fresh inclusive seek: the search key itself may be cached
            if last_key.is_none()
                && matches!(self.params.mode, SearchMode::Ge | SearchMode::Eq)
            {
                if let Some(entry) = self.cache.get(self.index_id, &self.params.search_key) {
                    self.pos = Some(self.params.search_key.clone());

                    // A point hit is authoritative under the global
                    // view: the cache is invalidated on every write
                    return Some(SourceItem {
                        stmt: entry.stmt,
                        stop: true,
                    });
                }
            }

            let after = last_key.or(Some(&self.params.search_key));
            let (key, entry, pred) = self.cache.next_after(self.index_id, after)?;

            let stop = entry.left_linked && pred.as_ref() == last_key;

            self.pos = Some(key);
            Some(SourceItem {
                stmt: entry.stmt,
                stop,
            })
        } else {
            if last_key.is_none() && self.params.mode == SearchMode::Le {
                if let Some(entry) = self.cache.get(self.index_id, &self.params.search_key) {
                    self.pos = Some(self.params.search_key.clone());
                    return Some(SourceItem {
                        stmt: entry.stmt,
                        stop: true,
                    });
                }
            }

            let before = last_key.unwrap_or(&self.params.search_key);
            let (key, entry, succ) = self.cache.prev_before(self.index_id, before)?;

            let stop = entry.right_linked && succ.as_ref() == last_key;

            self.pos = Some(key);
            Some(SourceItem {
                stmt: entry.stmt,
                stop,
            })
        }
    }
}

impl MergeSource for CacheSource {
    fn next_key(&mut self) -> crate::Result<Option<SourceItem>> {
        if self.exhausted {
            return Ok(None);
        }
        let last = self.pos.clone();
        let item = self.step(last.as_ref());
        if item.is_none() {
            self.exhausted = true;
        }
        Ok(item)
    }

    fn next_lsn(&mut self) -> crate::Result<Option<Statement>> {
        // The cache holds one materialised version per key
        Ok(None)
    }

    fn restore(
        &mut self,
        last: Option<&Statement>,
    ) -> crate::Result<(Option<SourceItem>, bool)> {
        let target = last.map(|s| s.key.user_key.clone());
        let changed = self.pos != target;

        self.exhausted = false;
        let item = self.step(target.as_ref());
        Ok((item, changed))
    }

    fn is_mutable(&self) -> bool {
        true
    }

    fn belongs_to_range(&self) -> bool {
        false
    }
}

// === The merge iterator itself ===

/// Result of advancing the merge iterator by one key.
pub(crate) enum MergeNext {
    /// Newest visible version of the next key
    Item(Statement),

    /// The next key lies past the current range
    RangeEnded,

    /// Iteration is complete
    End,
}

/// Version snapshot taken at open; any change invalidates the iterator.
struct VersionGuard {
    range: Arc<Range>,
    tree_version: u64,
    range_version: u64,
    tree_version_probe: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl VersionGuard {
    fn check(&self) -> crate::Result<()> {
        if (self.tree_version_probe)() != self.tree_version
            || self.range.version() != self.range_version
        {
            return Err(crate::Error::Invalidated);
        }
        Ok(())
    }
}

pub(crate) struct MergeIterator {
    sources: Vec<Source>,

    /// Candidate per source
    curr: Vec<Option<SourceItem>>,

    /// Sources positioned on the most recently emitted key
    on_front: Vec<bool>,

    /// Per-front-source version heads for `next_lsn`
    heads: Vec<Option<Statement>>,

    params: SeekParams,

    /// Boundary of the current range in iteration direction
    range_bound: Option<UserKey>,

    /// First emitted version of the current key; restore target
    last_emitted: Option<Statement>,

    /// LSN of the most recently emitted version of the current key
    last_version_lsn: Option<Lsn>,

    unique_optimization: bool,
    emitted_unique: bool,

    initialized: bool,

    guard: Option<VersionGuard>,
}

impl MergeIterator {
    pub fn new(
        sources: Vec<Source>,
        params: SeekParams,
        range_bound: Option<UserKey>,
        unique_optimization: bool,
        position_after: Option<Statement>,
    ) -> Self {
        let n = sources.len();

        Self {
            sources,
            curr: (0..n).map(|_| None).collect(),
            on_front: vec![false; n],
            heads: (0..n).map(|_| None).collect(),
            params,
            range_bound,
            last_emitted: position_after,
            last_version_lsn: None,
            unique_optimization,
            emitted_unique: false,
            initialized: false,
            guard: None,
        }
    }

    /// Installs version tracking; any range-tree or range-content
    /// change after this point invalidates the iterator.
    pub fn with_version_guard(
        mut self,
        range: Arc<Range>,
        tree_version: u64,
        tree_version_probe: Arc<dyn Fn() -> u64 + Send + Sync>,
    ) -> Self {
        self.guard = Some(VersionGuard {
            range_version: range.version(),
            range,
            tree_version,
            tree_version_probe,
        });
        self
    }

    fn check_versions(&self) -> crate::Result<()> {
        match &self.guard {
            Some(guard) => guard.check(),
            None => Ok(()),
        }
    }

    fn direction_less(&self, a: &UserKey, b: &UserKey) -> bool {
        if self.params.forward() {
            a < b
        } else {
            a > b
        }
    }

    fn out_of_range(&self, key: &UserKey) -> bool {
        match &self.range_bound {
            Some(bound) => {
                if self.params.forward() {
                    key >= bound
                } else {
                    key < bound
                }
            }
            None => false,
        }
    }

    fn matches_eq_prefix(&self, key: &UserKey) -> bool {
        self.params.mode != SearchMode::Eq || key.starts_with(&self.params.search_key)
    }

    /// Advances to the next key and yields its newest visible version.
    pub fn next_key(&mut self) -> crate::Result<MergeNext> {
        self.check_versions()?;

        if self.unique_optimization && self.emitted_unique {
            return Ok(MergeNext::End);
        }

        let last = self.last_emitted.clone();

        // Reposition sources: front sources advance, skipped mutable
        // sources are restored in case something appeared behind the
        // candidates of the others
        for idx in 0..self.sources.len() {
            #[allow(clippy::indexing_slicing)]
            {
                if !self.initialized {
                    let (item, _) = self.sources[idx].restore(last.as_ref())?;
                    self.curr[idx] = item;
                } else if self.on_front[idx] {
                    self.curr[idx] = self.sources[idx].next_key()?;
                } else if self.sources[idx].is_mutable() {
                    let (item, _) = self.sources[idx].restore(last.as_ref())?;
                    self.curr[idx] = item;
                }
                self.on_front[idx] = false;
                self.heads[idx] = None;
            }
        }
        self.initialized = true;

        // Track the direction-minimum; a raised stop flag emits the
        // current best without consulting later (older) sources
        let mut best_key: Option<UserKey> = None;
        let mut stopped = false;

        #[allow(clippy::indexing_slicing)]
        for idx in 0..self.sources.len() {
            if let Some(item) = &self.curr[idx] {
                let key = &item.stmt.key.user_key;

                let better = match &best_key {
                    Some(best) => self.direction_less(key, best),
                    None => true,
                };

                if better {
                    best_key = Some(key.clone());
                    if item.stop {
                        stopped = true;
                    }
                }
            }

            if stopped {
                break;
            }
        }

        let Some(best_key) = best_key else {
            return Ok(if self.range_bound.is_some() {
                MergeNext::RangeEnded
            } else {
                MergeNext::End
            });
        };

        if self.out_of_range(&best_key) {
            return Ok(MergeNext::RangeEnded);
        }

        if !self.matches_eq_prefix(&best_key) {
            return Ok(MergeNext::End);
        }

        // All sources on the minimum join the new front
        #[allow(clippy::indexing_slicing)]
        for idx in 0..self.sources.len() {
            if let Some(item) = &self.curr[idx] {
                if item.stmt.key.user_key == best_key {
                    self.on_front[idx] = true;
                    self.heads[idx] = Some(item.stmt.clone());
                }
            }
        }

        // Newest version across the front
        let (src_idx, stmt) = self.pick_newest_head();

        #[allow(clippy::indexing_slicing)]
        let Some(stmt) = stmt else {
            return Ok(MergeNext::End);
        };

        self.consume_head(src_idx, stmt.key.lsn)?;

        self.last_emitted = Some(stmt.clone());
        self.last_version_lsn = Some(stmt.key.lsn);
        self.emitted_unique = true;

        Ok(MergeNext::Item(stmt))
    }

    fn pick_newest_head(&self) -> (usize, Option<Statement>) {
        let mut best: Option<(usize, Statement)> = None;

        #[allow(clippy::indexing_slicing)]
        for idx in 0..self.sources.len() {
            if let Some(head) = &self.heads[idx] {
                let newer = match &best {
                    Some((_, b)) => head.key.lsn > b.key.lsn,
                    None => true,
                };
                if newer {
                    best = Some((idx, head.clone()));
                }
            }
        }

        match best {
            Some((idx, stmt)) => (idx, Some(stmt)),
            None => (0, None),
        }
    }

    /// Advances the heads that yielded (or duplicated) the emitted
    /// version.
    #[allow(clippy::indexing_slicing)]
    fn consume_head(&mut self, src_idx: usize, lsn: Lsn) -> crate::Result<()> {
        for idx in 0..self.sources.len() {
            if !self.on_front[idx] {
                continue;
            }

            let is_duplicate = idx != src_idx
                && self.heads[idx]
                    .as_ref()
                    .is_some_and(|h| h.key.lsn == lsn);

            if idx == src_idx || is_duplicate {
                self.heads[idx] = self.sources[idx].next_lsn()?;
            }
        }

        Ok(())
    }

    /// Yields the next older version of the current key.
    pub fn next_lsn(&mut self) -> crate::Result<Option<Statement>> {
        self.check_versions()?;

        let (src_idx, stmt) = self.pick_newest_head();

        let Some(stmt) = stmt else {
            return Ok(None);
        };

        self.consume_head(src_idx, stmt.key.lsn)?;
        self.last_version_lsn = Some(stmt.key.lsn);

        Ok(Some(stmt))
    }

    /// Last key emitted; the restore point after an invalidation.
    pub fn last_emitted(&self) -> Option<&Statement> {
        self.last_emitted.as_ref()
    }

    pub fn close(&mut self) {
        for source in &mut self.sources {
            source.cleanup();
        }
        for source in &mut self.sources {
            source.close();
        }
    }
}
