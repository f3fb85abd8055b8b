// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::Range;
use crate::UserKey;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering::AcqRel, Ordering::Acquire};
use std::sync::Arc;

/// Iteration mode of a read
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SearchMode {
    /// Keys equal to (or, for a partial key, prefixed by) the search key
    Eq,

    /// Keys at or after the search key, ascending
    Ge,

    /// Keys after the search key, ascending
    Gt,

    /// Keys at or before the search key, descending
    Le,

    /// Keys before the search key, descending
    Lt,
}

impl SearchMode {
    #[must_use]
    pub fn is_forward(self) -> bool {
        matches!(self, Self::Eq | Self::Ge | Self::Gt)
    }
}

/// Per-index partitioning of the key space into disjoint ranges,
/// keyed by `begin` with negative infinity (`None`) sorting first.
pub struct RangeTree {
    map: BTreeMap<Option<UserKey>, Arc<Range>>,

    /// Bumped on every insert/remove; open merge iterators treat a
    /// bump as invalidation
    version: AtomicU64,
}

impl RangeTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            version: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Acquire)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Range>> {
        self.map.values()
    }

    pub fn insert(&mut self, range: Arc<Range>) {
        self.map.insert(range.begin().cloned(), range);
        self.version.fetch_add(1, AcqRel);
    }

    pub fn remove(&mut self, range: &Range) {
        self.map.remove(&range.begin().cloned());
        self.version.fetch_add(1, AcqRel);
    }

    /// The unique range whose interval contains `key`.
    ///
    /// # Panics
    ///
    /// Panics if the tree is empty; an index always has at least
    /// one range.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn locate_for_write(&self, key: &[u8]) -> Arc<Range> {
        self.map
            .range((
                Bound::Unbounded,
                Bound::Included(Some(UserKey::from(key))),
            ))
            .next_back()
            .map(|(_, r)| r.clone())
            .expect("range tree tiles the key space")
    }

    fn predecessor(&self, range: &Range) -> Option<Arc<Range>> {
        self.map
            .range((Bound::Unbounded, Bound::Excluded(range.begin().cloned())))
            .next_back()
            .map(|(_, r)| r.clone())
    }

    fn successor(&self, range: &Range) -> Option<Arc<Range>> {
        self.map
            .range((Bound::Excluded(range.begin().cloned()), Bound::Unbounded))
            .next()
            .map(|(_, r)| r.clone())
    }

    /// The starting range of an iteration.
    ///
    /// For ascending iteration with a partial key, positions at the
    /// predecessor when the found range's `begin` extends the search
    /// key beyond its parts - keys matching the prefix may sort before
    /// the boundary. For `Lt`, a search key equal to a range's `begin`
    /// positions at the predecessor outright.
    #[must_use]
    pub fn locate_for_read(&self, mode: SearchMode, key: &[u8]) -> Arc<Range> {
        let found = self.locate_for_write(key);

        match mode {
            SearchMode::Eq | SearchMode::Ge | SearchMode::Gt => {
                if let Some(begin) = found.begin() {
                    if begin.len() > key.len() && begin.starts_with(key) {
                        if let Some(prev) = self.predecessor(&found) {
                            return prev;
                        }
                    }
                }
                found
            }
            SearchMode::Lt => {
                if found.begin().is_some_and(|begin| &**begin == key) {
                    if let Some(prev) = self.predecessor(&found) {
                        return prev;
                    }
                }
                found
            }
            SearchMode::Le => found,
        }
    }

    /// The next range in iteration direction, or `None` at the end.
    ///
    /// Equality iteration terminates once the current range's `end` is
    /// already past every key carrying the search prefix.
    #[must_use]
    pub fn walk(&self, current: &Range, mode: SearchMode, key: &[u8]) -> Option<Arc<Range>> {
        if mode.is_forward() {
            if mode == SearchMode::Eq {
                if let Some(end) = current.end() {
                    let head = end.get(..key.len().min(end.len()))?;
                    if head > key {
                        return None;
                    }
                }
            }

            // The rightmost range has no successor
            current.end()?;

            self.successor(current)
        } else {
            self.predecessor(current)
        }
    }
}

impl Default for RangeTree {
    fn default() -> Self {
        Self::new()
    }
}
