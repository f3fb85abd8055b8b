// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::statement::Statement;
use crate::UserKey;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering::AcqRel, Ordering::Acquire};
use std::sync::Mutex;

type CacheKey = (u64, UserKey);

/// A cached materialised statement plus chain markers.
///
/// `left_linked` means there is no key in the index between this entry
/// and its cache predecessor; `right_linked` mirrors that for the
/// successor. A linked hit lets the merge iterator skip all older
/// sources for the key.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    pub stmt: Statement,
    pub left_linked: bool,
    pub right_linked: bool,
}

struct CacheInner {
    map: BTreeMap<CacheKey, CacheEntry>,

    /// Insertion order, drives eviction
    queue: VecDeque<CacheKey>,

    used: u64,
}

impl CacheInner {
    fn entry_weight(stmt: &Statement) -> u64 {
        (stmt.size() + 64) as u64
    }

    /// Removes one entry, dropping the chain markers that spanned it.
    fn remove(&mut self, key: &CacheKey) {
        if self.map.remove(key).is_none() {
            return;
        }

        if let Some((_, prev)) = self
            .map
            .range_mut((Bound::Unbounded, Bound::Excluded(key.clone())))
            .next_back()
            .filter(|(k, _)| k.0 == key.0)
        {
            prev.right_linked = false;
        }

        if let Some((_, next)) = self
            .map
            .range_mut((Bound::Excluded(key.clone()), Bound::Unbounded))
            .next()
            .filter(|(k, _)| k.0 == key.0)
        {
            next.left_linked = false;
        }
    }

    fn evict_until_within(&mut self, capacity: u64) {
        while self.used > capacity {
            let Some(victim) = self.queue.pop_front() else {
                break;
            };

            if let Some(entry) = self.map.get(&victim) {
                self.used = self
                    .used
                    .saturating_sub(Self::entry_weight(&entry.stmt));
                self.remove(&victim);
            }
        }
    }
}

/// Read-through cache of materialised statements
///
/// Populated by the read iterator while it runs under the global read
/// view; reads under a stale view must not pollute it. Besides point
/// hits, the cache records `(previous key -> current key)` continuation
/// markers so a chained hit can short-circuit the merge across range
/// boundaries.
pub struct ReadCache {
    inner: Mutex<CacheInner>,

    capacity: u64,

    /// Bumped on every mutation; merge sources over the cache are
    /// mutable and use this for restore decisions.
    version: AtomicU64,
}

impl ReadCache {
    /// Creates a new cache with roughly `n` bytes of capacity.
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: BTreeMap::new(),
                queue: VecDeque::new(),
                used: 0,
            }),
            capacity: bytes,
            version: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the amount of cached bytes.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn size(&self) -> u64 {
        self.inner.lock().expect("lock is poisoned").used
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Acquire)
    }

    /// Stores a statement the read iterator has just yielded.
    ///
    /// `prev_key` is the key yielded immediately before (in iteration
    /// order); if the two entries are cache-adjacent, a chain marker is
    /// recorded between them.
    #[allow(clippy::expect_used)]
    pub(crate) fn add(
        &self,
        index_id: u64,
        stmt: Statement,
        prev_key: Option<&UserKey>,
        forward: bool,
    ) {
        let key: CacheKey = (index_id, stmt.key.user_key.clone());
        let weight = CacheInner::entry_weight(&stmt);

        if weight > self.capacity {
            return;
        }

        let mut inner = self.inner.lock().expect("lock is poisoned");

        if let Some(existing) = inner.map.get_mut(&key) {
            existing.stmt = stmt;
        } else {
            inner.map.insert(
                key.clone(),
                CacheEntry {
                    stmt,
                    left_linked: false,
                    right_linked: false,
                },
            );
            inner.queue.push_back(key.clone());
            inner.used += weight;
        }

        if let Some(prev_key) = prev_key {
            let (lo, hi) = if forward {
                (prev_key.clone(), key.1.clone())
            } else {
                (key.1.clone(), prev_key.clone())
            };

            // Only mark the chain if the two entries are adjacent in the
            // cache; an entry between them would invalidate the marker
            let adjacent = inner
                .map
                .range((
                    Bound::Excluded((index_id, lo.clone())),
                    Bound::Excluded((index_id, hi.clone())),
                ))
                .next()
                .is_none();

            if adjacent {
                if let Some(entry) = inner.map.get_mut(&(index_id, lo)) {
                    entry.right_linked = true;
                }
                if let Some(entry) = inner.map.get_mut(&(index_id, hi)) {
                    entry.left_linked = true;
                }
            }
        }

        let capacity = self.capacity;
        inner.evict_until_within(capacity);

        self.version.fetch_add(1, AcqRel);
    }

    /// Point probe.
    #[allow(clippy::expect_used)]
    pub(crate) fn get(&self, index_id: u64, key: &UserKey) -> Option<CacheEntry> {
        let inner = self.inner.lock().expect("lock is poisoned");
        inner.map.get(&(index_id, key.clone())).cloned()
    }

    /// First entry after `after` (or the first entry of the index), plus
    /// the key of its cache predecessor.
    #[allow(clippy::expect_used)]
    pub(crate) fn next_after(
        &self,
        index_id: u64,
        after: Option<&UserKey>,
    ) -> Option<(UserKey, CacheEntry, Option<UserKey>)> {
        let inner = self.inner.lock().expect("lock is poisoned");

        let lower: Bound<CacheKey> = match after {
            Some(key) => Bound::Excluded((index_id, key.clone())),
            None => Bound::Included((index_id, UserKey::empty())),
        };

        let (found_key, entry) = inner
            .map
            .range((lower, Bound::Unbounded))
            .next()
            .filter(|(k, _)| k.0 == index_id)
            .map(|(k, v)| (k.clone(), v.clone()))?;

        let pred = inner
            .map
            .range((Bound::Unbounded, Bound::Excluded(found_key.clone())))
            .next_back()
            .filter(|(k, _)| k.0 == index_id)
            .map(|(k, _)| k.1.clone());

        Some((found_key.1, entry, pred))
    }

    /// Last entry before `before`, plus the key of its cache successor.
    #[allow(clippy::expect_used)]
    pub(crate) fn prev_before(
        &self,
        index_id: u64,
        before: &UserKey,
    ) -> Option<(UserKey, CacheEntry, Option<UserKey>)> {
        let inner = self.inner.lock().expect("lock is poisoned");

        let (found_key, entry) = inner
            .map
            .range((
                Bound::Included((index_id, UserKey::empty())),
                Bound::Excluded((index_id, before.clone())),
            ))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))?;

        let succ = inner
            .map
            .range((Bound::Excluded(found_key.clone()), Bound::Unbounded))
            .next()
            .filter(|(k, _)| k.0 == index_id)
            .map(|(k, _)| k.1.clone());

        Some((found_key.1, entry, succ))
    }

    /// Invalidates a key a transaction is about to write.
    #[allow(clippy::expect_used)]
    pub(crate) fn on_write(&self, index_id: u64, key: &UserKey) {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        let cache_key = (index_id, key.clone());

        if let Some(entry) = inner.map.get(&cache_key) {
            let weight = CacheInner::entry_weight(&entry.stmt);
            inner.used = inner.used.saturating_sub(weight);
        }

        // Clear the markers around the written key even if the key
        // itself is not cached; a new key may land between two
        // chained neighbours
        inner.remove(&cache_key);

        let pred_key = inner
            .map
            .range((Bound::Unbounded, Bound::Excluded(cache_key.clone())))
            .next_back()
            .filter(|(k, _)| k.0 == index_id)
            .map(|(k, _)| k.clone());

        if let Some(pred_key) = pred_key {
            #[allow(clippy::expect_used)]
            let pred = inner.map.get_mut(&pred_key).expect("entry exists");
            pred.right_linked = false;
        }

        let succ_key = inner
            .map
            .range((Bound::Excluded(cache_key), Bound::Unbounded))
            .next()
            .filter(|(k, _)| k.0 == index_id)
            .map(|(k, _)| k.clone());

        if let Some(succ_key) = succ_key {
            #[allow(clippy::expect_used)]
            let succ = inner.map.get_mut(&succ_key).expect("entry exists");
            succ.left_linked = false;
        }

        self.version.fetch_add(1, AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn replace(key: &[u8], lsn: u64) -> Statement {
        Statement::replace(key, *b"v", lsn)
    }

    #[test]
    fn cache_point_hit() {
        let cache = ReadCache::with_capacity_bytes(1_024 * 1_024);

        cache.add(1, replace(b"a", 5), None, true);

        let entry = cache.get(1, &(*b"a").into()).unwrap();
        assert_eq!(5, entry.stmt.key.lsn);

        assert!(cache.get(2, &(*b"a").into()).is_none(), "per-index keys");
    }

    #[test]
    fn cache_chain_links() {
        let cache = ReadCache::with_capacity_bytes(1_024 * 1_024);

        cache.add(1, replace(b"a", 1), None, true);
        cache.add(1, replace(b"c", 1), Some(&(*b"a").into()), true);

        let (key, entry, pred) = cache.next_after(1, Some(&(*b"a").into())).unwrap();
        assert_eq!(*b"c", &*key);
        assert!(entry.left_linked);
        assert_eq!(Some((*b"a").into()), pred);
    }

    #[test]
    fn cache_write_invalidates_chain() {
        let cache = ReadCache::with_capacity_bytes(1_024 * 1_024);

        cache.add(1, replace(b"a", 1), None, true);
        cache.add(1, replace(b"c", 1), Some(&(*b"a").into()), true);

        // "b" lands between the chained neighbours
        cache.on_write(1, &(*b"b").into());

        let (_, entry, _) = cache.next_after(1, Some(&(*b"a").into())).unwrap();
        assert!(!entry.left_linked, "chain across a written key must drop");
    }

    #[test]
    fn cache_chain_not_marked_when_not_adjacent() {
        let cache = ReadCache::with_capacity_bytes(1_024 * 1_024);

        cache.add(1, replace(b"b", 1), None, true);
        cache.add(1, replace(b"a", 1), None, true);

        // "c" follows "a" in the index, but "b" sits between them
        // in the cache
        cache.add(1, replace(b"c", 1), Some(&(*b"a").into()), true);

        let entry = cache.get(1, &(*b"c").into()).unwrap();
        assert!(!entry.left_linked);
    }

    #[test]
    fn cache_eviction_respects_budget() {
        let cache = ReadCache::with_capacity_bytes(600);

        for i in 0u64..100 {
            cache.add(1, replace(&i.to_be_bytes(), 1), None, true);
        }

        assert!(cache.size() <= 600);
    }

    #[test]
    fn cache_reverse_chain() {
        let cache = ReadCache::with_capacity_bytes(1_024 * 1_024);

        // Reverse iteration yields "c" then "a"
        cache.add(1, replace(b"c", 1), None, false);
        cache.add(1, replace(b"a", 1), Some(&(*b"c").into()), false);

        let (key, entry, succ) = cache.prev_before(1, &(*b"c").into()).unwrap();
        assert_eq!(*b"a", &*key);
        assert!(entry.right_linked);
        assert_eq!(Some((*b"c").into()), succ);
    }
}
