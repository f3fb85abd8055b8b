// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::cache::ReadCache;
use crate::page_cache::PageCache;
use crate::range::{tree::RangeTree, Range};
use crate::tx::read_set::ReadSet;
use crate::upsert::UpsertExecutor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering::Acquire, Ordering::Release};
use std::sync::{Arc, Mutex, RwLock};

/// Monotonic index id, unique across the environment.
pub type IndexId = u64;

/// Fixed key definition of an index.
///
/// Keys are opaque byte strings compared lexicographically; a partial
/// key is a byte prefix covering fewer than `part_count` parts. For a
/// secondary index, `part_count` describes the user-visible key while
/// the stored keys are extended with primary-key parts to
/// disambiguate duplicates.
#[derive(Clone, Debug)]
pub struct KeyDef {
    pub part_count: u32,
}

/// Options for creating an index
#[derive(Clone, Debug)]
pub struct IndexOptions {
    /// Space (table) the index belongs to; part of the on-disk path
    pub space_id: u64,

    /// User-visible key part count
    pub part_count: u32,

    /// Bitset of tuple columns the key covers; drives the
    /// secondary-index write suppression
    pub column_mask: u64,

    /// Primary indexes accept UPSERTs; secondary indexes only ever
    /// store REPLACE and DELETE
    pub is_primary: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            space_id: 0,
            part_count: 1,
            column_mask: u64::MAX,
            is_primary: true,
        }
    }
}

/// A named ordered key-value store: a range tree plus the per-index
/// read set, cache handles and formats.
pub struct Index {
    id: IndexId,
    name: String,

    key_def: KeyDef,
    options: IndexOptions,

    pub(crate) tree: RwLock<RangeTree>,

    pub(crate) read_set: Mutex<ReadSet>,

    pub(crate) cache: Arc<ReadCache>,
    pub(crate) page_cache: Arc<PageCache>,

    pub(crate) upsert_executor: Arc<dyn UpsertExecutor>,

    /// Folder holding this index's run files
    pub(crate) dir: PathBuf,

    dropped: AtomicBool,
}

impl Index {
    pub(crate) fn new(
        id: IndexId,
        name: String,
        options: IndexOptions,
        base: &std::path::Path,
        cache: Arc<ReadCache>,
        page_cache: Arc<PageCache>,
        upsert_executor: Arc<dyn UpsertExecutor>,
    ) -> Self {
        let dir = base.join(options.space_id.to_string()).join(id.to_string());

        Self {
            id,
            name,
            key_def: KeyDef {
                part_count: options.part_count,
            },
            options,
            tree: RwLock::new(RangeTree::new()),
            read_set: Mutex::new(ReadSet::new()),
            cache,
            page_cache,
            upsert_executor,
            dir,
            dropped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> IndexId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn key_def(&self) -> &KeyDef {
        &self.key_def
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.options.is_primary
    }

    #[must_use]
    pub fn column_mask(&self) -> u64 {
        self.options.column_mask
    }

    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Acquire)
    }

    pub(crate) fn mark_dropped(&self) {
        self.dropped.store(true, Release);
    }

    /// Returns `true` if `key` has every key part (drives the unique
    /// optimisation; with opaque keys, the caller states it).
    #[must_use]
    pub fn is_full_key(&self, exact: bool) -> bool {
        exact
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn tree_version(&self) -> u64 {
        self.tree.read().expect("lock is poisoned").version()
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn locate_for_write(&self, key: &[u8]) -> Arc<Range> {
        self.tree
            .read()
            .expect("lock is poisoned")
            .locate_for_write(key)
    }

    /// Accounted footprint: (in-memory bytes, on-disk bytes), summed
    /// over all ranges.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn footprint(&self) -> (u64, u64) {
        let tree = self.tree.read().expect("lock is poisoned");

        let mut mem_bytes = 0;
        let mut run_bytes = 0;

        for range in tree.iter() {
            mem_bytes += range.mem_used();
            run_bytes += range.size() - range.mem_used();
        }

        (mem_bytes, run_bytes)
    }

    /// Number of ranges partitioning the key space.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn range_count(&self) -> usize {
        self.tree.read().expect("lock is poisoned").len()
    }

    /// All ranges, in key order.
    #[allow(clippy::expect_used)]
    pub(crate) fn ranges(&self) -> Vec<Arc<Range>> {
        self.tree
            .read()
            .expect("lock is poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Index#{}({})", self.id, self.name)
    }
}
