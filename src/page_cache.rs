// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::run::{page::Page, RunId};
use quick_cache::{sync::Cache as QuickCache, Weighter};

#[derive(Eq, std::hash::Hash, PartialEq)]
struct CacheKey(RunId, u32);

#[derive(Clone)]
struct PageWeighter;

impl Weighter<CacheKey, Page> for PageWeighter {
    fn weight(&self, _: &CacheKey, page: &Page) -> u64 {
        page.weight()
    }
}

/// Cache of decoded run pages
///
/// Run readers go through this cache, so consecutive queries to nearby
/// data skip the disk. Run ids are unique across the environment, so
/// `(run id, page number)` identifies a page globally.
pub struct PageCache {
    data: QuickCache<CacheKey, Page, PageWeighter, rustc_hash::FxBuildHasher>,

    capacity: u64,
}

impl PageCache {
    /// Creates a new page cache with roughly `n` bytes of capacity.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        let opts = quick_cache::OptionsBuilder::new()
            .weight_capacity(bytes)
            .hot_allocation(0.9)
            .estimated_items_capacity(100_000)
            .build()
            .expect("cache options should be valid");

        #[allow(clippy::default_trait_access)]
        let quick_cache = QuickCache::with_options(
            opts,
            PageWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            data: quick_cache,
            capacity: bytes,
        }
    }

    /// Returns the cache capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the amount of cached bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.weight()
    }

    pub(crate) fn get(&self, run_id: RunId, page_no: u32) -> Option<Page> {
        self.data.get(&CacheKey(run_id, page_no))
    }

    pub(crate) fn insert(&self, run_id: RunId, page_no: u32, page: Page) {
        self.data.insert(CacheKey(run_id, page_no), page);
    }
}
