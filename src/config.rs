// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::upsert::{OverwriteExecutor, UpsertExecutor};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

const DEFAULT_FILE_FOLDER: &str = ".lsm.data";

/// Engine configuration builder
#[derive(Clone)]
pub struct Config {
    /// Base folder
    #[doc(hidden)]
    pub path: PathBuf,

    /// Memory quota over all in-memory trees in bytes
    pub memory_limit: u64,

    /// Read cache capacity in bytes
    pub cache_size: u64,

    /// False positive rate bound for run bloom filters
    pub bloom_fpr: f32,

    /// Number of worker threads; at least two, so one thread stays
    /// reserved for dumps when compactions saturate the pool
    pub worker_pool_size: usize,

    /// Target size of a range in bytes; drives split and coalesce
    pub range_size_target: u64,

    /// Target encoded size of a run page in bytes
    pub page_size: u32,

    /// Maximum number of runs per level before compaction kicks in
    pub run_count_per_level: u32,

    /// Size ratio between adjacent levels of a range
    pub run_size_ratio: f64,

    /// Interprets UPSERT operation blobs
    pub upsert_executor: Arc<dyn UpsertExecutor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_FILE_FOLDER),
            memory_limit: /* 64 MiB */ 64 * 1_024 * 1_024,
            cache_size: /* 16 MiB */ 16 * 1_024 * 1_024,
            bloom_fpr: 0.01,
            worker_pool_size: 2,
            range_size_target: /* 1 GiB */ 1_024 * 1_024 * 1_024,
            page_size: /* 8 KiB */ 8_192,
            run_count_per_level: 2,
            run_size_ratio: 3.5,
            upsert_executor: Arc::new(OverwriteExecutor),
        }
    }
}

impl Config {
    /// Initializes a new config
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            ..Default::default()
        }
    }

    /// Sets the memory quota in bytes.
    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Sets the read cache capacity in bytes.
    #[must_use]
    pub fn cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Sets the bloom filter false positive rate bound.
    #[must_use]
    pub fn bloom_fpr(mut self, fpr: f32) -> Self {
        self.bloom_fpr = fpr;
        self
    }

    /// Sets the worker pool size.
    ///
    /// # Panics
    ///
    /// Panics if `n < 2`; with a single worker a memory-quota stall
    /// can deadlock behind a long compaction.
    #[must_use]
    pub fn worker_pool_size(mut self, n: usize) -> Self {
        assert!(n >= 2, "worker pool needs at least 2 threads");
        self.worker_pool_size = n;
        self
    }

    /// Sets the target range size in bytes.
    #[must_use]
    pub fn range_size_target(mut self, bytes: u64) -> Self {
        self.range_size_target = bytes;
        self
    }

    /// Sets the target page size in bytes.
    #[must_use]
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the maximum run count per level.
    #[must_use]
    pub fn run_count_per_level(mut self, n: u32) -> Self {
        assert!(n > 0);
        self.run_count_per_level = n;
        self
    }

    /// Sets the level size ratio.
    #[must_use]
    pub fn run_size_ratio(mut self, ratio: f64) -> Self {
        assert!(ratio > 1.0);
        self.run_size_ratio = ratio;
        self
    }

    /// Sets the upsert executor.
    #[must_use]
    pub fn upsert_executor(mut self, executor: Arc<dyn UpsertExecutor>) -> Self {
        self.upsert_executor = executor;
        self
    }

    /// Recovers the engine state from the metadata log (if any) and
    /// brings the environment online.
    pub fn open(self) -> crate::Result<crate::Environment> {
        Ok(self.begin_recovery()?.finish()?)
    }

    /// Starts recovery, allowing the host to replay its WAL before the
    /// environment goes online.
    pub fn begin_recovery(self) -> crate::Result<crate::recovery::Recovery> {
        crate::recovery::Recovery::new(self)
    }
}
