// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Crash recovery: rebuilding indexes, ranges and runs from the
//! metadata log, sweeping orphans, validating the range tiling, and
//! replaying host-WAL statements that were never dumped.

use crate::config::Config;
use crate::env::{EnvInner, Environment, Status};
use crate::index::{Index, IndexId, IndexOptions};
use crate::memtable::Mem;
use crate::metadata_log::{MetadataLog, MetadataRecord};
use crate::range::{Range, RangeId};
use crate::run::{Run, RunId};
use crate::seqno::is_committed;
use crate::statement::Statement;
use rustc_hash::FxHashMap;
use std::sync::atomic::Ordering::Acquire;
use std::sync::Arc;

/// An environment mid-recovery: the metadata log has been consumed,
/// and the host may now replay its WAL before going online.
pub struct Recovery {
    inner: Arc<EnvInner>,
}

impl Recovery {
    pub(crate) fn new(config: Config) -> crate::Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let (log, records) = MetadataLog::open(&config.path)?;

        let inner = EnvInner::create(config, log);

        inner.set_status(Status::InitialRecovery);
        inner.log.set_deferring(true)?;

        apply_records(&inner, records)?;

        inner.set_status(Status::FinalRecovery);

        Ok(Self { inner })
    }

    /// Looks a recovered index up by name.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<Arc<Index>> {
        self.inner.index_by_name(name)
    }

    /// Replays one committed statement from the host WAL.
    ///
    /// Statements whose LSN is at or below the max LSN of any run in
    /// the target range were already dumped and are skipped.
    #[allow(clippy::expect_used)]
    pub fn replay(&self, index: &Arc<Index>, stmt: Statement) -> crate::Result<()> {
        debug_assert!(is_committed(stmt.key.lsn));

        let range = index.locate_for_write(&stmt.key.user_key);

        let already_dumped = {
            let state = range.state.read().expect("lock is poisoned");
            state.runs.iter().any(|run| stmt.key.lsn <= run.max_lsn)
        };

        self.inner.xm.set_lsn(stmt.key.lsn);

        if already_dumped {
            return Ok(());
        }

        let mem = {
            let state = range.state.read().expect("lock is poisoned");
            state.active.clone()
        };

        let bytes = mem.insert(stmt);
        self.inner.quota.force_use(bytes);

        Ok(())
    }

    /// Validates the recovered state and brings the environment
    /// online: scheduler, worker pool and squash thread start here.
    pub fn finish(self) -> crate::Result<Environment> {
        validate_tiling(&self.inner)?;

        self.inner.log.set_deferring(false)?;

        Environment::bring_online(&self.inner);

        log::info!("environment online");

        Ok(Environment(self.inner))
    }
}

/// Replays the metadata log into live indexes, ranges and runs.
#[allow(clippy::expect_used)]
fn apply_records(inner: &Arc<EnvInner>, records: Vec<MetadataRecord>) -> crate::Result<()> {
    // range id -> (index id, range)
    let mut ranges: FxHashMap<RangeId, (IndexId, Arc<Range>)> = FxHashMap::default();

    // run id -> range id, for prepared-but-unfinished runs
    let mut prepared: FxHashMap<RunId, IndexId> = FxHashMap::default();

    // run ids whose files still need sweeping
    let mut sweep: Vec<(IndexId, RunId)> = Vec::new();

    // index id -> space id, for directory paths of dropped indexes
    let mut dropped: Vec<(IndexId, u64)> = Vec::new();
    let mut spaces: FxHashMap<IndexId, u64> = FxHashMap::default();

    for record in records {
        match record {
            MetadataRecord::CreateIndex {
                index_id,
                name,
                space_id,
                part_count,
                column_mask,
                is_primary,
            } => {
                inner.index_ids.fetch_max(index_id);
                spaces.insert(index_id, space_id);

                inner.register_index(
                    index_id,
                    &name,
                    IndexOptions {
                        space_id,
                        part_count,
                        column_mask,
                        is_primary,
                    },
                );
            }

            MetadataRecord::DropIndex { index_id } => {
                let registry = inner.indexes.read().expect("lock is poisoned");
                let index = registry.get(&index_id).cloned();
                drop(registry);

                if let Some(index) = index {
                    index.mark_dropped();
                    inner
                        .names
                        .write()
                        .expect("lock is poisoned")
                        .remove(index.name());
                    inner
                        .indexes
                        .write()
                        .expect("lock is poisoned")
                        .remove(&index_id);
                }

                ranges.retain(|_, (owner, _)| *owner != index_id);
                dropped.push((index_id, spaces.get(&index_id).copied().unwrap_or(0)));
            }

            MetadataRecord::InsertRange {
                index_id,
                range_id,
                begin,
                end,
            } => {
                inner.range_ids.fetch_max(range_id);

                let registry = inner.indexes.read().expect("lock is poisoned");
                let Some(index) = registry.get(&index_id).cloned() else {
                    continue;
                };
                drop(registry);

                let range = Arc::new(Range::new(
                    range_id,
                    begin,
                    end,
                    Arc::new(Mem::new(
                        inner.mem_ids.next(),
                        inner.generation.load(Acquire),
                    )),
                ));

                index
                    .tree
                    .write()
                    .expect("lock is poisoned")
                    .insert(range.clone());

                ranges.insert(range_id, (index_id, range));
            }

            MetadataRecord::DeleteRange { range_id, .. } => {
                if let Some((index_id, range)) = ranges.remove(&range_id) {
                    let registry = inner.indexes.read().expect("lock is poisoned");
                    if let Some(index) = registry.get(&index_id) {
                        index.tree.write().expect("lock is poisoned").remove(&range);
                    }
                }
            }

            MetadataRecord::PrepareRun {
                index_id, run_id, ..
            } => {
                inner.run_ids.fetch_max(run_id);
                prepared.insert(run_id, index_id);
            }

            MetadataRecord::InsertRun {
                index_id,
                range_id,
                run_id,
                min_lsn,
                max_lsn,
                is_empty,
                keys,
            } => {
                inner.run_ids.fetch_max(run_id);
                prepared.remove(&run_id);

                let Some((_, range)) = ranges.get(&range_id) else {
                    continue;
                };

                let registry = inner.indexes.read().expect("lock is poisoned");
                let Some(index) = registry.get(&index_id).cloned() else {
                    continue;
                };
                drop(registry);

                let run = if is_empty {
                    let mut run = Run::new_empty(run_id);
                    run.min_lsn = min_lsn;
                    run.max_lsn = max_lsn;
                    run
                } else {
                    Run::open(&index.dir, run_id, keys, min_lsn, max_lsn)?
                };

                // Replay order is oldest-first; the range keeps its
                // runs newest-first
                range
                    .state
                    .write()
                    .expect("lock is poisoned")
                    .runs
                    .insert(0, Arc::new(run));
            }

            MetadataRecord::DeleteRun { index_id, run_id } => {
                prepared.remove(&run_id);
                sweep.push((index_id, run_id));

                for (_, (_, range)) in ranges.iter() {
                    range
                        .state
                        .write()
                        .expect("lock is poisoned")
                        .runs
                        .retain(|run| run.id() != run_id);
                }
            }

            MetadataRecord::ForgetRun { run_id, .. } => {
                sweep.retain(|(_, id)| *id != run_id);
            }
        }
    }

    // A PrepareRun without a matching InsertRun or DeleteRun is a
    // crash orphan; make the deletion durable, then sweep
    for (run_id, index_id) in prepared {
        log::warn!("sweeping orphan run {run_id}");
        inner
            .log
            .append_all(&[MetadataRecord::DeleteRun { index_id, run_id }])?;
        sweep.push((index_id, run_id));
    }

    for (index_id, run_id) in sweep {
        let registry = inner.indexes.read().expect("lock is poisoned");
        if let Some(index) = registry.get(&index_id) {
            if let Err(e) = Run::remove_files(&index.dir, run_id) {
                // Retried on the next recovery; the DeleteRun record
                // is already durable
                log::warn!("failed to sweep run {run_id}: {e:?}");
                continue;
            }
            let _ = inner
                .log
                .append_all(&[MetadataRecord::ForgetRun { index_id, run_id }]);
        }
    }

    // Dropped indexes leave no files behind
    for (index_id, space_id) in dropped {
        let dir = inner
            .config
            .path
            .join(space_id.to_string())
            .join(index_id.to_string());
        if dir.exists() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    // Compaction priorities start from the recovered run layout
    let registry = inner.indexes.read().expect("lock is poisoned");
    for index in registry.values() {
        for range in index.ranges() {
            range.update_compact_priority(
                inner.config.run_count_per_level,
                inner.config.run_size_ratio,
            );
        }
    }

    Ok(())
}

/// Every index must tile the key space exactly: `-inf = b0 < b1 < ...
/// < bn = +inf`, adjacent ranges sharing their boundary.
#[allow(clippy::expect_used)]
fn validate_tiling(inner: &Arc<EnvInner>) -> crate::Result<()> {
    let registry = inner.indexes.read().expect("lock is poisoned");

    for index in registry.values() {
        let tree = index.tree.read().expect("lock is poisoned");

        if tree.is_empty() {
            return Err(crate::Error::Unrecoverable(format!(
                "index {:?} has no ranges",
                index.name(),
            )));
        }

        let mut prev_end: Option<Option<crate::UserKey>> = None;

        for range in tree.iter() {
            match &prev_end {
                None => {
                    if range.begin().is_some() {
                        return Err(crate::Error::Unrecoverable(format!(
                            "index {:?}: leftmost range must start at -inf",
                            index.name(),
                        )));
                    }
                }
                Some(end) => {
                    if end.as_ref() != range.begin() {
                        return Err(crate::Error::Unrecoverable(format!(
                            "index {:?}: gap or overlap at {:?}",
                            index.name(),
                            range.begin(),
                        )));
                    }
                }
            }

            prev_end = Some(range.end().cloned());
        }

        if prev_end != Some(None) {
            return Err(crate::Error::Unrecoverable(format!(
                "index {:?}: rightmost range must end at +inf",
                index.name(),
            )));
        }
    }

    Ok(())
}
