// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::index::Index;
use crate::memtable::Mem;
use crate::page_cache::PageCache;
use crate::range::Range;
use crate::run::format::RowType;
use crate::run::reader::RunScanner;
use crate::run::writer::{Options as WriterOptions, RunWriter, WriteOutcome};
use crate::run::{Run, RunId};
use crate::seqno::Lsn;
use crate::write_iter::{BoxedStream, WriteIterator};
use crate::UserKey;
use std::sync::Arc;
use std::time::Instant;

/// What a task does; every variant's `execute` writes runs on a worker
/// thread, while `complete`/`abort` mutate the range tree on the
/// scheduler thread.
pub(crate) enum TaskKind {
    /// Write sealed mems to a new run
    Dump {
        mems: Vec<Arc<Mem>>,
        dump_lsn: Lsn,
        run_id: RunId,
        is_last_level: bool,
    },

    /// Merge the newest runs into one
    Compact {
        runs: Vec<Arc<Run>>,
        run_id: RunId,
        is_last_level: bool,
    },

    /// Rewrite the whole range into two children split at `split_key`
    Split {
        split_key: UserKey,
        left: Arc<Range>,
        right: Arc<Range>,
        left_run_id: RunId,
        right_run_id: RunId,
        mems: Vec<Arc<Mem>>,
        runs: Vec<Arc<Run>>,
    },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dump { .. } => "dump",
            Self::Compact { .. } => "compact",
            Self::Split { .. } => "split",
        }
    }
}

/// A unit of background work, owned by exactly one thread at a time:
/// it moves scheduler -> worker -> scheduler through the two queues.
pub(crate) struct Task {
    pub index: Arc<Index>,
    pub range: Arc<Range>,
    pub kind: TaskKind,

    /// Snapshot of the oldest read view at creation
    pub oldest_vlsn: Lsn,

    pub page_size: u32,
    pub bloom_fpr: f32,

    pub started: Instant,

    /// Bytes consumed from mems, released from the quota on success
    pub input_bytes: u64,

    /// Runs produced by `execute` ([left, right] for a split)
    pub output: Vec<Run>,

    /// Failure captured on the worker, surfaced through the
    /// scheduler's diagnostic slot
    pub error: Option<crate::Error>,
}

impl Task {
    fn row_type(&self) -> RowType {
        if self.index.is_primary() {
            RowType::Primary
        } else {
            RowType::Secondary
        }
    }

    fn column_mask(&self) -> Option<u64> {
        (!self.index.is_primary()).then(|| self.index.column_mask())
    }

    fn writer_options(&self, run_id: RunId, end_key: Option<UserKey>) -> WriterOptions {
        WriterOptions {
            folder: self.index.dir.clone(),
            run_id,
            page_size: self.page_size,
            bloom_fpr: self.bloom_fpr,
            row_type: self.row_type(),
            end_key,
        }
    }

    /// Runs on a worker thread. Only reads mems/runs and writes files;
    /// never touches the range tree or the transaction manager.
    pub fn execute(&mut self, page_cache: &Arc<PageCache>) {
        let result = self.execute_inner(page_cache);

        match result {
            Ok(runs) => self.output = runs,
            Err(e) => self.error = Some(e),
        }
    }

    fn execute_inner(&self, page_cache: &Arc<PageCache>) -> crate::Result<Vec<Run>> {
        std::fs::create_dir_all(&self.index.dir)?;

        match &self.kind {
            TaskKind::Dump {
                mems,
                run_id,
                is_last_level,
                ..
            } => {
                let sources = mems
                    .iter()
                    .map(|mem| Box::new(mem.iter().map(Ok)) as BoxedStream<'_>)
                    .collect::<Vec<_>>();

                let iter = WriteIterator::new(
                    sources,
                    self.oldest_vlsn,
                    *is_last_level,
                    self.index.upsert_executor.clone(),
                    self.column_mask(),
                );

                let mut writer = RunWriter::new(self.writer_options(*run_id, None))?;

                for stmt in iter {
                    let stmt = stmt?;
                    writer.write(&stmt)?;
                }

                Ok(vec![writer.finish()?])
            }

            TaskKind::Compact {
                runs,
                run_id,
                is_last_level,
            } => {
                let sources = runs
                    .iter()
                    .map(|run| {
                        Box::new(RunScanner::new(run.clone(), page_cache.clone()))
                            as BoxedStream<'static>
                    })
                    .collect::<Vec<_>>();

                let iter = WriteIterator::new(
                    sources,
                    self.oldest_vlsn,
                    *is_last_level,
                    self.index.upsert_executor.clone(),
                    self.column_mask(),
                );

                let mut writer = RunWriter::new(self.writer_options(*run_id, None))?;

                for stmt in iter {
                    let stmt = stmt?;
                    writer.write(&stmt)?;
                }

                Ok(vec![writer.finish()?])
            }

            TaskKind::Split {
                split_key,
                left_run_id,
                right_run_id,
                mems,
                runs,
                ..
            } => {
                let mut sources = mems
                    .iter()
                    .map(|mem| Box::new(mem.iter().map(Ok)) as BoxedStream<'_>)
                    .collect::<Vec<_>>();

                sources.extend(runs.iter().map(|run| {
                    Box::new(RunScanner::new(run.clone(), page_cache.clone()))
                        as BoxedStream<'static>
                }));

                // A split rewrites everything, so it is a last-level
                // compaction of the parent
                let iter = WriteIterator::new(
                    sources,
                    self.oldest_vlsn,
                    true,
                    self.index.upsert_executor.clone(),
                    self.column_mask(),
                );

                let mut left_writer = RunWriter::new(
                    self.writer_options(*left_run_id, Some(split_key.clone())),
                )?;
                let mut right_writer =
                    RunWriter::new(self.writer_options(*right_run_id, None))?;

                for stmt in iter {
                    let stmt = stmt?;

                    // The left writer refuses keys at or past the
                    // split boundary
                    if left_writer.write(&stmt)? == WriteOutcome::BoundaryReached {
                        right_writer.write(&stmt)?;
                    }
                }

                Ok(vec![left_writer.finish()?, right_writer.finish()?])
            }
        }
    }
}
