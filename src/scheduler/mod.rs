// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The background engine: a scheduler loop plus a fixed worker pool.
//!
//! The scheduler thread owns every range-tree mutation; workers only
//! execute task `execute` callbacks (run writing). Tasks travel
//! scheduler -> worker -> scheduler through two queues guarded by one
//! mutex and a condition variable per direction.

pub(crate) mod heap;
pub(crate) mod quota;
pub(crate) mod task;

use crate::config::Config;
use crate::env::EngineStats;
use crate::index::Index;
use crate::memtable::Mem;
use crate::metadata_log::{MetadataLog, MetadataRecord};
use crate::page_cache::PageCache;
use crate::range::{Range, HEAP_POS_NONE};
use crate::run::Run;
use crate::seqno::{Lsn, SequenceNumberCounter};
use crate::tx::TxManager;
use heap::{HeapKind, RangeHeap};
use quota::{Quota, WakeSignal};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering::Acquire};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use task::{Task, TaskKind};

/// Failure backoff bounds: doubles per failure up to the cap.
const THROTTLE_BASE: Duration = Duration::from_millis(250);
const THROTTLE_CAP: Duration = Duration::from_secs(60);

/// Main loop heartbeat; watermark recomputation happens on this tick.
const TICK: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub(crate) struct SchedulerConfig {
    pub worker_pool_size: usize,
    pub page_size: u32,
    pub bloom_fpr: f32,
    pub range_size_target: u64,
    pub run_count_per_level: u32,
    pub run_size_ratio: f64,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            worker_pool_size: config.worker_pool_size.max(2),
            page_size: config.page_size,
            bloom_fpr: config.bloom_fpr,
            range_size_target: config.range_size_target,
            run_count_per_level: config.run_count_per_level,
            run_size_ratio: config.run_size_ratio,
        }
    }
}

/// Everything the scheduler needs from the environment.
pub(crate) struct SchedulerServices {
    pub log: Arc<MetadataLog>,
    pub xm: Arc<TxManager>,
    pub quota: Arc<Quota>,
    pub page_cache: Arc<PageCache>,
    pub stats: Arc<EngineStats>,
    pub mem_ids: SequenceNumberCounter,
    pub run_ids: SequenceNumberCounter,
    pub range_ids: SequenceNumberCounter,
    pub generation: Arc<AtomicU64>,
    pub config: SchedulerConfig,
}

struct SchedState {
    input: VecDeque<Task>,
    output: VecDeque<Task>,

    dump_heap: RangeHeap,
    compact_heap: RangeHeap,

    /// Ranges whose heap keys changed (commits, rotations)
    dirty: Vec<Arc<Range>>,

    checkpoint_lsn: Option<Lsn>,
    checkpoint_result: Option<Result<(), String>>,

    throttle: Duration,
    throttle_until: Option<Instant>,

    active_dumps: usize,
    active_others: usize,
    queued_tasks: usize,

    /// Bytes-per-second observations of finished dumps
    dump_bandwidth: Vec<u64>,

    last_watermark_at: Instant,
    last_allocated: u64,

    shutdown: bool,
}

pub(crate) struct SchedulerShared {
    state: Mutex<SchedState>,
    worker_cond: Condvar,
    checkpoint_cond: Condvar,
    wake: Arc<WakeSignal>,
}

pub(crate) struct Scheduler {
    shared: Arc<SchedulerShared>,
    services: Arc<SchedulerServices>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates the wake signal before the scheduler exists, so the
    /// quota can be built first.
    pub fn wake_signal() -> Arc<WakeSignal> {
        Arc::new(WakeSignal::default())
    }

    /// Starts the worker pool and the scheduler loop.
    #[allow(clippy::expect_used)]
    pub fn start(services: SchedulerServices, wake: Arc<WakeSignal>) -> Arc<Self> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedState {
                input: VecDeque::new(),
                output: VecDeque::new(),
                dump_heap: RangeHeap::new(HeapKind::Dump),
                compact_heap: RangeHeap::new(HeapKind::Compact),
                dirty: Vec::new(),
                checkpoint_lsn: None,
                checkpoint_result: None,
                throttle: THROTTLE_BASE,
                throttle_until: None,
                active_dumps: 0,
                active_others: 0,
                queued_tasks: 0,
                dump_bandwidth: Vec::new(),
                last_watermark_at: Instant::now(),
                last_allocated: 0,
                shutdown: false,
            }),
            worker_cond: Condvar::new(),
            checkpoint_cond: Condvar::new(),
            wake,
        });

        let scheduler = Arc::new(Self {
            shared: shared.clone(),
            services: Arc::new(services),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = scheduler.threads.lock().expect("lock is poisoned");

        for worker_id in 0..scheduler.services.config.worker_pool_size {
            let shared = shared.clone();
            let page_cache = scheduler.services.page_cache.clone();

            threads.push(
                std::thread::Builder::new()
                    .name(format!("lsm-worker-{worker_id}"))
                    .spawn(move || worker_main(&shared, &page_cache))
                    .expect("should spawn worker thread"),
            );
        }

        {
            let scheduler = scheduler.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("lsm-scheduler".into())
                    .spawn(move || scheduler.main_loop())
                    .expect("should spawn scheduler thread"),
            );
        }

        drop(threads);
        scheduler
    }

    /// Registers a range with both heaps.
    #[allow(clippy::expect_used)]
    pub fn add_range(&self, index: &Arc<Index>, range: &Arc<Range>) {
        let mut state = self.shared.state.lock().expect("lock is poisoned");
        state.dump_heap.push(index.clone(), range.clone());
        state.compact_heap.push(index.clone(), range.clone());
        drop(state);
        self.wake();
    }

    /// Tells the scheduler a range's heap keys may have changed.
    #[allow(clippy::expect_used)]
    pub fn notify_dirty(&self, range: &Arc<Range>) {
        let mut state = self.shared.state.lock().expect("lock is poisoned");
        state.dirty.push(range.clone());
        drop(state);
        self.wake();
    }

    pub fn wake(&self) {
        self.shared.wake.raise();
    }

    /// Requests that everything at or below `lsn` be persisted.
    #[allow(clippy::expect_used)]
    pub fn begin_checkpoint(&self, lsn: Lsn) {
        let mut state = self.shared.state.lock().expect("lock is poisoned");
        state.checkpoint_lsn = Some(lsn);
        state.checkpoint_result = None;
        drop(state);
        self.wake();
    }

    /// Blocks until the pending checkpoint finishes.
    #[allow(clippy::expect_used)]
    pub fn wait_checkpoint(&self) -> crate::Result<()> {
        let mut state = self.shared.state.lock().expect("lock is poisoned");

        loop {
            if let Some(result) = state.checkpoint_result.take() {
                // A failed checkpoint surfaces the scheduler's
                // captured diagnostic
                return result.map_err(|e| crate::Error::Io(std::io::Error::other(e)));
            }

            // Nothing pending (or the engine is going down)
            if state.checkpoint_lsn.is_none() || state.shutdown {
                return Ok(());
            }

            let (next, _) = self
                .shared
                .checkpoint_cond
                .wait_timeout(state, Duration::from_secs(1))
                .expect("lock is poisoned");
            state = next;
        }
    }

    /// Stops all threads; called on environment drop.
    #[allow(clippy::expect_used)]
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().expect("lock is poisoned");
            state.shutdown = true;
        }
        self.shared.worker_cond.notify_all();
        self.wake();

        let mut threads = self.threads.lock().expect("lock is poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    // === The main loop ===

    #[allow(clippy::expect_used)]
    fn main_loop(&self) {
        loop {
            // Completions first: they free workers and quota
            loop {
                let task = {
                    let mut state = self.shared.state.lock().expect("lock is poisoned");
                    state.output.pop_front()
                };

                match task {
                    Some(task) => self.finish_task(task),
                    None => break,
                }
            }

            let mut state = self.shared.state.lock().expect("lock is poisoned");

            if state.shutdown {
                break;
            }

            // Re-sort dirtied ranges
            let dirty = std::mem::take(&mut state.dirty);
            for range in &dirty {
                state.dump_heap.update(range);
                state.compact_heap.update(range);
            }

            self.update_watermark(&mut state);

            let throttled = state
                .throttle_until
                .is_some_and(|until| Instant::now() < until);

            if !throttled {
                self.try_schedule(&mut state);
            }

            self.check_checkpoint_done(&mut state);

            drop(state);

            self.shared.wake.wait(TICK);
        }
    }

    /// Recomputes the quota watermark roughly once a second from the
    /// write rate, the p10 dump bandwidth and the largest range.
    fn update_watermark(&self, state: &mut SchedState) {
        let elapsed = state.last_watermark_at.elapsed();
        if elapsed < Duration::from_secs(1) {
            return;
        }

        let allocated = self.services.quota.total_allocated();
        let write_rate = (allocated - state.last_allocated)
            / elapsed.as_secs().max(1);

        state.last_allocated = allocated;
        state.last_watermark_at = Instant::now();

        let dump_bw = percentile_10(&mut state.dump_bandwidth)
            .unwrap_or(/* assume 10 MiB/s until measured */ 10 * 1_024 * 1_024);

        let max_range_size = state
            .dump_heap
            .iter()
            .map(|(_, r)| r.size())
            .max()
            .unwrap_or(self.services.config.range_size_target);

        self.services
            .quota
            .update_watermark(write_rate, dump_bw, max_range_size);
    }

    fn check_checkpoint_done(&self, state: &mut SchedState) {
        let Some(checkpoint_lsn) = state.checkpoint_lsn else {
            return;
        };

        if state.checkpoint_result.is_some() {
            return;
        }

        let busy = state.active_dumps > 0
            || state.active_others > 0
            || state.queued_tasks > 0;

        if busy {
            return;
        }

        let oldest = state
            .dump_heap
            .peek()
            .map_or(u64::MAX, |(_, r)| r.mem_min_lsn());

        if oldest > checkpoint_lsn {
            log::debug!("checkpoint at lsn {checkpoint_lsn} complete");
            state.checkpoint_lsn = None;
            state.checkpoint_result = Some(Ok(()));
            self.shared.checkpoint_cond.notify_all();
        }
    }

    // === Task scheduling ===

    fn try_schedule(&self, state: &mut SchedState) {
        let pool = self.services.config.worker_pool_size;

        // Dumps first; the oldest in-memory data drives them
        while state.active_dumps + state.active_others + state.queued_tasks < pool {
            match self.new_dump_task(state) {
                Some(task) => self.submit(state, task),
                None => break,
            }
        }

        // At least one worker stays reserved for dumps, otherwise a
        // memory-quota stall could deadlock behind compactions
        while state.active_others + state.queued_tasks < pool - 1 {
            match self.new_compact_task(state) {
                Some(task) => self.submit(state, task),
                None => break,
            }
        }
    }

    fn submit(&self, state: &mut SchedState, task: Task) {
        log::debug!(
            "scheduling {} of {:?} / {:?}",
            task.kind.name(),
            task.index,
            task.range,
        );

        state.queued_tasks += 1;
        state.input.push_back(task);
        self.shared.worker_cond.notify_one();
    }

    /// Drops heap entries whose index is gone.
    fn skip_dropped(&self, state: &mut SchedState, heap_kind: HeapKind) -> Option<(Arc<Index>, Arc<Range>)> {
        loop {
            let (index, range) = match heap_kind {
                HeapKind::Dump => state.dump_heap.peek()?.clone(),
                HeapKind::Compact => state.compact_heap.peek()?.clone(),
            };

            if index.is_dropped() {
                state.dump_heap.remove(&range);
                state.compact_heap.remove(&range);
                continue;
            }

            return Some((index, range));
        }
    }

    /// Picks a dump: the range with the oldest unpersisted data, if a
    /// checkpoint or quota pressure calls for one.
    #[allow(clippy::expect_used)]
    fn new_dump_task(&self, state: &mut SchedState) -> Option<Task> {
        let (index, range) = self.skip_dropped(state, HeapKind::Dump)?;

        let mem_min = range.mem_min_lsn();
        if mem_min == u64::MAX {
            return None;
        }

        let checkpoint_wants = state
            .checkpoint_lsn
            .is_some_and(|checkpoint| mem_min <= checkpoint);

        if !checkpoint_wants && !self.services.quota.is_above_watermark() {
            return None;
        }

        let dump_lsn = state
            .checkpoint_lsn
            .unwrap_or(u64::MAX)
            .min(self.services.xm.lsn());

        if mem_min > dump_lsn {
            return None;
        }

        // Freeze what will be dumped
        let generation = self.services.generation.load(Acquire);
        range.rotate_mem(Arc::new(Mem::new(self.services.mem_ids.next(), generation)));

        let (mems, pinned) = {
            let range_state = range.state.read().expect("lock is poisoned");

            let candidates = range_state
                .sealed
                .iter()
                .filter(|mem| mem.min_lsn().is_some_and(|min| min <= dump_lsn))
                .cloned()
                .collect::<Vec<_>>();

            let pinned = candidates.iter().any(|mem| mem.is_pinned());
            (candidates, pinned)
        };

        // A pinned mem must not be dumped; retry after the pins drain
        if pinned || mems.is_empty() {
            return None;
        }

        let run_id = self.services.run_ids.next();

        if let Err(e) = self.services.log.append_all(&[MetadataRecord::PrepareRun {
            index_id: index.id(),
            range_id: range.id(),
            run_id,
        }]) {
            log::error!("metadata log append failed: {e:?}");
            self.note_failure(state, &format!("{e:?}"));
            return None;
        }

        let is_last_level = range
            .state
            .read()
            .expect("lock is poisoned")
            .runs
            .is_empty();

        let input_bytes = mems.iter().map(|m| m.used()).sum();

        state.dump_heap.remove(&range);
        state.compact_heap.remove(&range);
        state.active_dumps += 1;

        Some(Task {
            index,
            range,
            kind: TaskKind::Dump {
                mems,
                dump_lsn,
                run_id,
                is_last_level,
            },
            oldest_vlsn: self.services.xm.oldest_vlsn(),
            page_size: self.services.config.page_size,
            bloom_fpr: self.services.config.bloom_fpr,
            started: Instant::now(),
            input_bytes,
            output: Vec::new(),
            error: None,
        })
    }

    /// Picks a compaction (or a split, when the range outgrew its
    /// target) from the top of the compact heap.
    #[allow(clippy::expect_used)]
    fn new_compact_task(&self, state: &mut SchedState) -> Option<Task> {
        let (index, range) = self.skip_dropped(state, HeapKind::Compact)?;

        let priority = range.compact_priority.load(Acquire);
        if priority <= 1 {
            return None;
        }

        if let Some(split_key) = range.needs_split(self.services.config.range_size_target) {
            return self.new_split_task(state, index, range, split_key);
        }

        let (runs, total) = {
            let range_state = range.state.read().expect("lock is poisoned");
            let runs = range_state
                .runs
                .iter()
                .take(priority as usize)
                .cloned()
                .collect::<Vec<_>>();
            (runs, range_state.runs.len())
        };

        if runs.len() < 2 {
            return None;
        }

        let is_last_level = runs.len() == total;

        let run_id = self.services.run_ids.next();

        if let Err(e) = self.services.log.append_all(&[MetadataRecord::PrepareRun {
            index_id: index.id(),
            range_id: range.id(),
            run_id,
        }]) {
            log::error!("metadata log append failed: {e:?}");
            self.note_failure(state, &format!("{e:?}"));
            return None;
        }

        state.dump_heap.remove(&range);
        state.compact_heap.remove(&range);
        state.active_others += 1;

        Some(Task {
            index,
            range,
            kind: TaskKind::Compact {
                runs,
                run_id,
                is_last_level,
            },
            oldest_vlsn: self.services.xm.oldest_vlsn(),
            page_size: self.services.config.page_size,
            bloom_fpr: self.services.config.bloom_fpr,
            started: Instant::now(),
            input_bytes: 0,
            output: Vec::new(),
            error: None,
        })
    }

    /// Replaces the range with two shadowing children and schedules the
    /// rewrite; concurrent inserts land in the children while reads
    /// traverse the parent through the back-pointer.
    #[allow(clippy::expect_used)]
    fn new_split_task(
        &self,
        state: &mut SchedState,
        index: Arc<Index>,
        parent: Arc<Range>,
        split_key: crate::UserKey,
    ) -> Option<Task> {
        let generation = self.services.generation.load(Acquire);

        // Seal the active mem; everything the parent holds is rewritten
        parent.rotate_mem(Arc::new(Mem::new(self.services.mem_ids.next(), generation)));

        let (mems, runs, pinned) = {
            let range_state = parent.state.read().expect("lock is poisoned");
            let mems = range_state.sealed.iter().cloned().collect::<Vec<_>>();
            let pinned = mems.iter().any(|mem| mem.is_pinned());
            (mems, range_state.runs.clone(), pinned)
        };

        if pinned {
            return None;
        }

        let left_run_id = self.services.run_ids.next();
        let right_run_id = self.services.run_ids.next();

        let left = Arc::new(Range::new(
            self.services.range_ids.next(),
            parent.begin().cloned(),
            Some(split_key.clone()),
            Arc::new(Mem::new(self.services.mem_ids.next(), generation)),
        ));
        let right = Arc::new(Range::new(
            self.services.range_ids.next(),
            Some(split_key.clone()),
            parent.end().cloned(),
            Arc::new(Mem::new(self.services.mem_ids.next(), generation)),
        ));

        if let Err(e) = self.services.log.append_all(&[
            MetadataRecord::PrepareRun {
                index_id: index.id(),
                range_id: left.id(),
                run_id: left_run_id,
            },
            MetadataRecord::PrepareRun {
                index_id: index.id(),
                range_id: right.id(),
                run_id: right_run_id,
            },
        ]) {
            log::error!("metadata log append failed: {e:?}");
            self.note_failure(state, &format!("{e:?}"));
            return None;
        }

        state.dump_heap.remove(&parent);
        state.compact_heap.remove(&parent);

        // Shadow the parent, then swap the children into the tree
        for child in [&left, &right] {
            child
                .state
                .write()
                .expect("lock is poisoned")
                .split_parent = Some(parent.clone());
        }
        parent.state.write().expect("lock is poisoned").is_shadow = true;

        {
            let mut tree = index.tree.write().expect("lock is poisoned");
            tree.remove(&parent);
            tree.insert(left.clone());
            tree.insert(right.clone());
        }

        log::info!(
            "splitting {:?} at {:?} into {:?} + {:?}",
            parent,
            split_key,
            left,
            right,
        );

        state.active_others += 1;

        Some(Task {
            index,
            range: parent,
            kind: TaskKind::Split {
                split_key,
                left,
                right,
                left_run_id,
                right_run_id,
                mems,
                runs,
            },
            oldest_vlsn: self.services.xm.oldest_vlsn(),
            page_size: self.services.config.page_size,
            bloom_fpr: self.services.config.bloom_fpr,
            started: Instant::now(),
            input_bytes: 0,
            output: Vec::new(),
            error: None,
        })
    }

    // === Task completion ===

    #[allow(clippy::expect_used)]
    fn finish_task(&self, mut task: Task) {
        let failed = task.error.take();

        let result = match failed {
            Some(e) => Err(e),
            None => self.complete_task(&mut task),
        };

        let mut state = self.shared.state.lock().expect("lock is poisoned");

        match &task.kind {
            TaskKind::Dump { .. } => state.active_dumps -= 1,
            _ => state.active_others -= 1,
        }

        match result {
            Ok(()) => {
                state.throttle = THROTTLE_BASE;
                state.throttle_until = None;
                self.services.quota.set_last_error(None);
            }
            Err(e) => {
                let message = format!("{} failed: {e:?}", task.kind.name());
                log::error!("{message}");

                self.abort_task(&mut state, &task);
                self.note_failure(&mut state, &message);
            }
        }

        drop(state);
        self.wake();
    }

    /// Doubles the failure backoff, up to the cap; a pending
    /// checkpoint fails immediately.
    fn note_failure(&self, state: &mut SchedState, message: &str) {
        state.throttle_until = Some(Instant::now() + state.throttle);
        state.throttle = (state.throttle * 2).min(THROTTLE_CAP);

        self.services.quota.set_last_error(Some(message.into()));

        if state.checkpoint_lsn.take().is_some() {
            state.checkpoint_result = Some(Err(message.into()));
            self.shared.checkpoint_cond.notify_all();
        }
    }

    /// Applies a finished task to the range tree; runs on the
    /// scheduler thread only.
    #[allow(clippy::expect_used)]
    fn complete_task(&self, task: &mut Task) -> crate::Result<()> {
        let mut output = std::mem::take(&mut task.output);

        match &task.kind {
            TaskKind::Dump {
                dump_lsn, run_id, ..
            } => {
                let run = output.pop().expect("dump produced a run");

                self.services.log.append_all(&[MetadataRecord::InsertRun {
                    index_id: task.index.id(),
                    range_id: task.range.id(),
                    run_id: *run_id,
                    min_lsn: run.min_lsn,
                    max_lsn: run.max_lsn,
                    is_empty: run.is_empty(),
                    keys: run.stmt_count,
                }])?;

                if !run.is_empty() {
                    let mut range_state =
                        task.range.state.write().expect("lock is poisoned");
                    range_state.runs.insert(0, Arc::new(run));
                }

                let freed = task.range.gc_mems(*dump_lsn);
                self.services.quota.release(freed);
                task.range.bump_version();

                task.range.update_compact_priority(
                    self.services.config.run_count_per_level,
                    self.services.config.run_size_ratio,
                );

                let elapsed = task.started.elapsed().as_secs_f64().max(0.001);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let bandwidth = (task.input_bytes as f64 / elapsed) as u64;

                let mut state = self.shared.state.lock().expect("lock is poisoned");
                state.dump_bandwidth.push(bandwidth);
                state.dump_heap.push(task.index.clone(), task.range.clone());
                state.compact_heap.push(task.index.clone(), task.range.clone());
                drop(state);

                self.services.stats.dump_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);

                log::debug!("dumped {:?} up to lsn {dump_lsn}", task.range);

                self.maybe_coalesce(&task.index, &task.range);

                Ok(())
            }

            TaskKind::Compact { runs, run_id, .. } => {
                let run = output.pop().expect("compaction produced a run");

                let mut records = vec![MetadataRecord::InsertRun {
                    index_id: task.index.id(),
                    range_id: task.range.id(),
                    run_id: *run_id,
                    min_lsn: run.min_lsn,
                    max_lsn: run.max_lsn,
                    is_empty: run.is_empty(),
                    keys: run.stmt_count,
                }];
                for old in runs {
                    records.push(MetadataRecord::DeleteRun {
                        index_id: task.index.id(),
                        run_id: old.id(),
                    });
                }
                self.services.log.append_all(&records)?;

                {
                    let mut range_state =
                        task.range.state.write().expect("lock is poisoned");
                    range_state.runs.drain(..runs.len());
                    if !run.is_empty() {
                        range_state.runs.insert(0, Arc::new(run));
                    }
                }
                task.range.bump_version();

                self.unlink_runs(&task.index, runs);

                task.range
                    .n_compactions
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                task.range.update_compact_priority(
                    self.services.config.run_count_per_level,
                    self.services.config.run_size_ratio,
                );

                let mut state = self.shared.state.lock().expect("lock is poisoned");
                state.dump_heap.push(task.index.clone(), task.range.clone());
                state.compact_heap.push(task.index.clone(), task.range.clone());
                drop(state);

                self.services
                    .stats
                    .compaction_count
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);

                log::debug!("compacted {} runs of {:?}", runs.len(), task.range);

                self.maybe_coalesce(&task.index, &task.range);

                Ok(())
            }

            TaskKind::Split {
                left,
                right,
                left_run_id,
                right_run_id,
                runs,
                ..
            } => {
                let right_run = output.pop().expect("split produced two runs");
                let left_run = output.pop().expect("split produced two runs");

                let mut records = vec![
                    MetadataRecord::DeleteRange {
                        index_id: task.index.id(),
                        range_id: task.range.id(),
                    },
                    MetadataRecord::InsertRange {
                        index_id: task.index.id(),
                        range_id: left.id(),
                        begin: left.begin().cloned(),
                        end: left.end().cloned(),
                    },
                    MetadataRecord::InsertRange {
                        index_id: task.index.id(),
                        range_id: right.id(),
                        begin: right.begin().cloned(),
                        end: right.end().cloned(),
                    },
                    MetadataRecord::InsertRun {
                        index_id: task.index.id(),
                        range_id: left.id(),
                        run_id: *left_run_id,
                        min_lsn: left_run.min_lsn,
                        max_lsn: left_run.max_lsn,
                        is_empty: left_run.is_empty(),
                        keys: left_run.stmt_count,
                    },
                    MetadataRecord::InsertRun {
                        index_id: task.index.id(),
                        range_id: right.id(),
                        run_id: *right_run_id,
                        min_lsn: right_run.min_lsn,
                        max_lsn: right_run.max_lsn,
                        is_empty: right_run.is_empty(),
                        keys: right_run.stmt_count,
                    },
                ];
                for old in runs {
                    records.push(MetadataRecord::DeleteRun {
                        index_id: task.index.id(),
                        run_id: old.id(),
                    });
                }
                self.services.log.append_all(&records)?;

                for (child, run) in [(left, left_run), (right, right_run)] {
                    let mut child_state = child.state.write().expect("lock is poisoned");
                    if !run.is_empty() {
                        child_state.runs.push(Arc::new(run));
                    }
                    child_state.split_parent = None;
                    drop(child_state);

                    child.bump_version();
                    child.update_compact_priority(
                        self.services.config.run_count_per_level,
                        self.services.config.run_size_ratio,
                    );
                }

                // The parent's data now lives in the children
                let freed = task.range.mem_used();
                self.services.quota.release(freed);
                self.unlink_runs(&task.index, runs);

                let mut state = self.shared.state.lock().expect("lock is poisoned");
                for child in [left, right] {
                    state.dump_heap.push(task.index.clone(), child.clone());
                    state.compact_heap.push(task.index.clone(), child.clone());
                }
                drop(state);

                self.services
                    .stats
                    .split_count
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);

                log::info!("split {:?} complete", task.range);

                Ok(())
            }
        }
    }

    /// Undoes a failed task: discards prepared runs, restores the
    /// range tree, re-queues the range.
    #[allow(clippy::expect_used)]
    fn abort_task(&self, state: &mut SchedState, task: &Task) {
        match &task.kind {
            TaskKind::Dump { run_id, .. } | TaskKind::Compact { run_id, .. } => {
                let _ = self.services.log.append_all(&[MetadataRecord::DeleteRun {
                    index_id: task.index.id(),
                    run_id: *run_id,
                }]);

                let _ = Run::remove_files(&task.index.dir, *run_id);

                // Re-enqueue for another attempt
                state.dump_heap.push(task.index.clone(), task.range.clone());
                state
                    .compact_heap
                    .push(task.index.clone(), task.range.clone());
            }

            TaskKind::Split {
                left,
                right,
                left_run_id,
                right_run_id,
                ..
            } => {
                let _ = self.services.log.append_all(&[
                    MetadataRecord::DeleteRun {
                        index_id: task.index.id(),
                        run_id: *left_run_id,
                    },
                    MetadataRecord::DeleteRun {
                        index_id: task.index.id(),
                        run_id: *right_run_id,
                    },
                ]);

                for run_id in [*left_run_id, *right_run_id] {
                    let _ = Run::remove_files(&task.index.dir, run_id);
                }

                // Swap the parent back in; writes that landed in the
                // children are spliced into its sealed list in child
                // order, preserving FIFO by mem id
                {
                    let mut tree = task.index.tree.write().expect("lock is poisoned");
                    tree.remove(left);
                    tree.remove(right);

                    let mut parent_state =
                        task.range.state.write().expect("lock is poisoned");
                    parent_state.is_shadow = false;

                    for child in [right, left] {
                        let child_state =
                            child.state.read().expect("lock is poisoned");
                        if !child_state.active.is_empty()
                            || child_state.active.is_pinned()
                        {
                            parent_state.sealed.push_front(child_state.active.clone());
                        }
                    }

                    drop(parent_state);
                    tree.insert(task.range.clone());
                }

                task.range.bump_version();

                state.dump_heap.push(task.index.clone(), task.range.clone());
                state
                    .compact_heap
                    .push(task.index.clone(), task.range.clone());
            }
        }
    }

    fn unlink_runs(&self, index: &Arc<Index>, runs: &[Arc<Run>]) {
        for run in runs {
            // An I/O error here is not fatal: the DeleteRun record is
            // durable, so the sweep retries on the next recovery
            if let Err(e) = Run::remove_files(&index.dir, run.id()) {
                log::warn!("failed to unlink run {}: {e:?}", run.id());
                continue;
            }

            let _ = self.services.log.append_all(&[MetadataRecord::ForgetRun {
                index_id: index.id(),
                run_id: run.id(),
            }]);
        }
    }

    /// Merges the range with contiguous idle neighbours while the
    /// total stays below half the target range size.
    #[allow(clippy::expect_used)]
    fn maybe_coalesce(&self, index: &Arc<Index>, range: &Arc<Range>) {
        let max_size = self.services.config.range_size_target / 2;

        if range.size() >= max_size {
            return;
        }

        let is_idle = |r: &Range| {
            r.in_dump.load(Acquire) != HEAP_POS_NONE
                && r.in_compact.load(Acquire) != HEAP_POS_NONE
        };

        // Gather participants left and right of the seed
        let participants = {
            let tree = index.tree.read().expect("lock is poisoned");

            if !is_idle(range) {
                return;
            }

            let mut parts = VecDeque::from([range.clone()]);
            let mut total = range.size();

            while let Some(prev) = tree.walk(
                parts.front().expect("not empty"),
                crate::range::tree::SearchMode::Le,
                b"",
            ) {
                if !is_idle(&prev) || total + prev.size() >= max_size {
                    break;
                }
                total += prev.size();
                parts.push_front(prev);
            }

            while let Some(next) = tree.walk(
                parts.back().expect("not empty"),
                crate::range::tree::SearchMode::Ge,
                b"",
            ) {
                if !is_idle(&next) || total + next.size() >= max_size {
                    break;
                }
                total += next.size();
                parts.push_back(next);
            }

            parts
        };

        if participants.len() < 2 {
            return;
        }

        let generation = self.services.generation.load(Acquire);

        let first = participants.front().expect("not empty");
        let last = participants.back().expect("not empty");

        let merged = Arc::new(Range::new(
            self.services.range_ids.next(),
            first.begin().cloned(),
            last.end().cloned(),
            Arc::new(Mem::new(self.services.mem_ids.next(), generation)),
        ));

        let mut records = vec![MetadataRecord::InsertRange {
            index_id: index.id(),
            range_id: merged.id(),
            begin: merged.begin().cloned(),
            end: merged.end().cloned(),
        }];
        for part in &participants {
            records.push(MetadataRecord::DeleteRange {
                index_id: index.id(),
                range_id: part.id(),
            });
        }

        if let Err(e) = self.services.log.append_all(&records) {
            log::error!("metadata log append failed: {e:?}");
            return;
        }

        // The merged range takes the union of its sources' mems and
        // runs; still-active mems are sealed into it, so racing
        // prepares into them are preserved
        {
            let mut merged_state = merged.state.write().expect("lock is poisoned");

            for part in &participants {
                let part_state = part.state.read().expect("lock is poisoned");

                if !part_state.active.is_empty() || part_state.active.is_pinned() {
                    merged_state.sealed.push_back(part_state.active.clone());
                }
                merged_state
                    .sealed
                    .extend(part_state.sealed.iter().cloned());
                merged_state.runs.extend(part_state.runs.iter().cloned());
            }

            // Newest first, across all sources
            merged_state
                .sealed
                .make_contiguous()
                .sort_by_key(|mem| std::cmp::Reverse(mem.id()));
            merged_state.runs.sort_by_key(|run| std::cmp::Reverse(run.id()));
        }

        {
            let mut tree = index.tree.write().expect("lock is poisoned");
            let mut state = self.shared.state.lock().expect("lock is poisoned");

            for part in &participants {
                state.dump_heap.remove(part);
                state.compact_heap.remove(part);
                tree.remove(part);
            }

            tree.insert(merged.clone());
            state.dump_heap.push(index.clone(), merged.clone());
            state.compact_heap.push(index.clone(), merged.clone());
        }

        merged.update_compact_priority(
            self.services.config.run_count_per_level,
            self.services.config.run_size_ratio,
        );

        self.services
            .stats
            .coalesce_count
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);

        log::info!(
            "coalesced {} ranges into {:?}",
            participants.len(),
            merged,
        );
    }
}

/// Worker thread: executes tasks, never touches the range tree.
#[allow(clippy::expect_used)]
fn worker_main(shared: &SchedulerShared, page_cache: &Arc<PageCache>) {
    loop {
        let mut task = {
            let mut state = shared.state.lock().expect("lock is poisoned");

            loop {
                if state.shutdown {
                    return;
                }
                if let Some(task) = state.input.pop_front() {
                    state.queued_tasks -= 1;
                    break task;
                }

                state = shared
                    .worker_cond
                    .wait(state)
                    .expect("lock is poisoned");
            }
        };

        task.execute(page_cache);

        let mut state = shared.state.lock().expect("lock is poisoned");
        state.output.push_back(task);
        drop(state);

        shared.wake.raise();
    }
}

fn percentile_10(observations: &mut Vec<u64>) -> Option<u64> {
    if observations.is_empty() {
        return None;
    }

    // Keep the window bounded
    if observations.len() > 128 {
        let excess = observations.len() - 128;
        observations.drain(..excess);
    }

    let mut sorted = observations.clone();
    sorted.sort_unstable();

    sorted.get(sorted.len() / 10).copied()
}
