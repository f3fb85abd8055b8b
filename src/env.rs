// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::cache::ReadCache;
use crate::config::Config;
use crate::index::{Index, IndexId, IndexOptions};
use crate::memtable::Mem;
use crate::metadata_log::{MetadataLog, MetadataRecord};
use crate::page_cache::PageCache;
use crate::range::tree::SearchMode;
use crate::range::Range;
use crate::read_iter::ReadIterator;
use crate::scheduler::quota::{Quota, WakeSignal};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerServices};
use crate::seqno::{Lsn, SequenceNumberCounter, VLSN_INF};
use crate::squash::SquashQueue;
use crate::statement::Statement;
use crate::tx::{IndexRegistry, TxId, TxManager};
use crate::{UserKey, UserValue};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering::AcqRel, Ordering::Acquire};
use std::sync::{Arc, Mutex, RwLock};

/// Environment lifecycle; the scheduler only runs while `Online`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    Offline,
    InitialRecovery,
    FinalRecovery,
    Online,
}

/// Counters the engine keeps about background work.
#[derive(Default)]
pub struct EngineStats {
    pub dump_count: AtomicU64,
    pub compaction_count: AtomicU64,
    pub split_count: AtomicU64,
    pub coalesce_count: AtomicU64,
    pub upsert_squashed: AtomicU64,
}

pub(crate) struct EnvInner {
    pub config: Config,

    pub indexes: IndexRegistry,
    pub names: RwLock<FxHashMap<String, IndexId>>,

    pub xm: Arc<TxManager>,
    pub quota: Arc<Quota>,
    pub log: Arc<MetadataLog>,
    pub cache: Arc<ReadCache>,
    pub page_cache: Arc<PageCache>,
    pub stats: Arc<EngineStats>,

    pub scheduler: Mutex<Option<Arc<Scheduler>>>,
    pub squash: Mutex<Option<SquashQueue>>,

    pub status: Mutex<Status>,

    /// Opaque snapshot/schema generation; a bump forces mem rotation
    /// on the next insert
    pub generation: Arc<AtomicU64>,

    pub index_ids: SequenceNumberCounter,
    pub range_ids: SequenceNumberCounter,
    pub run_ids: SequenceNumberCounter,
    pub mem_ids: SequenceNumberCounter,

    pub wake: Arc<WakeSignal>,
}

impl EnvInner {
    pub fn create(config: Config, log: MetadataLog) -> Arc<Self> {
        let wake = Scheduler::wake_signal();

        // The tx manager resolves index ids against the same registry
        let registry: IndexRegistry = Arc::new(RwLock::new(FxHashMap::default()));

        Arc::new(Self {
            quota: Arc::new(Quota::new(config.memory_limit, wake.clone())),
            cache: Arc::new(ReadCache::with_capacity_bytes(config.cache_size)),
            page_cache: Arc::new(PageCache::with_capacity_bytes(config.cache_size)),
            indexes: registry.clone(),
            names: RwLock::new(FxHashMap::default()),
            xm: Arc::new(TxManager::new(registry)),
            log: Arc::new(log),
            stats: Arc::new(EngineStats::default()),
            scheduler: Mutex::new(None),
            squash: Mutex::new(None),
            status: Mutex::new(Status::Offline),
            generation: Arc::new(AtomicU64::new(0)),
            index_ids: SequenceNumberCounter::default(),
            range_ids: SequenceNumberCounter::default(),
            run_ids: SequenceNumberCounter::default(),
            mem_ids: SequenceNumberCounter::default(),
            config,
            wake,
        })
    }

    #[allow(clippy::expect_used)]
    pub fn status(&self) -> Status {
        *self.status.lock().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    pub fn set_status(&self, status: Status) {
        *self.status.lock().expect("lock is poisoned") = status;
    }

    #[allow(clippy::expect_used)]
    pub fn index_by_name(&self, name: &str) -> Option<Arc<Index>> {
        let id = *self.names.read().expect("lock is poisoned").get(name)?;
        self.indexes.read().expect("lock is poisoned").get(&id).cloned()
    }

    /// Builds an index object and registers it; shared by index
    /// creation and recovery.
    #[allow(clippy::expect_used)]
    pub fn register_index(
        &self,
        id: IndexId,
        name: &str,
        options: IndexOptions,
    ) -> Arc<Index> {
        let index = Arc::new(Index::new(
            id,
            name.to_string(),
            options,
            &self.config.path,
            self.cache.clone(),
            self.page_cache.clone(),
            self.config.upsert_executor.clone(),
        ));

        self.indexes
            .write()
            .expect("lock is poisoned")
            .insert(id, index.clone());
        self.names
            .write()
            .expect("lock is poisoned")
            .insert(name.to_string(), id);

        index
    }

    #[allow(clippy::expect_used)]
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.lock().expect("lock is poisoned").clone()
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        #[allow(clippy::expect_used)]
        if let Some(scheduler) = self.scheduler.lock().expect("lock is poisoned").take() {
            scheduler.shutdown();
        }

        #[allow(clippy::expect_used)]
        if let Some(squash) = self.squash.lock().expect("lock is poisoned").take() {
            squash.shutdown();
        }
    }
}

/// The storage engine environment: the handle every public entry
/// point goes through.
///
/// # Examples
///
/// ```no_run
/// use lsm_engine::{Config, IndexOptions};
///
/// let env = Config::new("/tmp/engine-data").open()?;
/// let index = env.create_index("primary", IndexOptions::default())?;
///
/// let mut tx = env.begin();
/// tx.replace(&index, "key", "value")?;
/// env.prepare(&mut tx)?;
/// env.commit(tx, /* WAL-assigned LSN */ 1)?;
///
/// assert_eq!(
///     Some("value".as_bytes().into()),
///     env.get(&index, b"key")?,
/// );
/// # Ok::<(), lsm_engine::Error>(())
/// ```
#[derive(Clone)]
pub struct Environment(pub(crate) Arc<EnvInner>);

impl Environment {
    /// Starts the background machinery; called by recovery when the
    /// environment goes online.
    pub(crate) fn bring_online(inner: &Arc<EnvInner>) {
        let services = SchedulerServices {
            log: inner.log.clone(),
            xm: inner.xm.clone(),
            quota: inner.quota.clone(),
            page_cache: inner.page_cache.clone(),
            stats: inner.stats.clone(),
            mem_ids: inner.mem_ids.clone(),
            run_ids: inner.run_ids.clone(),
            range_ids: inner.range_ids.clone(),
            generation: inner.generation.clone(),
            config: SchedulerConfig::from(&inner.config),
        };

        let scheduler = Scheduler::start(services, inner.wake.clone());

        // Hand the scheduler every recovered range
        #[allow(clippy::expect_used)]
        let indexes = inner
            .indexes
            .read()
            .expect("lock is poisoned")
            .values()
            .cloned()
            .collect::<Vec<_>>();

        for index in indexes {
            for range in index.ranges() {
                scheduler.add_range(&index, &range);
            }
        }

        #[allow(clippy::expect_used)]
        {
            *inner.scheduler.lock().expect("lock is poisoned") = Some(scheduler);

            *inner.squash.lock().expect("lock is poisoned") = Some(SquashQueue::spawn(
                inner.xm.clone(),
                inner.quota.clone(),
                inner.stats.clone(),
            ));
        }

        inner.set_status(Status::Online);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> Status {
        self.0.status()
    }

    /// Engine statistics.
    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.0.stats
    }

    /// Transaction statistics.
    #[must_use]
    pub fn tx_stats(&self) -> &crate::tx::TxStats {
        &self.0.xm.stats
    }

    /// Last committed LSN.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.0.xm.lsn()
    }

    /// Bumps the snapshot/schema generation; active mems rotate on the
    /// next insert.
    pub fn bump_generation(&self) {
        self.0.generation.fetch_add(1, AcqRel);
    }

    /// Creates a named index with one range spanning the key space.
    pub fn create_index(
        &self,
        name: &str,
        options: IndexOptions,
    ) -> crate::Result<Arc<Index>> {
        if self.0.index_by_name(name).is_some() {
            return Err(crate::Error::Io(std::io::Error::other(format!(
                "index {name:?} already exists"
            ))));
        }

        let id = self.0.index_ids.next();
        let range_id = self.0.range_ids.next();

        self.0.log.append_all(&[
            MetadataRecord::CreateIndex {
                index_id: id,
                name: name.to_string(),
                space_id: options.space_id,
                part_count: options.part_count,
                column_mask: options.column_mask,
                is_primary: options.is_primary,
            },
            MetadataRecord::InsertRange {
                index_id: id,
                range_id,
                begin: None,
                end: None,
            },
        ])?;

        let index = self.0.register_index(id, name, options);

        std::fs::create_dir_all(&index.dir)?;

        let range = Arc::new(Range::new(
            range_id,
            None,
            None,
            Arc::new(Mem::new(
                self.0.mem_ids.next(),
                self.0.generation.load(Acquire),
            )),
        ));

        #[allow(clippy::expect_used)]
        {
            index
                .tree
                .write()
                .expect("lock is poisoned")
                .insert(range.clone());
        }

        if let Some(scheduler) = self.0.scheduler() {
            scheduler.add_range(&index, &range);
        }

        log::debug!("created index {name:?} (#{id})");

        Ok(index)
    }

    /// Looks an index up by name.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<Arc<Index>> {
        self.0.index_by_name(name)
    }

    /// Drops an index: its ranges and runs are unreferenced, the drop
    /// record is deferred through the metadata-log buffer during
    /// recovery.
    #[allow(clippy::expect_used)]
    pub fn drop_index(&self, name: &str) -> crate::Result<()> {
        let Some(index) = self.0.index_by_name(name) else {
            return Ok(());
        };

        index.mark_dropped();

        self.0.log.append(MetadataRecord::DropIndex {
            index_id: index.id(),
        })?;
        self.0.log.sync()?;

        self.0
            .names
            .write()
            .expect("lock is poisoned")
            .remove(name);
        self.0
            .indexes
            .write()
            .expect("lock is poisoned")
            .remove(&index.id());

        log::debug!("dropped index {name:?}");

        Ok(())
    }

    /// Begins a transaction.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction {
            env: self.0.clone(),
            id: self.0.xm.begin(),
            finished: false,
        }
    }

    /// Prepares a transaction: conflict check, then writing the write
    /// set into the mems under a tentative LSN. A conflict leaves the
    /// transaction usable for rollback only.
    pub fn prepare(&self, tx: &mut Transaction) -> crate::Result<()> {
        // Barrier before pinning mems; waiting later could deadlock
        // the dump that frees the quota
        self.0.quota.try_use(0)?;

        let written = self.0.xm.prepare(
            tx.id,
            self.0.generation.load(Acquire),
            &self.0.mem_ids,
        )?;

        self.0.quota.force_use(written);

        Ok(())
    }

    /// Commits a prepared transaction under its WAL-assigned LSN.
    pub fn commit(&self, mut tx: Transaction, lsn: Lsn) -> crate::Result<()> {
        let outcome = self.0.xm.commit(tx.id, lsn)?;
        tx.finished = true;

        if let Some(scheduler) = self.0.scheduler() {
            for range in &outcome.dirty_ranges {
                scheduler.notify_dirty(range);
            }
        }

        if !outcome.squash.is_empty() {
            #[allow(clippy::expect_used)]
            let squash = self.0.squash.lock().expect("lock is poisoned");
            if let Some(squash) = &*squash {
                let registry = self.0.indexes.read().expect("lock is poisoned");
                for (index_id, key) in outcome.squash {
                    if let Some(index) = registry.get(&index_id) {
                        squash.push(index.clone(), key);
                    }
                }
            }
        }

        Ok(())
    }

    /// Rolls a transaction back; after prepare this aborts its
    /// dependent read views.
    pub fn rollback(&self, mut tx: Transaction) {
        self.0.xm.rollback(tx.id);
        tx.finished = true;
    }

    /// Reads a key outside any transaction, under the global view.
    pub fn get(&self, index: &Arc<Index>, key: &[u8]) -> crate::Result<Option<UserValue>> {
        let mut iter = ReadIterator::new(
            index.clone(),
            self.0.xm.clone(),
            None,
            SearchMode::Eq,
            key.into(),
            VLSN_INF,
            true,
        );

        Ok(iter.next()?.map(|stmt| stmt.value))
    }

    /// Opens a cursor outside any transaction, under the global view.
    #[must_use]
    pub fn iter(&self, index: &Arc<Index>, mode: SearchMode, key: &[u8]) -> Cursor {
        Cursor {
            env: self.0.clone(),
            tx_id: None,
            iter: ReadIterator::new(
                index.clone(),
                self.0.xm.clone(),
                None,
                mode,
                key.into(),
                VLSN_INF,
                false,
            ),
        }
    }

    /// Tells the engine everything at or below `lsn` must be
    /// persisted, and waits for it.
    pub fn checkpoint(&self, lsn: Lsn) -> crate::Result<()> {
        self.begin_checkpoint(lsn);
        self.wait_checkpoint()
    }

    /// Starts a checkpoint without waiting.
    pub fn begin_checkpoint(&self, lsn: Lsn) {
        if let Some(scheduler) = self.0.scheduler() {
            scheduler.begin_checkpoint(lsn);
        }
    }

    /// Waits for the pending checkpoint.
    pub fn wait_checkpoint(&self) -> crate::Result<()> {
        match self.0.scheduler() {
            Some(scheduler) => scheduler.wait_checkpoint(),
            None => Ok(()),
        }
    }

    /// Memory quota handle.
    #[must_use]
    pub fn quota(&self) -> &Quota {
        &self.0.quota
    }
}

/// A transaction handle; dropping an unfinished transaction rolls it
/// back.
pub struct Transaction {
    env: Arc<EnvInner>,
    id: TxId,
    finished: bool,
}

impl Transaction {
    #[must_use]
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Buffers a REPLACE.
    pub fn replace<K: Into<UserKey>, V: Into<UserValue>>(
        &mut self,
        index: &Arc<Index>,
        key: K,
        value: V,
    ) -> crate::Result<()> {
        self.env
            .xm
            .write(self.id, index, Statement::replace(key, value, 0))
    }

    /// Buffers a REPLACE restricted to a column mask.
    pub fn replace_masked<K: Into<UserKey>, V: Into<UserValue>>(
        &mut self,
        index: &Arc<Index>,
        key: K,
        value: V,
        column_mask: u64,
    ) -> crate::Result<()> {
        self.env.xm.write(
            self.id,
            index,
            Statement::replace(key, value, 0).with_column_mask(column_mask),
        )
    }

    /// Buffers a DELETE.
    pub fn delete<K: Into<UserKey>>(
        &mut self,
        index: &Arc<Index>,
        key: K,
    ) -> crate::Result<()> {
        self.env
            .xm
            .write(self.id, index, Statement::delete(key, 0))
    }

    /// Buffers an UPSERT; only primary indexes accept them.
    pub fn upsert<K: Into<UserKey>, V: Into<UserValue>>(
        &mut self,
        index: &Arc<Index>,
        key: K,
        ops: V,
    ) -> crate::Result<()> {
        debug_assert!(index.is_primary(), "UPSERT goes to the primary index");

        self.env
            .xm
            .write(self.id, index, Statement::upsert(key, ops, 0))
    }

    /// Reads a key through the transaction: own writes first, then the
    /// snapshot the transaction is entitled to.
    pub fn get(&self, index: &Arc<Index>, key: &[u8]) -> crate::Result<Option<UserValue>> {
        let vlsn = self.env.xm.read_vlsn(self.id)?;

        let mut iter = ReadIterator::new(
            index.clone(),
            self.env.xm.clone(),
            Some(self.id),
            SearchMode::Eq,
            key.into(),
            vlsn,
            true,
        );

        Ok(iter.next()?.map(|stmt| stmt.value))
    }

    /// Opens a cursor owned by this transaction. Destroying the
    /// transaction detaches its cursors; they read nothing thereafter.
    pub fn iter(
        &self,
        index: &Arc<Index>,
        mode: SearchMode,
        key: &[u8],
    ) -> crate::Result<Cursor> {
        let vlsn = self.env.xm.read_vlsn(self.id)?;

        Ok(Cursor {
            env: self.env.clone(),
            tx_id: Some(self.id),
            iter: ReadIterator::new(
                index.clone(),
                self.env.xm.clone(),
                Some(self.id),
                mode,
                key.into(),
                vlsn,
                false,
            ),
        })
    }

    /// Marks a savepoint in the operation log.
    #[must_use]
    pub fn savepoint(&self) -> usize {
        self.env.xm.savepoint(self.id)
    }

    /// Undoes every write made after the savepoint.
    pub fn rollback_to_savepoint(&mut self, savepoint: usize) -> crate::Result<()> {
        self.env.xm.rollback_to_savepoint(self.id, savepoint)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.env.xm.rollback(self.id);
        }
    }
}

/// A user-visible cursor over an index.
pub struct Cursor {
    env: Arc<EnvInner>,
    tx_id: Option<TxId>,
    iter: ReadIterator,
}

impl Cursor {
    /// Yields the next key-value pair.
    pub fn next(&mut self) -> crate::Result<Option<(UserKey, UserValue)>> {
        // A cursor of a destroyed transaction reads nothing
        if let Some(tx_id) = self.tx_id {
            if !self.env.xm.exists(tx_id) {
                return Ok(None);
            }
        }

        Ok(self
            .iter
            .next()?
            .map(|stmt| (stmt.key.user_key, stmt.value)))
    }
}
