// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Background materialisation of long UPSERT chains.
//!
//! When a commit leaves a statement whose upsert chain counter reached
//! the threshold, the key is queued here. A single background thread
//! re-reads the key under the global view, folds the newer committed
//! versions from the active mem over the result, and plants the
//! resulting REPLACE back into the mem, so repeated UPSERTs of one key
//! never grow unbounded.

use crate::index::Index;
use crate::key::InternalKey;
use crate::range::tree::SearchMode;
use crate::read_iter::ReadIterator;
use crate::scheduler::quota::Quota;
use crate::seqno::{is_committed, VLSN_INF};
use crate::statement::{Statement, StatementType};
use crate::tx::TxManager;
use crate::UserKey;
use std::sync::atomic::Ordering::AcqRel;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

struct SquashRequest {
    index: Arc<Index>,
    key: UserKey,
}

pub(crate) struct SquashQueue {
    sender: Mutex<Option<Sender<SquashRequest>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SquashQueue {
    pub fn spawn(
        manager: Arc<TxManager>,
        quota: Arc<Quota>,
        stats: Arc<crate::env::EngineStats>,
    ) -> Self {
        let (sender, receiver) = channel::<SquashRequest>();

        #[allow(clippy::expect_used)]
        let handle = std::thread::Builder::new()
            .name("lsm-upsert-squash".into())
            .spawn(move || {
                while let Ok(request) = receiver.recv() {
                    if let Err(e) =
                        process(&manager, &quota, &request.index, &request.key)
                    {
                        log::warn!(
                            "upsert squash of {:?} failed: {e:?}",
                            request.key,
                        );
                        continue;
                    }

                    stats.upsert_squashed.fetch_add(1, AcqRel);
                }
            })
            .expect("should spawn squash thread");

        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queues a key whose chain hit the threshold.
    #[allow(clippy::expect_used)]
    pub fn push(&self, index: Arc<Index>, key: UserKey) {
        let sender = self.sender.lock().expect("lock is poisoned");
        if let Some(sender) = &*sender {
            let _ = sender.send(SquashRequest { index, key });
        }
    }

    #[allow(clippy::expect_used)]
    pub fn shutdown(&self) {
        self.sender.lock().expect("lock is poisoned").take();

        if let Some(handle) = self.handle.lock().expect("lock is poisoned").take() {
            let _ = handle.join();
        }
    }
}

/// One squash: read, fold newer mem versions, plant the REPLACE.
fn process(
    manager: &Arc<TxManager>,
    quota: &Arc<Quota>,
    index: &Arc<Index>,
    key: &UserKey,
) -> crate::Result<()> {
    // The global view avoids folding prepared, uncommitted statements
    let mut iter = ReadIterator::new(
        index.clone(),
        manager.clone(),
        None,
        SearchMode::Eq,
        key.clone(),
        VLSN_INF,
        true,
    );

    let Some(mut result) = iter.next()? else {
        return Ok(());
    };
    drop(iter);

    debug_assert_eq!(StatementType::Replace, result.stmt_type);

    // While we were reading on-disk runs, new statements may have
    // landed in the in-memory tree; fold them in
    let mem = {
        let range = index.locate_for_write(key);
        #[allow(clippy::expect_used)]
        let state = range.state.read().expect("lock is poisoned");
        state.active.clone()
    };

    let newer = mem
        .range(InternalKey::new(key.clone(), u64::MAX)..)
        .take_while(|stmt| stmt.key.user_key == *key)
        .filter(|stmt| is_committed(stmt.key.lsn) && stmt.key.lsn > result.key.lsn)
        .collect::<Vec<_>>();

    // Oldest first
    for stmt in newer.into_iter().rev() {
        match stmt.stmt_type {
            StatementType::Upsert => {
                if let Some(value) = index
                    .upsert_executor
                    .apply(Some(&result.value), &stmt.value)
                {
                    result =
                        Statement::replace(key.clone(), value, stmt.key.lsn);
                }
            }
            StatementType::Replace => result = stmt,
            StatementType::Delete => {
                // A newer deletion makes the chain moot
                return Ok(());
            }
            StatementType::Select => unreachable!("SELECT is never stored"),
        }
    }

    // The mem this chain lived in may have been dumped meanwhile; a
    // REPLACE below the mem's history would break its LSN bounds
    let anchored = mem
        .get(key, result.key.lsn)
        .is_some_and(|s| s.key.lsn == result.key.lsn);

    if !anchored {
        return Ok(());
    }

    // Same (key, LSN) identity: the newest UPSERT entry is replaced by
    // the materialised REPLACE
    let bytes = mem.insert(result);
    quota.force_use(bytes);

    log::trace!("squashed upsert chain of {key:?}");

    Ok(())
}
