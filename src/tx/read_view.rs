// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::seqno::Lsn;
use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{AcqRel, Acquire, Release},
};

/// An MVCC snapshot: a visibility ceiling plus bookkeeping.
///
/// A transaction is sent to a read view when another transaction's
/// prepare would otherwise invalidate what it has already read. The
/// view's `vlsn` starts at the preparing transaction's tentative LSN
/// and is stamped with the real commit LSN at commit.
pub struct ReadView {
    vlsn: AtomicU64,
    refs: AtomicU64,
    is_aborted: AtomicBool,
}

impl ReadView {
    #[must_use]
    pub fn new(vlsn: Lsn) -> Self {
        Self {
            vlsn: AtomicU64::new(vlsn),
            refs: AtomicU64::new(1),
            is_aborted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn vlsn(&self) -> Lsn {
        self.vlsn.load(Acquire)
    }

    pub(crate) fn set_vlsn(&self, vlsn: Lsn) {
        self.vlsn.store(vlsn, Release);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.is_aborted.load(Acquire)
    }

    pub(crate) fn abort(&self) {
        self.is_aborted.store(true, Release);
    }

    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, AcqRel);
    }

    /// Returns `true` if this was the last reference.
    pub(crate) fn ref_dec(&self) -> bool {
        self.refs.fetch_sub(1, AcqRel) == 1
    }
}
