// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{
    AtomicU64,
    Ordering::{AcqRel, Acquire, Release},
};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Wakes the scheduler main loop; shared between the quota and the
/// scheduler state.
#[derive(Default)]
pub(crate) struct WakeSignal {
    lock: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    #[allow(clippy::expect_used)]
    pub fn raise(&self) {
        let mut raised = self.lock.lock().expect("lock is poisoned");
        *raised = true;
        self.cond.notify_all();
    }

    /// Waits until raised or the timeout elapses, then clears the flag.
    #[allow(clippy::expect_used)]
    pub fn wait(&self, timeout: Duration) {
        let guard = self.lock.lock().expect("lock is poisoned");

        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .expect("lock is poisoned");

        *guard = false;
    }
}

/// The engine memory quota with its dump watermark.
///
/// Writers allocate; crossing the watermark wakes the scheduler so a
/// dump can start before the hard limit is hit; crossing the hard
/// limit blocks the writer on a condition variable that dumps release.
pub struct Quota {
    used: AtomicU64,
    limit: u64,
    watermark: AtomicU64,

    /// Lifetime total of allocated bytes, for write rate sampling
    total_allocated: AtomicU64,

    gate: Mutex<QuotaGate>,
    cond: Condvar,

    wake: std::sync::Arc<WakeSignal>,
}

#[derive(Default)]
struct QuotaGate {
    /// Last scheduler diagnostic, inherited by stalled writers
    last_error: Option<String>,
}

impl Quota {
    pub(crate) fn new(limit: u64, wake: std::sync::Arc<WakeSignal>) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
            watermark: AtomicU64::new(limit),
            total_allocated: AtomicU64::new(0),
            gate: Mutex::new(QuotaGate::default()),
            cond: Condvar::new(),
            wake,
        }
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Acquire)
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Acquire)
    }

    #[must_use]
    pub fn is_above_watermark(&self) -> bool {
        self.used() >= self.watermark()
    }

    pub(crate) fn total_allocated(&self) -> u64 {
        self.total_allocated.load(Acquire)
    }

    /// Allocates, blocking while the hard limit is exceeded.
    ///
    /// A zero-sized use is the barrier the write path takes before
    /// pinning mems; waiting after pinning could deadlock the dump
    /// that would release the quota.
    #[allow(clippy::expect_used)]
    pub(crate) fn try_use(&self, size: u64) -> crate::Result<()> {
        loop {
            let used = self.used.load(Acquire);

            if used + size <= self.limit {
                self.used.fetch_add(size, AcqRel);
                self.total_allocated.fetch_add(size, AcqRel);

                if self.is_above_watermark() {
                    self.wake.raise();
                }

                return Ok(());
            }

            // Stalled: kick the scheduler and wait for a dump
            self.wake.raise();

            let gate = self.gate.lock().expect("lock is poisoned");

            if let Some(err) = &gate.last_error {
                return Err(crate::Error::QuotaExceeded(Some(err.clone())));
            }

            let (gate, timed_out) = self
                .cond
                .wait_timeout(gate, Duration::from_secs(5))
                .expect("lock is poisoned");

            if timed_out.timed_out() {
                if let Some(err) = &gate.last_error {
                    return Err(crate::Error::QuotaExceeded(Some(err.clone())));
                }
                return Err(crate::Error::QuotaExceeded(None));
            }
        }
    }

    /// Allocates unconditionally (the write already happened).
    pub(crate) fn force_use(&self, size: u64) {
        self.used.fetch_add(size, AcqRel);
        self.total_allocated.fetch_add(size, AcqRel);

        if self.is_above_watermark() {
            self.wake.raise();
        }
    }

    /// Releases quota after a dump; unblocks stalled writers.
    #[allow(clippy::expect_used)]
    pub(crate) fn release(&self, size: u64) {
        let mut current = self.used.load(Acquire);
        loop {
            let next = current.saturating_sub(size);
            match self.used.compare_exchange(current, next, AcqRel, Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let _gate = self.gate.lock().expect("lock is poisoned");
        self.cond.notify_all();
    }

    /// Publishes the scheduler's last failure; stalled writers inherit
    /// it instead of waiting forever.
    #[allow(clippy::expect_used)]
    pub(crate) fn set_last_error(&self, error: Option<String>) {
        let mut gate = self.gate.lock().expect("lock is poisoned");
        gate.last_error = error;
        drop(gate);
        self.cond.notify_all();
    }

    /// Recomputes the watermark so that a dump of the largest range,
    /// at the observed bandwidth, finishes before the incoming write
    /// rate exhausts the remaining headroom.
    pub(crate) fn update_watermark(
        &self,
        write_rate_bps: u64,
        dump_bandwidth_bps: u64,
        max_range_size: u64,
    ) {
        let dump_secs = max_range_size
            .checked_div(dump_bandwidth_bps.max(1))
            .unwrap_or(0)
            .max(1);

        let headroom = write_rate_bps.saturating_mul(dump_secs);

        // Never drop below half the limit, or dumps would thrash
        let watermark = self
            .limit
            .saturating_sub(headroom)
            .max(self.limit / 2);

        self.watermark.store(watermark, Release);
    }
}
