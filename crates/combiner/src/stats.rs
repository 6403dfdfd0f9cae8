//! Loop counters.
//!
//! Updated by the driver loop with relaxed atomics and read without taking
//! the registry lock, so a snapshot is not a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::queue::Polled;
use crate::registry::Resolution;

#[derive(Debug, Default)]
pub struct CombinerStats {
    polls: AtomicU64,
    forwarded: AtomicU64,
    timeouts: AtomicU64,
    interrupted: AtomicU64,
    deferred_deletes: AtomicU64,
    dropped: AtomicU64,
    idle_waits: AtomicU64,
}

/// Point-in-time copy of [`CombinerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub polls: u64,
    pub forwarded: u64,
    pub timeouts: u64,
    pub interrupted: u64,
    pub deferred_deletes: u64,
    pub dropped: u64,
    pub idle_waits: u64,
}

impl CombinerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_poll<T>(&self, polled: &Polled<T>, resolution: Resolution) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        match polled {
            Polled::Item(_) => {}
            Polled::TimedOut => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Polled::Interrupted => {
                self.interrupted.fetch_add(1, Ordering::Relaxed);
            }
        }
        if resolution == Resolution::RemovedDeferred {
            self.deferred_deletes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_idle_wait(&self) {
        self.idle_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            deferred_deletes: self.deferred_deletes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            idle_waits: self.idle_waits.load(Ordering::Relaxed),
        }
    }
}
