//! Dispatcher counters. Only the dispatcher records; callers read snapshots.
//!
//! ```compile_fail
//! use bucket_dispatch::metrics::DispatchStats;
//! ```
//!
//! ```
//! use bucket_dispatch::metrics::StatsSnapshot;
//!
//! let snapshot = StatsSnapshot { completed: 2, failed: 1, ..Default::default() };
//! assert_eq!(snapshot.resolved(), 3);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::interpreter::ThrottleScope;

/// Point-in-time copy of a dispatcher's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub route_throttles: u64,
    pub global_throttles: u64,
    pub bans: u64,
    pub workers_spawned: u64,
}

impl StatsSnapshot {
    /// Requests that reached a final outcome.
    pub fn resolved(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    route_throttles: AtomicU64,
    global_throttles: AtomicU64,
    bans: AtomicU64,
    workers_spawned: AtomicU64,
}

impl DispatchStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_throttle(&self, scope: ThrottleScope) {
        let counter = match scope {
            ThrottleScope::Route => &self.route_throttles,
            ThrottleScope::Global => &self.global_throttles,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ban(&self) {
        self.bans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_worker_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            route_throttles: self.route_throttles.load(Ordering::Relaxed),
            global_throttles: self.global_throttles.load(Ordering::Relaxed),
            bans: self.bans.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
        }
    }
}
