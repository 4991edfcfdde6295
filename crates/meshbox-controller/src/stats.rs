//! Controller-wide counters surfaced for logging/metrics.
//!
//! The dropped-request count is kept as a named, queryable counter rather than a value
//! only ever formatted once at exit, so both the RPC server and the scheduler can log it
//! mid-run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters the controller binary logs periodically and prints at shutdown.
#[derive(Debug, Default)]
pub struct ControllerStats {
    dropped_requests: AtomicU64,
    issued_requests: AtomicU64,
    completed_requests: AtomicU64,
}

impl ControllerStats {
    /// Builds a fresh, zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a request was dropped (no sandbox could be found or created for it
    /// after exhausting the scheduler's retry and eviction budgets).
    pub fn record_dropped(&self) {
        self.dropped_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records that a request was handed to a worker RPC.
    pub fn record_issued(&self) {
        self.issued_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records that a request's worker RPC returned, successfully or not.
    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Total requests dropped so far.
    pub fn dropped_requests(&self) -> u64 {
        self.dropped_requests.load(Ordering::Relaxed)
    }

    /// Total requests issued to a worker so far.
    pub fn issued_requests(&self) -> u64 {
        self.issued_requests.load(Ordering::Relaxed)
    }

    /// Total requests that have completed (successfully or not) so far.
    pub fn completed_requests(&self) -> u64 {
        self.completed_requests.load(Ordering::Relaxed)
    }

    /// `issued - completed`: the scheduler's trace-drain stopping condition compares this
    /// against a threshold before it will stop waiting and send `Terminate` to every worker.
    pub fn in_flight(&self) -> u64 {
        self.issued_requests()
            .saturating_sub(self.completed_requests())
    }
}

#[cfg(test)]
mod tests {
    use super::ControllerStats;

    // ── 1. in_flight tracks issued minus completed ──
    #[test]
    fn in_flight_tracks_issued_minus_completed() {
        let stats = ControllerStats::new();
        stats.record_issued();
        stats.record_issued();
        stats.record_completed();
        assert_eq!(stats.in_flight(), 1);
    }

    // ── 2. dropped requests accumulate independently ──
    #[test]
    fn dropped_requests_accumulate() {
        let stats = ControllerStats::new();
        stats.record_dropped();
        stats.record_dropped();
        assert_eq!(stats.dropped_requests(), 2);
    }
}
