//! Statistics tracking for the DNS proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::pipeline::Disposition;

/// Atomic statistics for tracking proxy performance.
pub struct Stats {
    requests: AtomicU64,
    hosts: AtomicU64,
    cached: AtomicU64,
    forwarded: AtomicU64,
    rejected: AtomicU64,
    sinkholed: AtomicU64,
    failed: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            hosts: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            sinkholed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, disposition: Disposition, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.counter(disposition).fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn counter(&self, disposition: Disposition) -> &AtomicU64 {
        match disposition {
            Disposition::Hosts => &self.hosts,
            Disposition::Cache => &self.cached,
            Disposition::Upstream => &self.forwarded,
            Disposition::Rejected => &self.rejected,
            Disposition::Sinkholed => &self.sinkholed,
            Disposition::Failed => &self.failed,
        }
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            hosts: self.hosts.swap(0, Ordering::Relaxed),
            cached: self.cached.swap(0, Ordering::Relaxed),
            forwarded: self.forwarded.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            sinkholed: self.sinkholed.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub hosts: u64,
    pub cached: u64,
    pub forwarded: u64,
    pub rejected: u64,
    pub sinkholed: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_counts_each_disposition() {
        let stats = Stats::new();
        stats.record(Disposition::Upstream, Duration::from_millis(4));
        stats.record(Disposition::Cache, Duration::from_millis(2));
        stats.record(Disposition::Cache, Duration::from_millis(0));
        stats.record(Disposition::Sinkholed, Duration::from_millis(2));

        let snapshot = stats.snapshot_and_reset();

        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.forwarded, 1);
        assert_eq!(snapshot.cached, 2);
        assert_eq!(snapshot.sinkholed, 1);
        assert_eq!(snapshot.hosts, 0);
        assert!((snapshot.avg_response_ms - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_resets_counters() {
        let stats = Stats::new();
        stats.record(Disposition::Failed, Duration::from_millis(1));
        stats.snapshot_and_reset();

        let snapshot = stats.snapshot_and_reset();

        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.avg_response_ms, 0.0);
    }
}
