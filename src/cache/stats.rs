//! Cache operation statistics.
//!
//! Counters are lock-free atomics; operation latencies feed a bounded
//! rolling window from which percentile estimates are computed on demand.
//! Counters reflect acknowledged operations only: an asynchronous
//! distributed-tier write bumps its counter when the write task completes,
//! not when it is queued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Default rolling-window capacity.
const DEFAULT_WINDOW: usize = 2048;

/// Bounded window of latency samples, in microseconds.
pub struct LatencyWindow {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency.as_micros() as u64);
    }

    /// Percentile in microseconds; `None` when the window is empty.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Live counters for the cache.
#[derive(Default)]
pub struct CacheStats {
    pub memory_hits: AtomicU64,
    pub memory_misses: AtomicU64,
    pub distributed_hits: AtomicU64,
    pub distributed_misses: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub evictions: AtomicU64,
    pub expired_removals: AtomicU64,
    pub total_ops: AtomicU64,
    latencies: LatencyWindow,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_op(&self, latency: Duration) {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        self.latencies.record(latency);
    }

    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            distributed_hits: self.distributed_hits.load(Ordering::Relaxed),
            distributed_misses: self.distributed_misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removals: self.expired_removals.load(Ordering::Relaxed),
            total_ops: self.total_ops.load(Ordering::Relaxed),
            p50_micros: self.latencies.percentile(50.0),
            p95_micros: self.latencies.percentile(95.0),
            p99_micros: self.latencies.percentile(99.0),
        }
    }
}

/// Point-in-time view of the counters, serializable for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub distributed_hits: u64,
    pub distributed_misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired_removals: u64,
    pub total_ops: u64,
    pub p50_micros: Option<u64>,
    pub p95_micros: Option<u64>,
    pub p99_micros: Option<u64>,
}
