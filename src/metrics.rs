//! Server-wide performance metrics
//!
//! Lightweight, thread-safe counters collected per server (not per
//! database): request latencies with percentiles, slow requests, flush and
//! compaction totals. Disabled unless `factdb-server --metrics` is given.
//!
//! ```
//! use factdb::metrics::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_query("bfs", 15);
//! assert_eq!(metrics.snapshot().query_count, 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::storage_v2::compaction::CompactionResult;

/// Rolling window of request latencies used for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Only the most recent slow requests are kept.
const MAX_SLOW_QUERIES: usize = 10;

/// Operations reported in `MetricsSnapshot::op_stats`, busiest first.
const TOP_OPERATIONS: usize = 5;

/// Requests at or above this duration are counted as slow and logged.
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 100;

#[derive(Default)]
struct OpTotals {
    count: u64,
    latency_sum_ms: u64,
}

/// Thread-safe metrics collector. One per server, shared behind `Arc`.
pub struct Metrics {
    query_count: AtomicU64,
    slow_query_count: AtomicU64,
    latencies_ms: Mutex<VecDeque<u64>>,
    latency_sum_ms: AtomicU64,

    /// Per-operation count and latency sum, keyed by wire command name
    ops: Mutex<HashMap<String, OpTotals>>,

    flush_count: AtomicU64,
    flush_total_ms: AtomicU64,
    last_flush_ms: AtomicU64,
    last_flush_nodes: AtomicU64,
    last_flush_edges: AtomicU64,

    compaction_count: AtomicU64,
    compaction_failures: AtomicU64,
    last_compaction_ms: AtomicU64,
    tombstones_removed: AtomicU64,

    slow_queries: Mutex<VecDeque<SlowQuery>>,
    started_at: Instant,
}

/// A request that took at least `SLOW_QUERY_THRESHOLD_MS`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQuery {
    pub operation: String,
    pub duration_ms: u64,
    /// Milliseconds since metrics collection started
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStat {
    pub operation: String,
    pub count: u64,
    pub avg_ms: u64,
}

/// Point-in-time copy of all counters, sent in the `getStats` response.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub query_count: u64,
    pub slow_query_count: u64,
    pub query_p50_ms: u64,
    pub query_p95_ms: u64,
    pub query_p99_ms: u64,
    pub query_avg_ms: u64,

    pub flush_count: u64,
    pub flush_avg_ms: u64,
    pub last_flush_ms: u64,
    pub last_flush_nodes: u64,
    pub last_flush_edges: u64,

    pub compaction_count: u64,
    pub compaction_failures: u64,
    pub last_compaction_ms: u64,
    pub tombstones_removed: u64,

    pub top_slow_queries: Vec<SlowQuery>,
    pub uptime_secs: u64,
    pub op_stats: Vec<OperationStat>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            query_count: AtomicU64::new(0),
            slow_query_count: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_ms: AtomicU64::new(0),
            ops: Mutex::new(HashMap::new()),
            flush_count: AtomicU64::new(0),
            flush_total_ms: AtomicU64::new(0),
            last_flush_ms: AtomicU64::new(0),
            last_flush_nodes: AtomicU64::new(0),
            last_flush_edges: AtomicU64::new(0),
            compaction_count: AtomicU64::new(0),
            compaction_failures: AtomicU64::new(0),
            last_compaction_ms: AtomicU64::new(0),
            tombstones_removed: AtomicU64::new(0),
            slow_queries: Mutex::new(VecDeque::with_capacity(MAX_SLOW_QUERIES)),
            started_at: Instant::now(),
        }
    }

    /// Record one handled request. `operation` is the wire command name.
    ///
    /// O(1) amortized: atomic increments plus bounded deque updates.
    pub fn record_query(&self, operation: &str, duration_ms: u64) {
        self.query_count.fetch_add(1, Ordering::Relaxed);

        {
            let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
            let totals = ops.entry(operation.to_string()).or_default();
            totals.count += 1;
            totals.latency_sum_ms += duration_ms;
        }

        {
            let mut latencies = self.latencies_ms.lock().unwrap_or_else(PoisonError::into_inner);
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = latencies.pop_front() {
                    self.latency_sum_ms.fetch_sub(old, Ordering::Relaxed);
                }
            }
            latencies.push_back(duration_ms);
            self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        }

        if duration_ms >= SLOW_QUERY_THRESHOLD_MS {
            self.slow_query_count.fetch_add(1, Ordering::Relaxed);
            let slow_query = SlowQuery {
                operation: operation.to_string(),
                duration_ms,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            };
            let mut slow_queries = self.slow_queries.lock().unwrap_or_else(PoisonError::into_inner);
            if slow_queries.len() >= MAX_SLOW_QUERIES {
                slow_queries.pop_front();
            }
            slow_queries.push_back(slow_query);
        }
    }

    pub fn record_flush(&self, duration_ms: u64, nodes_written: u64, edges_written: u64) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.flush_total_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.last_flush_ms.store(duration_ms, Ordering::Relaxed);
        self.last_flush_nodes.store(nodes_written, Ordering::Relaxed);
        self.last_flush_edges.store(edges_written, Ordering::Relaxed);
    }

    /// Record a compaction pass, explicit or background. No-op passes are
    /// not counted.
    pub fn record_compaction(&self, result: &CompactionResult) {
        if result.is_noop() {
            return;
        }
        self.compaction_count.fetch_add(1, Ordering::Relaxed);
        self.last_compaction_ms.store(result.duration_ms, Ordering::Relaxed);
        self.tombstones_removed
            .fetch_add(result.tombstones_removed, Ordering::Relaxed);
    }

    pub fn record_compaction_failure(&self) {
        self.compaction_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Sorting the latency window is O(LATENCY_WINDOW_SIZE); only done on
    /// `getStats`.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let latencies = self.latencies_ms.lock().unwrap_or_else(PoisonError::into_inner);
            if latencies.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();
                let len = sorted.len();
                let avg = self.latency_sum_ms.load(Ordering::Relaxed) / len as u64;
                (
                    sorted[len * 50 / 100],
                    sorted[len * 95 / 100],
                    sorted[(len * 99 / 100).min(len - 1)],
                    avg,
                )
            }
        };

        let flush_count = self.flush_count.load(Ordering::Relaxed);
        let flush_avg_ms = if flush_count > 0 {
            self.flush_total_ms.load(Ordering::Relaxed) / flush_count
        } else {
            0
        };

        let top_slow_queries = self
            .slow_queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        MetricsSnapshot {
            query_count: self.query_count.load(Ordering::Relaxed),
            slow_query_count: self.slow_query_count.load(Ordering::Relaxed),
            query_p50_ms: p50,
            query_p95_ms: p95,
            query_p99_ms: p99,
            query_avg_ms: avg,
            flush_count,
            flush_avg_ms,
            last_flush_ms: self.last_flush_ms.load(Ordering::Relaxed),
            last_flush_nodes: self.last_flush_nodes.load(Ordering::Relaxed),
            last_flush_edges: self.last_flush_edges.load(Ordering::Relaxed),
            compaction_count: self.compaction_count.load(Ordering::Relaxed),
            compaction_failures: self.compaction_failures.load(Ordering::Relaxed),
            last_compaction_ms: self.last_compaction_ms.load(Ordering::Relaxed),
            tombstones_removed: self.tombstones_removed.load(Ordering::Relaxed),
            top_slow_queries,
            uptime_secs: self.started_at.elapsed().as_secs(),
            op_stats: self.top_operations(TOP_OPERATIONS),
        }
    }

    /// Busiest operations first; ties broken by name.
    fn top_operations(&self, n: usize) -> Vec<OperationStat> {
        let ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats: Vec<OperationStat> = ops
            .iter()
            .map(|(name, totals)| OperationStat {
                operation: name.clone(),
                count: totals.count,
                avg_ms: totals.latency_sum_ms / totals.count.max(1),
            })
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.operation.cmp(&b.operation)));
        stats.truncate(n);
        stats
    }
}
