//! Host resource detection and default tuning.
//!
//! Detects RAM and CPU count, then derives the store's default limits
//! from them. Stateless: each `ResourceManager::auto_tune()` call inspects
//! the system again.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const MB: usize = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Rough in-buffer footprint of one record, used to turn the byte budget
/// into record-count limits.
const BYTES_PER_NODE: usize = 220;
const BYTES_PER_EDGE: usize = 120;

const WRITE_BUFFER_MIN: usize = 10 * MB;
const WRITE_BUFFER_MAX: usize = 100 * MB;

/// Share of available memory given to one database's write buffer.
const WRITE_BUFFER_FRACTION: f64 = 0.02;

// ── SystemResources ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SystemResources {
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub cpu_count: usize,
}

impl SystemResources {
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// 0.0 = everything free, 1.0 = nothing available.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

// ── TuningProfile ───────────────────────────────────────────────────

/// Limits derived from the host.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningProfile {
    pub shard_count: u16,
    /// L0 segments per shard before compaction triggers
    pub segment_threshold: usize,
    pub write_buffer_node_limit: usize,
    pub write_buffer_edge_limit: usize,
    pub write_buffer_byte_limit: usize,
    /// Records per L1 output segment
    pub l1_target_records: usize,
    pub compaction_threads: usize,
}

impl TuningProfile {
    /// Heuristics:
    /// - `shard_count`: `min(16, next_power_of_two(cpu_count))` with at
    ///   least 2 GB of RAM, else 1.
    /// - `segment_threshold`: RAM < 4 GB -> 2, < 16 GB -> 4, else 8.
    /// - write buffer: `clamp(available * 0.02, 10 MB, 100 MB)`, split into
    ///   node and edge record limits.
    /// - `compaction_threads`: RAM < 4 GB -> 1, else `clamp(cpu / 2, 1, 4)`.
    pub fn from_resources(res: &SystemResources) -> Self {
        let total_gb = res.total_memory_bytes as f64 / GB as f64;

        let shard_count = if res.total_memory_bytes >= 2 * GB {
            res.cpu_count.next_power_of_two().min(16) as u16
        } else {
            1
        };

        let segment_threshold = if total_gb < 4.0 {
            2
        } else if total_gb < 16.0 {
            4
        } else {
            8
        };

        let raw_bytes = (res.available_memory_bytes as f64 * WRITE_BUFFER_FRACTION) as usize;
        let write_buffer_byte_limit = raw_bytes.clamp(WRITE_BUFFER_MIN, WRITE_BUFFER_MAX);

        let compaction_threads = if total_gb < 4.0 {
            1
        } else {
            (res.cpu_count / 2).clamp(1, 4)
        };

        // An L1 segment holds about ten write buffers' worth of nodes.
        let l1_target_records = (write_buffer_byte_limit / BYTES_PER_NODE) * 10;

        Self {
            shard_count,
            segment_threshold,
            write_buffer_node_limit: write_buffer_byte_limit / BYTES_PER_NODE,
            write_buffer_edge_limit: write_buffer_byte_limit / BYTES_PER_EDGE,
            write_buffer_byte_limit,
            l1_target_records,
            compaction_threads,
        }
    }
}

impl Default for TuningProfile {
    /// Conservative values for tests and unknown hosts.
    fn default() -> Self {
        Self {
            shard_count: 4,
            segment_threshold: 4,
            write_buffer_node_limit: 50_000,
            write_buffer_edge_limit: 100_000,
            write_buffer_byte_limit: 10 * MB,
            l1_target_records: 500_000,
            compaction_threads: 1,
        }
    }
}

// ── ResourceManager ─────────────────────────────────────────────────

pub struct ResourceManager;

impl ResourceManager {
    /// Inspect the host and derive a tuning profile.
    pub fn auto_tune() -> TuningProfile {
        let resources = SystemResources::detect();
        let profile = TuningProfile::from_resources(&resources);
        tracing::debug!(
            cpus = resources.cpu_count,
            total_mb = resources.total_memory_bytes / MB as u64,
            pressure = resources.memory_pressure(),
            shards = profile.shard_count,
            "Auto-tuned engine defaults"
        );
        profile
    }
}

// ── Tests ───────────────────────────────────────────────────────────
