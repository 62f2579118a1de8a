//! Types for LSM-style compaction.
//!
//! Compaction merges a shard's L0 (flush) segments together with its
//! current L1 run into a fresh, non-overlapping L1 run, dropping
//! superseded versions and tombstones.

use serde::{Deserialize, Serialize};

/// Compaction trigger policy and output sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// L0 segment count per shard (nodes + edges) that triggers compaction
    pub segment_threshold: usize,
    /// Maximum records per L1 output segment
    pub l1_target_records: usize,
    /// Worker threads for cross-shard parallelism (0 = rayon default)
    pub threads: usize,
    /// Run compaction on the background worker after each flush
    pub background: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            segment_threshold: 4,
            l1_target_records: 1_000_000,
            threads: 0,
            background: true,
        }
    }
}

/// Result of a compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    /// Shards that were compacted
    pub shards_compacted: Vec<u16>,
    /// Live node records written to L1
    pub nodes_merged: u64,
    /// Live edge records written to L1
    pub edges_merged: u64,
    /// Keys whose newest version was a tombstone, physically removed
    pub tombstones_removed: u64,
    /// Input segments consumed
    pub segments_merged: u64,
    /// Output segments written
    pub segments_written: u64,
    pub duration_ms: u64,
}

impl CompactionResult {
    pub fn is_noop(&self) -> bool {
        self.shards_compacted.is_empty()
    }
}

/// Compaction metadata stored in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompactionInfo {
    /// Manifest version produced by the compaction
    pub manifest_version: u64,
    /// Unix epoch ms
    pub timestamp_ms: u64,
    /// L0 segments merged
    pub l0_segments_merged: u32,
}

// ── Tests ──────────────────────────────────────────────────────────
