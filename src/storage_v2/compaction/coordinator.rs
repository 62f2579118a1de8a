//! Compaction coordinator.
//!
//! Decides when a shard needs compaction and performs the merge:
//! 1. `should_compact()` checks the L0 segment count against the threshold
//! 2. `compact_shard()` merges L0 + the existing L1 run into new L1 segments
//!
//! The coordinator does not own the shard or the manifest. It reads an
//! immutable `Shard` snapshot and returns serialized output segments plus
//! the ids it consumed. The caller (MultiShardStore) writes the files,
//! commits the manifest and swaps its snapshot.

use std::collections::HashSet;

use crate::error::Result;
use crate::storage::{EdgeRecord, NodeRecord};
use crate::storage_v2::compaction::merge::{merge_edge_segments, merge_node_segments, MergeStats};
use crate::storage_v2::compaction::types::CompactionConfig;
use crate::storage_v2::segment::{EdgeSegment, NodeSegment};
use crate::storage_v2::shard::Shard;
use crate::storage_v2::types::{SegmentMeta, LEVEL_L1};
use crate::storage_v2::writer::{EdgeSegmentWriter, NodeSegmentWriter};

// ── Policy ──────────────────────────────────────────────────────────

/// True when the shard's L0 segment count (nodes + edges) has reached
/// the configured threshold.
pub fn should_compact(shard: &Shard, config: &CompactionConfig) -> bool {
    shard.l0_segment_count() > 0 && shard.l0_segment_count() >= config.segment_threshold.max(1)
}

// ── Compaction Output ───────────────────────────────────────────────

/// Serialized L1 output of one shard compaction.
#[derive(Debug, Default)]
pub struct ShardCompaction {
    pub shard_id: u16,
    /// Segment ids of every input, L0 and L1
    pub consumed: HashSet<u64>,
    pub node_outputs: Vec<(Vec<u8>, SegmentMeta)>,
    pub edge_outputs: Vec<(Vec<u8>, SegmentMeta)>,
    pub l0_segments_merged: u32,
    pub node_stats: MergeStats,
    pub edge_stats: MergeStats,
}

impl ShardCompaction {
    pub fn tombstones_removed(&self) -> u64 {
        self.node_stats.tombstones_removed + self.edge_stats.tombstones_removed
    }
}

/// Split a sorted run into chunks of about `target` records. A chunk only
/// ends between records for which `same_group` is false, so zone-map key
/// ranges of consecutive chunks never overlap.
pub fn split_sorted<R, F>(records: Vec<R>, target: usize, same_group: F) -> Vec<Vec<R>>
where
    F: Fn(&R, &R) -> bool,
{
    let target = target.max(1);
    let mut chunks: Vec<Vec<R>> = Vec::new();
    let mut current: Vec<R> = Vec::with_capacity(target.min(records.len()));
    for record in records {
        let boundary = current.len() >= target
            && current.last().map_or(true, |last| !same_group(last, &record));
        if boundary {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(record);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn write_node_chunks(records: Vec<NodeRecord>, target: usize) -> Result<Vec<(Vec<u8>, SegmentMeta)>> {
    split_sorted(records, target, |a, b| a.id == b.id)
        .into_iter()
        .map(|chunk| {
            let mut writer = NodeSegmentWriter::new();
            writer.extend(chunk);
            writer.finish_to_vec(LEVEL_L1)
        })
        .collect()
}

fn write_edge_chunks(records: Vec<EdgeRecord>, target: usize) -> Result<Vec<(Vec<u8>, SegmentMeta)>> {
    // Edge zone maps are keyed by src: never split one src across chunks.
    split_sorted(records, target, |a, b| a.src == b.src)
        .into_iter()
        .map(|chunk| {
            let mut writer = EdgeSegmentWriter::new();
            writer.extend(chunk);
            writer.finish_to_vec(LEVEL_L1)
        })
        .collect()
}

// ── Compact Shard ───────────────────────────────────────────────────

/// Merge every segment of `shard` into a fresh L1 run.
///
/// Inputs are read newest first (L0 reversed, then L1) so version ties
/// resolve toward newer data. Empty results produce no output segments;
/// the consumed inputs are still dropped by the caller.
pub fn compact_shard(shard: &Shard, config: &CompactionConfig) -> Result<ShardCompaction> {
    let mut consumed = HashSet::new();

    let node_inputs: Vec<&NodeSegment> = shard
        .node_segments_newest_first()
        .map(|s| {
            consumed.insert(s.desc.segment_id);
            s.segment.as_ref()
        })
        .collect();
    let edge_inputs: Vec<&EdgeSegment> = shard
        .edge_segments_newest_first()
        .map(|s| {
            consumed.insert(s.desc.segment_id);
            s.segment.as_ref()
        })
        .collect();

    let (nodes, node_stats) = merge_node_segments(&node_inputs);
    let (edges, edge_stats) = merge_edge_segments(&edge_inputs);

    tracing::debug!(
        shard = shard.id(),
        node_inputs = node_inputs.len(),
        edge_inputs = edge_inputs.len(),
        nodes_out = nodes.len(),
        edges_out = edges.len(),
        "Shard merge finished"
    );

    Ok(ShardCompaction {
        shard_id: shard.id(),
        consumed,
        node_outputs: write_node_chunks(nodes, config.l1_target_records)?,
        edge_outputs: write_edge_chunks(edges, config.l1_target_records)?,
        l0_segments_merged: shard.l0_segment_count() as u32,
        node_stats,
        edge_stats,
    })
}

// ── Tests ──────────────────────────────────────────────────────────
