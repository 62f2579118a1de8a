//! K-way merge for LSM-style compaction.
//!
//! Every input segment is already sorted by key, so the merge streams them
//! through a binary heap ordered by (key ascending, version descending,
//! source ascending). The first record popped for a key is its newest
//! version; later records for the same key are superseded and skipped.
//! A winning tombstone drops the key entirely: the inputs cover every
//! level of the shard, so nothing older can resurface.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::storage::{EdgeKey, EdgeRecord, NodeRecord};
use crate::storage_v2::segment::{EdgeSegment, NodeSegment};

/// A record that can take part in a merge.
pub trait Versioned {
    type Key: Ord + Clone;

    fn merge_key(&self) -> Self::Key;
    fn version(&self) -> u64;
    fn is_tombstone(&self) -> bool;
}

impl Versioned for NodeRecord {
    type Key = u128;

    fn merge_key(&self) -> u128 {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

impl Versioned for EdgeRecord {
    type Key = EdgeKey;

    fn merge_key(&self) -> EdgeKey {
        self.key()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

/// Counters produced by a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub records_in: u64,
    pub records_out: u64,
    /// Keys whose winning record was a tombstone
    pub tombstones_removed: u64,
    /// Older versions shadowed by a newer one
    pub superseded: u64,
}

struct HeapEntry<R: Versioned> {
    key: R::Key,
    version: u64,
    source: usize,
    record: R,
}

impl<R: Versioned> PartialEq for HeapEntry<R> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<R: Versioned> Eq for HeapEntry<R> {}

impl<R: Versioned> PartialOrd for HeapEntry<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: Versioned> Ord for HeapEntry<R> {
    // BinaryHeap pops the greatest entry: smallest key, then highest
    // version, then lowest source index (newest source).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then(self.version.cmp(&other.version))
            .then(other.source.cmp(&self.source))
    }
}

/// Merge key-sorted sources into one sorted, deduplicated, tombstone-free
/// run. Sources are ordered newest first; the index only breaks version
/// ties.
pub fn merge_sorted<R, I>(sources: Vec<I>) -> (Vec<R>, MergeStats)
where
    R: Versioned,
    I: Iterator<Item = R>,
{
    let mut iters = sources;
    let mut heap = BinaryHeap::with_capacity(iters.len());
    let mut stats = MergeStats::default();

    for (source, it) in iters.iter_mut().enumerate() {
        if let Some(record) = it.next() {
            heap.push(HeapEntry {
                key: record.merge_key(),
                version: record.version(),
                source,
                record,
            });
        }
    }

    let mut out = Vec::new();
    let mut last_key: Option<R::Key> = None;

    while let Some(entry) = heap.pop() {
        stats.records_in += 1;
        let HeapEntry {
            key, source, record, ..
        } = entry;

        if last_key.as_ref() == Some(&key) {
            stats.superseded += 1;
        } else {
            if record.is_tombstone() {
                stats.tombstones_removed += 1;
            } else {
                out.push(record);
            }
            last_key = Some(key);
        }

        if let Some(next) = iters[source].next() {
            heap.push(HeapEntry {
                key: next.merge_key(),
                version: next.version(),
                source,
                record: next,
            });
        }
    }

    stats.records_out = out.len() as u64;
    (out, stats)
}

/// Merge node segments (newest first).
pub fn merge_node_segments(segments: &[&NodeSegment]) -> (Vec<NodeRecord>, MergeStats) {
    merge_sorted(segments.iter().map(|s| s.iter()).collect())
}

/// Merge edge segments (newest first).
pub fn merge_edge_segments(segments: &[&EdgeSegment]) -> (Vec<EdgeRecord>, MergeStats) {
    merge_sorted(segments.iter().map(|s| s.iter()).collect())
}

// ── Tests ──────────────────────────────────────────────────────────
