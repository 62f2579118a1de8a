//! Per-shard view of the segment levels.
//!
//! A `Shard` is an immutable snapshot of one id range: the L0 segments in
//! flush order plus the L1 run sorted by key range. It is rebuilt whenever
//! the manifest changes; opened segments are shared between successive
//! views through `Arc`, so a rebuild costs only the newly added segments.
//!
//! Read precedence inside a shard: L0 newest to oldest, then L1. The
//! first record found for a key wins, tombstones included; callers drop
//! tombstoned winners.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{GraphError, Result};
use crate::storage::{AttrQuery, EdgeKey, EdgeRecord, NodeRecord};
use crate::storage_v2::manifest::{Manifest, SegmentDescriptor};
use crate::storage_v2::segment::{EdgeSegment, NodeSegment};
use crate::storage_v2::types::{SegmentType, LEVEL_L0, LEVEL_L1};

/// A segment together with its manifest entry.
#[derive(Debug)]
pub struct LoadedSegment<S> {
    pub desc: SegmentDescriptor,
    pub segment: Arc<S>,
}

impl<S> Clone for LoadedSegment<S> {
    fn clone(&self) -> Self {
        Self {
            desc: self.desc.clone(),
            segment: Arc::clone(&self.segment),
        }
    }
}

/// Opened segments by segment id.
pub type NodeSegmentCache = HashMap<u64, Arc<NodeSegment>>;
pub type EdgeSegmentCache = HashMap<u64, Arc<EdgeSegment>>;

#[derive(Debug, Clone, Default)]
pub struct Shard {
    id: u16,
    /// Oldest first
    l0_nodes: Vec<LoadedSegment<NodeSegment>>,
    l0_edges: Vec<LoadedSegment<EdgeSegment>>,
    /// Sorted by min_key, non-overlapping
    l1_nodes: Vec<LoadedSegment<NodeSegment>>,
    l1_edges: Vec<LoadedSegment<EdgeSegment>>,
}

fn attach<S>(
    manifest: &Manifest,
    shard_id: u16,
    seg_type: SegmentType,
    level: u8,
    cache: &HashMap<u64, Arc<S>>,
) -> Result<Vec<LoadedSegment<S>>> {
    manifest
        .shard_segments(shard_id, seg_type, level)
        .map(|desc| {
            let segment = cache.get(&desc.segment_id).cloned().ok_or_else(|| {
                GraphError::Manifest(format!(
                    "manifest v{} references segment {} which is not loaded",
                    manifest.version, desc.segment_id
                ))
            })?;
            Ok(LoadedSegment {
                desc: desc.clone(),
                segment,
            })
        })
        .collect()
}

impl Shard {
    pub fn empty(id: u16) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Assemble the view of `shard_id` described by `manifest`. Every
    /// referenced segment must already be present in the caches.
    pub fn build(
        shard_id: u16,
        manifest: &Manifest,
        nodes: &NodeSegmentCache,
        edges: &EdgeSegmentCache,
    ) -> Result<Self> {
        let mut l1_nodes = attach(manifest, shard_id, SegmentType::Nodes, LEVEL_L1, nodes)?;
        let mut l1_edges = attach(manifest, shard_id, SegmentType::Edges, LEVEL_L1, edges)?;
        l1_nodes.sort_by_key(|s| s.desc.min_key);
        l1_edges.sort_by_key(|s| s.desc.min_key);
        Ok(Self {
            id: shard_id,
            l0_nodes: attach(manifest, shard_id, SegmentType::Nodes, LEVEL_L0, nodes)?,
            l0_edges: attach(manifest, shard_id, SegmentType::Edges, LEVEL_L0, edges)?,
            l1_nodes,
            l1_edges,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn l0_segment_count(&self) -> usize {
        self.l0_nodes.len() + self.l0_edges.len()
    }

    pub fn l1_segment_count(&self) -> usize {
        self.l1_nodes.len() + self.l1_edges.len()
    }

    pub fn l0_node_segments(&self) -> &[LoadedSegment<NodeSegment>] {
        &self.l0_nodes
    }

    pub fn l0_edge_segments(&self) -> &[LoadedSegment<EdgeSegment>] {
        &self.l0_edges
    }

    pub fn l1_node_segments(&self) -> &[LoadedSegment<NodeSegment>] {
        &self.l1_nodes
    }

    pub fn l1_edge_segments(&self) -> &[LoadedSegment<EdgeSegment>] {
        &self.l1_edges
    }

    /// Node segments in read precedence order.
    pub fn node_segments_newest_first(&self) -> impl Iterator<Item = &LoadedSegment<NodeSegment>> {
        self.l0_nodes.iter().rev().chain(self.l1_nodes.iter())
    }

    pub fn edge_segments_newest_first(&self) -> impl Iterator<Item = &LoadedSegment<EdgeSegment>> {
        self.l0_edges.iter().rev().chain(self.l1_edges.iter())
    }
}

// ── Point Lookup ───────────────────────────────────────────────────

impl Shard {
    /// Newest record for `id` in this shard, tombstones included.
    pub fn get_node(&self, id: u128) -> Option<NodeRecord> {
        for seg in self.l0_nodes.iter().rev() {
            if let Some(rec) = seg.segment.find(id) {
                return Some(rec);
            }
        }
        // L1 ranges are disjoint: at most one segment can hold the id.
        let idx = self.l1_nodes.partition_point(|s| s.desc.max_key < id);
        self.l1_nodes
            .get(idx)
            .and_then(|seg| seg.segment.find(id))
    }
}

// ── Scans ──────────────────────────────────────────────────────────

impl Shard {
    /// Visit the winning record of every node id not already in `seen`.
    pub fn scan_nodes<F>(&self, seen: &mut HashSet<u128>, mut visit: F)
    where
        F: FnMut(NodeRecord),
    {
        for seg in self.node_segments_newest_first() {
            let s = &seg.segment;
            for i in 0..s.record_count() {
                if seen.insert(s.get_id(i)) {
                    visit(s.get_record(i));
                }
            }
        }
    }

    /// Ids of live rows matching `query` in any segment. Zone maps skip
    /// whole segments; indexed segments visit only the rows their type or
    /// file index names. Older rows may be shadowed by newer ones that the
    /// zone maps pruned, so callers re-resolve each candidate.
    pub fn node_candidates(&self, query: &AttrQuery, out: &mut HashSet<u128>) {
        let needs_full_check = query.name.is_some() || !query.metadata_filters.is_empty();
        for seg in self.node_segments_newest_first() {
            let s = &seg.segment;
            if let Some(ref t) = query.node_type {
                if !s.may_contain_type(t) {
                    continue;
                }
            }
            if let Some(ref f) = query.file {
                if !s.may_contain_file(f) {
                    continue;
                }
            }
            let row_matches = |i: usize| {
                if s.is_deleted(i) {
                    return false;
                }
                if let Some(ref f) = query.file {
                    if s.get_file(i) != f {
                        return false;
                    }
                }
                if let Some(ref t) = query.node_type {
                    if !crate::storage::type_matches(t, s.get_node_type(i)) {
                        return false;
                    }
                }
                !needs_full_check || query.matches(&s.get_record(i))
            };
            match s.attr_index().and_then(|idx| idx.candidate_rows(query)) {
                Some(rows) => {
                    for i in rows.into_iter().filter(|&i| row_matches(i)) {
                        out.insert(s.get_id(i));
                    }
                }
                None => {
                    for i in (0..s.record_count()).filter(|&i| row_matches(i)) {
                        out.insert(s.get_id(i));
                    }
                }
            }
        }
    }

    /// Winning edge records with this src, not already in `seen`.
    pub fn edges_from(&self, src: u128, seen: &mut HashSet<EdgeKey>, out: &mut Vec<EdgeRecord>) {
        for seg in self.edge_segments_newest_first() {
            for e in seg.segment.find_by_src(src) {
                if seen.insert(e.key()) {
                    out.push(e);
                }
            }
        }
    }

    /// Winning edge records with this dst, not already in `seen`.
    pub fn edges_to(&self, dst: u128, seen: &mut HashSet<EdgeKey>, out: &mut Vec<EdgeRecord>) {
        for seg in self.edge_segments_newest_first() {
            for e in seg.segment.find_by_dst(dst) {
                if seen.insert(e.key()) {
                    out.push(e);
                }
            }
        }
    }

    /// Visit the winning record of every edge key not already in `seen`.
    pub fn scan_edges<F>(&self, seen: &mut HashSet<EdgeKey>, mut visit: F)
    where
        F: FnMut(EdgeRecord),
    {
        for seg in self.edge_segments_newest_first() {
            for e in seg.segment.iter() {
                if seen.insert(e.key()) {
                    visit(e);
                }
            }
        }
    }
}

// ── Stats ──────────────────────────────────────────────────────────

/// Per-shard segment statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardStats {
    pub shard_id: u16,
    pub l0_segments: usize,
    pub l1_segments: usize,
    pub node_records: u64,
    pub edge_records: u64,
    pub tombstone_records: u64,
    pub bytes: u64,
}

impl Shard {
    pub fn stats(&self) -> ShardStats {
        let mut stats = ShardStats {
            shard_id: self.id,
            l0_segments: self.l0_segment_count(),
            l1_segments: self.l1_segment_count(),
            ..ShardStats::default()
        };
        for s in self.l0_nodes.iter().chain(self.l1_nodes.iter()) {
            stats.node_records += s.desc.record_count;
            stats.tombstone_records += s.desc.tombstone_count;
            stats.bytes += s.desc.byte_size;
        }
        for s in self.l0_edges.iter().chain(self.l1_edges.iter()) {
            stats.edge_records += s.desc.record_count;
            stats.tombstone_records += s.desc.tombstone_count;
            stats.bytes += s.desc.byte_size;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_v2::index::{build_inverted_indexes, AttrIndex};
    use crate::storage_v2::manifest::ManifestStore;
    use crate::storage_v2::writer::{EdgeSegmentWriter, NodeSegmentWriter};

    /// Builds single-shard manifests from record batches.
    struct Fixture {
        store: ManifestStore,
        nodes: NodeSegmentCache,
        edges: EdgeSegmentCache,
        node_descs: Vec<SegmentDescriptor>,
        edge_descs: Vec<SegmentDescriptor>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: ManifestStore::ephemeral(1),
                nodes: HashMap::new(),
                edges: HashMap::new(),
                node_descs: Vec::new(),
                edge_descs: Vec::new(),
            }
        }

        fn add_nodes(&mut self, records: Vec<NodeRecord>, level: u8) {
            let mut w = NodeSegmentWriter::new();
            w.extend(records);
            let (bytes, meta) = w.finish_to_vec(level).unwrap();
            let id = self.store.next_segment_id();
            self.nodes.insert(id, Arc::new(NodeSegment::from_bytes(bytes).unwrap()));
            self.node_descs.push(SegmentDescriptor::from_meta(id, 0, &meta));
        }

        fn add_indexed_nodes(&mut self, records: Vec<NodeRecord>) {
            let (bytes, meta) =
                NodeSegmentWriter::borrowed_to_vec(records.iter().collect(), LEVEL_L1).unwrap();
            let seg = NodeSegment::from_bytes(bytes).unwrap();
            let built = build_inverted_indexes(&seg).unwrap();
            let index = AttrIndex::from_built(&built, seg.record_count()).unwrap();
            let id = self.store.next_segment_id();
            self.nodes.insert(id, Arc::new(seg.with_attr_index(index)));
            self.node_descs.push(SegmentDescriptor::from_meta(id, 0, &meta));
        }

        fn add_edges(&mut self, records: Vec<EdgeRecord>) {
            let mut w = EdgeSegmentWriter::new();
            w.extend(records);
            let (bytes, meta) = w.finish_to_vec(LEVEL_L0).unwrap();
            let id = self.store.next_segment_id();
            self.edges.insert(id, Arc::new(EdgeSegment::from_bytes(bytes).unwrap()));
            self.edge_descs.push(SegmentDescriptor::from_meta(id, 0, &meta));
        }

        fn shard(&mut self) -> Shard {
            let m = self
                .store
                .create_manifest(self.node_descs.clone(), self.edge_descs.clone(), None, 0)
                .unwrap();
            let m = self.store.commit(m).unwrap();
            Shard::build(0, &m, &self.nodes, &self.edges).unwrap()
        }
    }

    fn node(key: &str, t: &str, file: &str, version: u64) -> NodeRecord {
        let mut n = NodeRecord::new(key, t, key, file);
        n.version = version;
        n
    }

    #[test]
    fn test_newer_l0_wins_over_older_and_l1() {
        let mut fx = Fixture::new();
        fx.add_nodes(vec![node("a", "FUNCTION", "f.js", 1)], LEVEL_L1);
        fx.add_nodes(vec![node("a", "CLASS", "f.js", 2)], LEVEL_L0);
        fx.add_nodes(vec![node("a", "METHOD", "f.js", 3)], LEVEL_L0);
        let shard = fx.shard();
        let got = shard.get_node(node("a", "", "", 0).id).unwrap();
        assert_eq!(got.node_type, "METHOD");
        assert_eq!(shard.l0_segment_count(), 2);
        assert_eq!(shard.l1_segment_count(), 1);
    }

    #[test]
    fn test_tombstone_is_returned_as_winner() {
        let mut fx = Fixture::new();
        let a = node("a", "FUNCTION", "f.js", 1);
        fx.add_nodes(vec![a.clone()], LEVEL_L0);
        fx.add_nodes(vec![a.tombstone(2)], LEVEL_L0);
        let shard = fx.shard();
        assert!(shard.get_node(a.id).unwrap().deleted);

        let mut seen = HashSet::new();
        let mut winners = Vec::new();
        shard.scan_nodes(&mut seen, |n| winners.push(n));
        assert_eq!(winners.len(), 1);
        assert!(winners[0].deleted);
    }

    #[test]
    fn test_candidates_skip_pruned_segments_and_tombstones() {
        let mut fx = Fixture::new();
        fx.add_nodes(
            vec![node("a", "FUNCTION", "a.js", 1), node("b", "CLASS", "b.js", 1)],
            LEVEL_L0,
        );
        fx.add_nodes(vec![node("c", "FUNCTION", "a.js", 2).tombstone(2)], LEVEL_L0);
        let shard = fx.shard();

        let mut out = HashSet::new();
        shard.node_candidates(&AttrQuery::new().node_type("FUNCTION"), &mut out);
        assert_eq!(out.len(), 1);

        let mut files = HashSet::new();
        shard.node_candidates(&AttrQuery::new().file("b.js"), &mut files);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_indexed_candidates_match_full_scan() {
        let records = vec![
            node("a", "http:route", "api.js", 1),
            node("b", "http:request", "client.js", 1),
            node("c", "httpx", "api.js", 1),
            node("d", "FUNCTION", "api.js", 1),
            node("e", "FUNCTION", "util.js", 1).tombstone(2),
        ];
        let mut plain = Fixture::new();
        plain.add_nodes(records.clone(), LEVEL_L1);
        let plain = plain.shard();
        let mut indexed = Fixture::new();
        indexed.add_indexed_nodes(records);
        let indexed = indexed.shard();

        let queries = [
            AttrQuery::new().node_type("http:*"),
            AttrQuery::new().node_type("FUNCTION"),
            AttrQuery::new().node_type("*"),
            AttrQuery::new().file("api.js"),
            AttrQuery::new().file("api.js").node_type("http*"),
            AttrQuery::new().file("util.js"),
            AttrQuery::new().node_type("FUNCTION").name("d"),
            AttrQuery::new().name("b"),
        ];
        for q in &queries {
            let mut want = HashSet::new();
            plain.node_candidates(q, &mut want);
            let mut got = HashSet::new();
            indexed.node_candidates(q, &mut got);
            assert_eq!(got, want, "query {:?}", q);
        }

        let mut http = HashSet::new();
        indexed.node_candidates(&AttrQuery::new().node_type("http:*"), &mut http);
        assert_eq!(http.len(), 2);
    }

    #[test]
    fn test_edges_newest_wins_per_key() {
        let mut fx = Fixture::new();
        fx.add_edges(vec![EdgeRecord::new(1, 2, "CALLS"), EdgeRecord::new(1, 3, "CALLS")]);
        fx.add_edges(vec![EdgeRecord::new(1, 2, "CALLS").tombstone(2)]);
        let shard = fx.shard();

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        shard.edges_from(1, &mut seen, &mut out);
        assert_eq!(out.len(), 2);
        let dead: Vec<_> = out.iter().filter(|e| e.deleted).collect();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dst, 2);

        let mut seen = HashSet::new();
        let mut inc = Vec::new();
        shard.edges_to(3, &mut seen, &mut inc);
        assert_eq!(inc.len(), 1);
    }

    #[test]
    fn test_missing_segment_is_integrity_error() {
        let mut fx = Fixture::new();
        fx.add_nodes(vec![node("a", "T", "f", 1)], LEVEL_L0);
        let m = fx
            .store
            .create_manifest(fx.node_descs.clone(), vec![], None, 0)
            .unwrap();
        let err = Shard::build(0, &m, &HashMap::new(), &HashMap::new()).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_stats() {
        let mut fx = Fixture::new();
        fx.add_nodes(vec![node("a", "T", "f", 1), node("b", "T", "f", 1).tombstone(1)], LEVEL_L0);
        fx.add_edges(vec![EdgeRecord::new(1, 2, "E")]);
        let stats = fx.shard().stats();
        assert_eq!(stats.l0_segments, 2);
        assert_eq!(stats.node_records, 2);
        assert_eq!(stats.edge_records, 1);
        assert_eq!(stats.tombstone_records, 1);
    }
}
