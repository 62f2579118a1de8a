//! In-memory write buffer (memtable).
//!
//! Holds the newest record per node id and per edge key. Tombstones are
//! ordinary records with `deleted = true` and shadow older segment data
//! exactly like live records do. Not internally synchronized; the store
//! guards it with its state lock.

use std::collections::{HashMap, HashSet};

use crate::storage::{EdgeKey, EdgeRecord, NodeRecord};

/// Fixed per-record overhead used by `estimated_bytes`.
const NODE_OVERHEAD: usize = 96;
const EDGE_OVERHEAD: usize = 80;

#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    nodes: HashMap<u128, NodeRecord>,
    /// file -> ids of buffered nodes in that file
    by_file: HashMap<String, HashSet<u128>>,

    edges: HashMap<EdgeKey, EdgeRecord>,
    by_src: HashMap<u128, HashSet<EdgeKey>>,
    by_dst: HashMap<u128, HashSet<EdgeKey>>,

    bytes: usize,
}

fn node_size(n: &NodeRecord) -> usize {
    NODE_OVERHEAD + n.semantic_key.len() + n.node_type.len() + n.name.len() + n.file.len() + n.metadata.len()
}

fn edge_size(e: &EdgeRecord) -> usize {
    EDGE_OVERHEAD + e.edge_type.len() + e.metadata.len()
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Write Operations -----------------------------------------------------

    /// Insert or replace the record for `record.id`. Returns the replaced
    /// record, if any.
    pub fn upsert_node(&mut self, record: NodeRecord) -> Option<NodeRecord> {
        self.bytes += node_size(&record);
        self.by_file
            .entry(record.file.clone())
            .or_default()
            .insert(record.id);
        let previous = self.nodes.insert(record.id, record);
        if let Some(ref prev) = previous {
            self.bytes = self.bytes.saturating_sub(node_size(prev));
            let still_there = self
                .nodes
                .get(&prev.id)
                .map_or(false, |cur| cur.file == prev.file);
            if !still_there {
                if let Some(ids) = self.by_file.get_mut(&prev.file) {
                    ids.remove(&prev.id);
                    if ids.is_empty() {
                        self.by_file.remove(&prev.file);
                    }
                }
            }
        }
        previous
    }

    /// Insert or replace the record for the edge key.
    pub fn upsert_edge(&mut self, record: EdgeRecord) -> Option<EdgeRecord> {
        let key = record.key();
        self.bytes += edge_size(&record);
        self.by_src.entry(record.src).or_default().insert(key.clone());
        self.by_dst.entry(record.dst).or_default().insert(key.clone());
        let previous = self.edges.insert(key, record);
        if let Some(ref prev) = previous {
            self.bytes = self.bytes.saturating_sub(edge_size(prev));
        }
        previous
    }

    /// Lay every record of `newer` on top of this buffer.
    pub fn absorb(&mut self, newer: WriteBuffer) {
        for (_, node) in newer.nodes {
            self.upsert_node(node);
        }
        for (_, edge) in newer.edges {
            self.upsert_edge(edge);
        }
    }

    // -- Read Operations ------------------------------------------------------

    pub fn get_node(&self, id: u128) -> Option<&NodeRecord> {
        self.nodes.get(&id)
    }

    pub fn get_edge(&self, key: &EdgeKey) -> Option<&EdgeRecord> {
        self.edges.get(key)
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn iter_edges(&self) -> impl Iterator<Item = &EdgeRecord> {
        self.edges.values()
    }

    /// Buffered node records (tombstones included) whose file is `file`.
    pub fn nodes_in_file<'a>(&'a self, file: &str) -> impl Iterator<Item = &'a NodeRecord> + 'a {
        self.by_file
            .get(file)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(move |id| self.nodes.get(id))
    }

    pub fn edges_from(&self, src: u128) -> Vec<&EdgeRecord> {
        self.edges_via(&self.by_src, src)
    }

    pub fn edges_to(&self, dst: u128) -> Vec<&EdgeRecord> {
        self.edges_via(&self.by_dst, dst)
    }

    fn edges_via(&self, index: &HashMap<u128, HashSet<EdgeKey>>, id: u128) -> Vec<&EdgeRecord> {
        index
            .get(&id)
            .map(|keys| keys.iter().filter_map(|k| self.edges.get(k)).collect())
            .unwrap_or_default()
    }

    // -- Size -----------------------------------------------------------------

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Rough heap footprint of buffered records.
    pub fn estimated_bytes(&self) -> usize {
        self.bytes
    }
}
