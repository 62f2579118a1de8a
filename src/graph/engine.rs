//! Legacy engine (format v1).
//!
//! Keeps every live record in memory and persists the whole graph as one
//! bincode snapshot (`graph.bin`) on flush. Deletion is physical, so
//! `compact` has nothing to do.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{EngineStats, GraphStore};
use crate::config::{DatabaseConfig, EngineKind};
use crate::error::Result;
use crate::storage::snapshot::GraphSnapshot;
use crate::storage::{edge_type_allowed, type_matches, AttrQuery, EdgeKey, EdgeRecord, NodeRecord};
use crate::storage_v2::compaction::CompactionResult;
use crate::storage_v2::multi_shard::FlushStats;
use crate::storage_v2::types::CommitDelta;

#[derive(Default)]
struct V1State {
    nodes: HashMap<u128, NodeRecord>,
    by_file: HashMap<String, HashSet<u128>>,
    /// Sorted by (src, dst, type) so outgoing scans are range reads
    edges: BTreeMap<EdgeKey, EdgeRecord>,
    incoming: HashMap<u128, HashSet<EdgeKey>>,
    last_version: u64,
    /// Commits since the last snapshot
    dirty: bool,
    snapshot_bytes: u64,
}

impl V1State {
    fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut state = Self {
            last_version: snapshot.last_version,
            ..Default::default()
        };
        for n in snapshot.nodes {
            state.insert_node(n);
        }
        for e in snapshot.edges {
            state.insert_edge(e);
        }
        state
    }

    fn insert_node(&mut self, node: NodeRecord) {
        if let Some(old) = self.nodes.get(&node.id) {
            if old.file != node.file {
                let (id, file) = (old.id, old.file.clone());
                self.unindex_file(&file, id);
            }
        }
        self.by_file.entry(node.file.clone()).or_default().insert(node.id);
        self.nodes.insert(node.id, node);
    }

    fn remove_node(&mut self, id: u128) -> Option<NodeRecord> {
        let node = self.nodes.remove(&id)?;
        self.unindex_file(&node.file, id);
        Some(node)
    }

    fn unindex_file(&mut self, file: &str, id: u128) {
        if let Some(ids) = self.by_file.get_mut(file) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_file.remove(file);
            }
        }
    }

    fn insert_edge(&mut self, edge: EdgeRecord) {
        let key = edge.key();
        self.incoming.entry(edge.dst).or_default().insert(key.clone());
        self.edges.insert(key, edge);
    }

    fn remove_edge(&mut self, key: &EdgeKey) -> Option<EdgeRecord> {
        let edge = self.edges.remove(key)?;
        if let Some(keys) = self.incoming.get_mut(&edge.dst) {
            keys.remove(key);
            if keys.is_empty() {
                self.incoming.remove(&edge.dst);
            }
        }
        Some(edge)
    }

    fn outgoing(&self, src: u128) -> impl Iterator<Item = &EdgeRecord> {
        let lo: EdgeKey = (src, 0, String::new());
        self.edges
            .range(lo..)
            .take_while(move |(k, _)| k.0 == src)
            .map(|(_, e)| e)
    }

    fn incoming(&self, dst: u128) -> Vec<EdgeRecord> {
        let mut edges: Vec<EdgeRecord> = self
            .incoming
            .get(&dst)
            .map(|keys| keys.iter().filter_map(|k| self.edges.get(k)).cloned().collect())
            .unwrap_or_default();
        edges.sort_unstable_by(|a, b| a.key().cmp(&b.key()));
        edges
    }
}

pub struct GraphEngine {
    path: Option<PathBuf>,
    state: RwLock<V1State>,
}

impl GraphEngine {
    pub fn create(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        DatabaseConfig::new(EngineKind::V1, 1).write_to(path)?;
        tracing::info!(path = %path.display(), "Created v1 database");
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: RwLock::new(V1State::default()),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let state = match GraphSnapshot::read_from(path)? {
            Some(snapshot) => {
                let nodes = snapshot.nodes.len();
                let state = V1State::from_snapshot(snapshot);
                tracing::info!(path = %path.display(), nodes, "Opened v1 database");
                state
            }
            None => V1State::default(),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: RwLock::new(state),
        })
    }

    pub fn ephemeral() -> Self {
        Self {
            path: None,
            state: RwLock::new(V1State::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, V1State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, V1State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GraphStore for GraphEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::V1
    }

    fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn commit(&self, nodes: Vec<NodeRecord>, edges: Vec<EdgeRecord>, changed_scopes: &[String]) -> Result<CommitDelta> {
        let mut st = self.write();
        let version = st.last_version + 1;

        let new_ids: HashSet<u128> = nodes.iter().map(|n| n.id).collect();
        let new_keys: HashSet<EdgeKey> = edges.iter().map(EdgeRecord::key).collect();

        let mut removed_ids: HashSet<u128> = HashSet::new();
        for scope in changed_scopes {
            if let Some(ids) = st.by_file.get(scope) {
                removed_ids.extend(ids.iter().copied());
            }
        }
        let removed_edges: Vec<EdgeKey> = removed_ids
            .iter()
            .flat_map(|&id| st.outgoing(id).map(EdgeRecord::key).collect::<Vec<_>>())
            .collect();

        let mut delta = CommitDelta {
            version,
            changed_scopes: changed_scopes.to_vec(),
            ..Default::default()
        };
        for id in &new_ids {
            if st.nodes.contains_key(id) {
                delta.nodes_modified += 1;
            } else {
                delta.nodes_added += 1;
            }
        }
        delta.nodes_removed = removed_ids.iter().filter(|id| !new_ids.contains(id)).count() as u64;
        delta.edges_added = new_keys.iter().filter(|k| !st.edges.contains_key(*k)).count() as u64;
        delta.edges_removed = removed_edges.iter().filter(|k| !new_keys.contains(*k)).count() as u64;

        for key in &removed_edges {
            st.remove_edge(key);
        }
        for id in &removed_ids {
            st.remove_node(*id);
        }
        for mut n in nodes {
            n.version = version;
            n.deleted = false;
            st.insert_node(n);
        }
        for mut e in edges {
            e.version = version;
            e.deleted = false;
            st.insert_edge(e);
        }
        st.last_version = version;
        st.dirty = true;
        Ok(delta)
    }

    fn flush(&self) -> Result<FlushStats> {
        let Some(path) = &self.path else {
            return Ok(FlushStats::default());
        };
        // Writers wait for the snapshot; readers do not.
        let snapshot = {
            let st = self.read();
            if !st.dirty {
                return Ok(FlushStats::default());
            }
            let mut edges: Vec<EdgeRecord> = st.edges.values().cloned().collect();
            edges.sort_unstable_by(|a, b| a.key().cmp(&b.key()));
            let mut nodes: Vec<NodeRecord> = st.nodes.values().cloned().collect();
            nodes.sort_unstable_by_key(|n| n.id);
            GraphSnapshot::new(st.last_version, nodes, edges)
        };
        let bytes = snapshot.write_to(path)?;
        let mut st = self.write();
        if st.last_version == snapshot.last_version {
            st.dirty = false;
        }
        st.snapshot_bytes = bytes;
        tracing::debug!(nodes = snapshot.nodes.len(), edges = snapshot.edges.len(), bytes, "Wrote v1 snapshot");
        Ok(FlushStats {
            nodes_written: snapshot.nodes.len() as u64,
            edges_written: snapshot.edges.len() as u64,
            segments_written: 1,
            manifest_version: snapshot.last_version,
        })
    }

    fn compact(&self) -> Result<CompactionResult> {
        Ok(CompactionResult::default())
    }

    fn get_node(&self, id: u128) -> Result<Option<NodeRecord>> {
        Ok(self.read().nodes.get(&id).cloned())
    }

    fn find_by_attr(&self, query: &AttrQuery) -> Result<Vec<NodeRecord>> {
        let st = self.read();
        let mut out: Vec<NodeRecord> = match &query.file {
            Some(file) => st
                .by_file
                .get(file)
                .into_iter()
                .flatten()
                .filter_map(|id| st.nodes.get(id))
                .filter(|n| query.matches(n))
                .cloned()
                .collect(),
            None => st.nodes.values().filter(|n| query.matches(n)).cloned().collect(),
        };
        out.sort_unstable_by_key(|n| n.id);
        Ok(out)
    }

    fn get_outgoing_edges(&self, id: u128, edge_types: Option<&[String]>) -> Result<Vec<EdgeRecord>> {
        Ok(self
            .read()
            .outgoing(id)
            .filter(|e| edge_type_allowed(edge_types, &e.edge_type))
            .cloned()
            .collect())
    }

    fn get_incoming_edges(&self, id: u128, edge_types: Option<&[String]>) -> Result<Vec<EdgeRecord>> {
        let mut edges = self.read().incoming(id);
        edges.retain(|e| edge_type_allowed(edge_types, &e.edge_type));
        Ok(edges)
    }

    fn node_count(&self) -> Result<usize> {
        Ok(self.read().nodes.len())
    }

    fn edge_count(&self) -> Result<usize> {
        Ok(self.read().edges.len())
    }

    fn count_nodes_by_type(&self, types: Option<&[String]>) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for n in self.read().nodes.values() {
            if accepts(types, &n.node_type) {
                *counts.entry(n.node_type.clone()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    fn count_edges_by_type(&self, edge_types: Option<&[String]>) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for e in self.read().edges.values() {
            if accepts(edge_types, &e.edge_type) {
                *counts.entry(e.edge_type.clone()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    fn stats(&self) -> EngineStats {
        let st = self.read();
        EngineStats::V1 {
            last_commit_version: st.last_version,
            snapshot_bytes: st.snapshot_bytes,
            dirty: st.dirty,
        }
    }
}

fn accepts(filter: Option<&[String]>, actual: &str) -> bool {
    match filter {
        None | Some([]) => true,
        Some(patterns) => patterns.iter().any(|p| type_matches(p, actual)),
    }
}
