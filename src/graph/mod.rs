//! Graph API and the two storage engines behind it

pub mod engine;
pub mod engine_v2;
pub mod id_gen;
pub mod traversal;

pub use engine::GraphEngine;
pub use engine_v2::GraphEngineV2;
pub use id_gen::{compute_node_id, id_to_string, string_id_to_u128};

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::config::EngineKind;
use crate::error::Result;
use crate::storage::{AttrQuery, EdgeRecord, NodeRecord};
use crate::storage_v2::compaction::CompactionResult;
use crate::storage_v2::multi_shard::{FlushStats, StoreStats};
use crate::storage_v2::types::CommitDelta;

/// Engine-specific statistics for `getStats`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum EngineStats {
    V1 {
        #[serde(rename = "lastCommitVersion")]
        last_commit_version: u64,
        #[serde(rename = "snapshotBytes")]
        snapshot_bytes: u64,
        dirty: bool,
    },
    V2(StoreStats),
}

/// Storage contract shared by both engines.
///
/// All methods take `&self`: engines synchronize internally so one
/// instance can serve many sessions. Reads return `Result` because an
/// integrity failure makes every later operation fail.
pub trait GraphStore: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Directory backing the engine. None for ephemeral engines.
    fn path(&self) -> Option<&Path>;

    fn is_ephemeral(&self) -> bool {
        self.path().is_none()
    }

    // === WRITES ===

    /// Replace everything in `changed_scopes` and upsert the batch,
    /// visible to readers as one unit.
    fn commit(&self, nodes: Vec<NodeRecord>, edges: Vec<EdgeRecord>, changed_scopes: &[String]) -> Result<CommitDelta>;

    /// Make every commit so far durable.
    fn flush(&self) -> Result<FlushStats>;

    fn compact(&self) -> Result<CompactionResult>;

    // === NODES ===

    fn get_node(&self, id: u128) -> Result<Option<NodeRecord>>;

    fn node_exists(&self, id: u128) -> Result<bool> {
        Ok(self.get_node(id)?.is_some())
    }

    /// Live nodes matching every populated field of `query`, by id.
    fn find_by_attr(&self, query: &AttrQuery) -> Result<Vec<NodeRecord>>;

    /// Supports a trailing wildcard, e.g. `"http:*"`.
    fn find_by_type(&self, node_type: &str) -> Result<Vec<NodeRecord>> {
        self.find_by_attr(&AttrQuery::new().node_type(node_type))
    }

    // === EDGES ===

    /// `edge_types`: None or empty = all types.
    fn get_outgoing_edges(&self, id: u128, edge_types: Option<&[String]>) -> Result<Vec<EdgeRecord>>;

    fn get_incoming_edges(&self, id: u128, edge_types: Option<&[String]>) -> Result<Vec<EdgeRecord>>;

    /// Distinct targets of outgoing edges.
    fn neighbors(&self, id: u128, edge_types: &[String]) -> Result<Vec<u128>> {
        let mut ids: Vec<u128> = self
            .get_outgoing_edges(id, Some(edge_types))?
            .into_iter()
            .map(|e| e.dst)
            .collect();
        ids.dedup();
        Ok(ids)
    }

    // === TRAVERSAL ===

    fn bfs(&self, start: &[u128], max_depth: usize, edge_types: &[String]) -> Result<Vec<u128>> {
        traversal::bfs(start, max_depth, |id| self.neighbors(id, edge_types))
    }

    // === COUNTS ===

    fn node_count(&self) -> Result<usize>;

    fn edge_count(&self) -> Result<usize>;

    fn count_nodes_by_type(&self, types: Option<&[String]>) -> Result<HashMap<String, usize>>;

    fn count_edges_by_type(&self, edge_types: Option<&[String]>) -> Result<HashMap<String, usize>>;

    fn stats(&self) -> EngineStats;

    // === BACKGROUND WORK ===

    /// Block until requested background compactions have finished.
    fn wait_for_compaction(&self) {}

    /// Outcomes of background compactions since the last call.
    fn drain_compaction_results(&self) -> Vec<Result<CompactionResult>> {
        Vec::new()
    }
}

/// BFS over outgoing edges, or over incoming edges when `backward`.
pub fn reachability(
    store: &dyn GraphStore,
    start: &[u128],
    max_depth: usize,
    edge_types: &[String],
    backward: bool,
) -> Result<Vec<u128>> {
    if backward {
        traversal::bfs(start, max_depth, |id| {
            Ok(store
                .get_incoming_edges(id, Some(edge_types))?
                .into_iter()
                .map(|e| e.src)
                .collect())
        })
    } else {
        store.bfs(start, max_depth, edge_types)
    }
}
