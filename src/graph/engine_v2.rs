//! GraphEngineV2: the multi-shard LSM store behind the GraphStore trait.
//!
//! Adds what the store itself does not do: auto-flush when a commit leaves
//! the write buffer over its limits, and handing flushed work to the
//! background compaction worker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{EngineStats, GraphStore};
use crate::config::{EngineConfig, EngineKind};
use crate::error::Result;
use crate::storage::{AttrQuery, EdgeRecord, NodeRecord};
use crate::storage_v2::compaction::{CompactionResult, CompactionWorker};
use crate::storage_v2::multi_shard::{FlushStats, MultiShardStore};
use crate::storage_v2::types::CommitDelta;

pub struct GraphEngineV2 {
    store: Arc<MultiShardStore>,
    /// Present when background compaction is enabled
    worker: Option<CompactionWorker>,
}

// ── Constructors ────────────────────────────────────────────────────

impl GraphEngineV2 {
    /// Create a new database on disk.
    pub fn create(path: &Path, config: EngineConfig) -> Result<Self> {
        let store = MultiShardStore::create(path, config)?;
        Self::with_store(store, &label(path))
    }

    /// Open an existing database. The shard count comes from its
    /// `db_config.json`, not from `config`.
    pub fn open(path: &Path, config: EngineConfig) -> Result<Self> {
        let store = MultiShardStore::open(path, config)?;
        Self::with_store(store, &label(path))
    }

    /// In-memory engine; nothing touches the disk.
    pub fn ephemeral(config: EngineConfig) -> Result<Self> {
        let store = MultiShardStore::ephemeral(config)?;
        Self::with_store(store, "ephemeral")
    }

    fn with_store(store: MultiShardStore, name: &str) -> Result<Self> {
        let store = Arc::new(store);
        let worker = if store.config().compaction.background {
            Some(CompactionWorker::start(Arc::clone(&store), name)?)
        } else {
            None
        };
        Ok(Self { store, worker })
    }

    pub fn store(&self) -> &MultiShardStore {
        &self.store
    }

    /// Flush when a commit left the buffer over its limits. The commit has
    /// already succeeded, so a failure here is only logged.
    fn maybe_auto_flush(&self) {
        if !self.store.buffer_over_limits() {
            return;
        }
        tracing::debug!("Write buffer over limits, flushing");
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "Auto-flush failed, records stay buffered");
        }
    }
}

fn label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ── GraphStore Implementation ───────────────────────────────────────

impl GraphStore for GraphEngineV2 {
    fn kind(&self) -> EngineKind {
        EngineKind::V2
    }

    fn path(&self) -> Option<&Path> {
        self.store.root()
    }

    fn commit(&self, nodes: Vec<NodeRecord>, edges: Vec<EdgeRecord>, changed_scopes: &[String]) -> Result<CommitDelta> {
        let delta = self.store.commit(nodes, edges, changed_scopes)?;
        self.maybe_auto_flush();
        Ok(delta)
    }

    fn flush(&self) -> Result<FlushStats> {
        let stats = self.store.flush()?;
        if stats.segments_written > 0 {
            if let Some(worker) = &self.worker {
                worker.request();
            }
        }
        Ok(stats)
    }

    fn compact(&self) -> Result<CompactionResult> {
        self.store.compact()
    }

    fn get_node(&self, id: u128) -> Result<Option<NodeRecord>> {
        self.store.get_node(id)
    }

    fn find_by_attr(&self, query: &AttrQuery) -> Result<Vec<NodeRecord>> {
        self.store.find_nodes(query)
    }

    fn get_outgoing_edges(&self, id: u128, edge_types: Option<&[String]>) -> Result<Vec<EdgeRecord>> {
        self.store.get_outgoing_edges(id, edge_types)
    }

    fn get_incoming_edges(&self, id: u128, edge_types: Option<&[String]>) -> Result<Vec<EdgeRecord>> {
        self.store.get_incoming_edges(id, edge_types)
    }

    fn node_count(&self) -> Result<usize> {
        self.store.node_count()
    }

    fn edge_count(&self) -> Result<usize> {
        self.store.edge_count()
    }

    fn count_nodes_by_type(&self, types: Option<&[String]>) -> Result<HashMap<String, usize>> {
        self.store.count_nodes_by_type(types)
    }

    fn count_edges_by_type(&self, edge_types: Option<&[String]>) -> Result<HashMap<String, usize>> {
        self.store.count_edges_by_type(edge_types)
    }

    fn stats(&self) -> EngineStats {
        EngineStats::V2(self.store.stats())
    }

    fn wait_for_compaction(&self) {
        if let Some(worker) = &self.worker {
            worker.wait_idle();
        }
    }

    fn drain_compaction_results(&self) -> Vec<Result<CompactionResult>> {
        self.worker
            .as_ref()
            .map(CompactionWorker::drain_results)
            .unwrap_or_default()
    }
}

// ── Tests ───────────────────────────────────────────────────────────
