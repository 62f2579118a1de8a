//! Multi-shard LSM store.
//!
//! Composes the write buffer, the per-shard segment levels and the
//! manifest behind one write/read interface:
//!
//! - **Nodes** live in the shard owning their id range (`ShardPlanner`).
//! - **Edges** live in the shard owning their `src`.
//! - **Reads** resolve newest-wins across the active buffer, the buffer
//!   being flushed, then each shard's L0 (newest first) and L1.
//!
//! # Storage Layout
//!
//! ```text
//! <name>.factdb/
//! +-- db_config.json          # DatabaseConfig (shard_count, engine)
//! +-- current.json            # Manifest pointer
//! +-- manifests/
//! +-- segments/
//! |   +-- 00/                 # Shard 0
//! |   |   +-- seg_000001_nodes.seg
//! |   |   +-- seg_000002_edges.seg
//! |   +-- 01/
//! ```
//!
//! # Concurrency
//!
//! The store is `Send + Sync` and internally synchronized:
//!
//! - `state` (RwLock) holds the active buffer, the frozen buffer and the
//!   current `StoreSnapshot`. Commits take the write lock only to apply an
//!   already computed batch; flush and compaction take it only to swap the
//!   snapshot pointer.
//! - `commits` serializes commits and carries the last assigned version.
//! - `manifest` serializes manifest commits and snapshot installs.
//! - `flushes` serializes flushes; `compaction_locks` allow one compactor
//!   per shard.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;

use crate::config::{DatabaseConfig, EngineConfig, EngineKind};
use crate::error::{GraphError, Result};
use crate::storage::{type_matches, AttrQuery, EdgeKey, EdgeRecord, NodeRecord};
use crate::storage_v2::compaction::coordinator::{compact_shard, should_compact};
use crate::storage_v2::compaction::{CompactionInfo, CompactionResult};
use crate::storage_v2::index::{build_inverted_indexes, sidecar_path, AttrIndex};
use crate::storage_v2::manifest::{
    now_ms, segment_relative_path, write_atomic, Manifest, ManifestStats, ManifestStore,
    SegmentDescriptor,
};
use crate::storage_v2::segment::{EdgeSegment, NodeSegment};
use crate::storage_v2::shard::{EdgeSegmentCache, NodeSegmentCache, Shard, ShardStats};
use crate::storage_v2::shard_planner::ShardPlanner;
use crate::storage_v2::types::{CommitDelta, SegmentMeta, SegmentType, LEVEL_L0, LEVEL_L1};
use crate::storage_v2::write_buffer::WriteBuffer;
use crate::storage_v2::writer::{EdgeSegmentWriter, NodeSegmentWriter};

// ── Snapshot ───────────────────────────────────────────────────────

/// Immutable view of the committed segments: a manifest handle plus the
/// opened segments it references, arranged per shard.
#[derive(Debug)]
pub struct StoreSnapshot {
    manifest: Arc<Manifest>,
    shards: Vec<Shard>,
    nodes: NodeSegmentCache,
    edges: EdgeSegmentCache,
}

impl StoreSnapshot {
    fn build(manifest: Arc<Manifest>, mut nodes: NodeSegmentCache, mut edges: EdgeSegmentCache) -> Result<Self> {
        let live: HashSet<u64> = manifest.all_segments().map(|d| d.segment_id).collect();
        nodes.retain(|id, _| live.contains(id));
        edges.retain(|id, _| live.contains(id));
        let shards = (0..manifest.shard_count)
            .map(|s| Shard::build(s, &manifest, &nodes, &edges))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            manifest,
            shards,
            nodes,
            edges,
        })
    }

    /// Successor snapshot: reuse every segment already open here and add
    /// the freshly written ones.
    fn successor(&self, manifest: Arc<Manifest>, fresh: &NewSegments) -> Result<Self> {
        let mut nodes = self.nodes.clone();
        let mut edges = self.edges.clone();
        for (id, seg) in &fresh.nodes {
            nodes.insert(*id, Arc::clone(seg));
        }
        for (id, seg) in &fresh.edges {
            edges.insert(*id, Arc::clone(seg));
        }
        Self::build(manifest, nodes, edges)
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }
}

/// Segments written by a flush or compaction, not yet in a manifest.
#[derive(Default)]
struct NewSegments {
    node_descs: Vec<SegmentDescriptor>,
    edge_descs: Vec<SegmentDescriptor>,
    nodes: Vec<(u64, Arc<NodeSegment>)>,
    edges: Vec<(u64, Arc<EdgeSegment>)>,
    files: Vec<PathBuf>,
}

impl NewSegments {
    fn is_empty(&self) -> bool {
        self.node_descs.is_empty() && self.edge_descs.is_empty()
    }

    /// Remove files of segments that never made it into a manifest.
    fn discard(&self) {
        for path in &self.files {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove abandoned segment");
            }
        }
    }
}

/// Attach the sidecar index of an L1 node segment, rebuilding (and
/// rewriting) it when the sidecar is missing or does not match.
fn load_attr_index(seg: NodeSegment, seg_path: &Path) -> Result<NodeSegment> {
    let idx_path = sidecar_path(seg_path);
    let loaded = match fs::read(&idx_path) {
        Ok(bytes) => match AttrIndex::from_sidecar(&bytes, seg.record_count()) {
            Ok(index) => Some(index),
            Err(e) => {
                tracing::warn!(path = %idx_path.display(), error = %e, "Discarding unreadable index");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let index = match loaded {
        Some(index) => index,
        None => {
            let built = build_inverted_indexes(&seg)?;
            if let Err(e) = write_atomic(&idx_path, &built.to_sidecar_bytes()) {
                tracing::warn!(path = %idx_path.display(), error = %e, "Failed to rewrite index");
            } else {
                tracing::info!(path = %idx_path.display(), "Rebuilt segment index");
            }
            AttrIndex::from_built(&built, seg.record_count())?
        }
    };
    Ok(seg.with_attr_index(index))
}

// ── Store State ────────────────────────────────────────────────────

struct StoreState {
    active: WriteBuffer,
    /// Buffer being serialized by an in-flight flush
    frozen: Option<Arc<WriteBuffer>>,
    snapshot: Arc<StoreSnapshot>,
}

impl StoreState {
    fn buffers(&self) -> impl Iterator<Item = &WriteBuffer> {
        std::iter::once(&self.active).chain(self.frozen.as_deref())
    }

    /// Newest record for `id`, tombstones included.
    fn resolve_node(&self, planner: &ShardPlanner, id: u128) -> Option<NodeRecord> {
        for buf in self.buffers() {
            if let Some(n) = buf.get_node(id) {
                return Some(n.clone());
            }
        }
        self.snapshot.shards[planner.shard_for_id(id) as usize].get_node(id)
    }

    fn live_node(&self, planner: &ShardPlanner, id: u128) -> Option<NodeRecord> {
        self.resolve_node(planner, id).filter(|n| !n.deleted)
    }

    /// Live nodes matching `query`, sorted by id.
    ///
    /// Candidates come from buffers and zone-map-pruned segment scans;
    /// each is re-resolved so a newer version that the pruning skipped
    /// still shadows an older match.
    fn find_nodes(&self, planner: &ShardPlanner, query: &AttrQuery) -> Vec<NodeRecord> {
        let mut candidates: HashSet<u128> = HashSet::new();
        for buf in self.buffers() {
            let matching = |n: &&NodeRecord| !n.deleted && query.matches(n);
            match query.file {
                Some(ref f) => candidates.extend(buf.nodes_in_file(f).filter(matching).map(|n| n.id)),
                None => candidates.extend(buf.iter_nodes().filter(matching).map(|n| n.id)),
            }
        }
        for shard in &self.snapshot.shards {
            shard.node_candidates(query, &mut candidates);
        }
        let mut out: Vec<NodeRecord> = candidates
            .into_iter()
            .filter_map(|id| self.live_node(planner, id))
            .filter(|n| query.matches(n))
            .collect();
        out.sort_unstable_by_key(|n| n.id);
        out
    }

    /// Live outgoing edges of `src`, sorted by key.
    fn outgoing(&self, planner: &ShardPlanner, src: u128) -> Vec<EdgeRecord> {
        let mut seen: HashSet<EdgeKey> = HashSet::new();
        let mut winners = Vec::new();
        for buf in self.buffers() {
            for e in buf.edges_from(src) {
                if seen.insert(e.key()) {
                    winners.push(e.clone());
                }
            }
        }
        self.snapshot.shards[planner.shard_for_id(src) as usize].edges_from(src, &mut seen, &mut winners);
        finish_edges(winners)
    }

    /// Live incoming edges of `dst`, sorted by key.
    fn incoming(&self, dst: u128) -> Vec<EdgeRecord> {
        let mut seen: HashSet<EdgeKey> = HashSet::new();
        let mut winners = Vec::new();
        for buf in self.buffers() {
            for e in buf.edges_to(dst) {
                if seen.insert(e.key()) {
                    winners.push(e.clone());
                }
            }
        }
        for shard in &self.snapshot.shards {
            shard.edges_to(dst, &mut seen, &mut winners);
        }
        finish_edges(winners)
    }

    /// Visit every live node once.
    fn scan_live_nodes<F: FnMut(&NodeRecord)>(&self, mut visit: F) {
        let mut seen: HashSet<u128> = HashSet::new();
        for buf in self.buffers() {
            for n in buf.iter_nodes() {
                if seen.insert(n.id) && !n.deleted {
                    visit(n);
                }
            }
        }
        for shard in &self.snapshot.shards {
            shard.scan_nodes(&mut seen, |n| {
                if !n.deleted {
                    visit(&n);
                }
            });
        }
    }

    /// Visit every live edge once.
    fn scan_live_edges<F: FnMut(&EdgeRecord)>(&self, mut visit: F) {
        let mut seen: HashSet<EdgeKey> = HashSet::new();
        for buf in self.buffers() {
            for e in buf.iter_edges() {
                if seen.insert(e.key()) && !e.deleted {
                    visit(e);
                }
            }
        }
        for shard in &self.snapshot.shards {
            shard.scan_edges(&mut seen, |e| {
                if !e.deleted {
                    visit(&e);
                }
            });
        }
    }
}

fn finish_edges(mut winners: Vec<EdgeRecord>) -> Vec<EdgeRecord> {
    winners.retain(|e| !e.deleted);
    winners.sort_unstable_by(|a, b| (a.src, a.dst, &a.edge_type).cmp(&(b.src, b.dst, &b.edge_type)));
    winners
}

// ── Stats ──────────────────────────────────────────────────────────

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushStats {
    pub nodes_written: u64,
    pub edges_written: u64,
    pub segments_written: u64,
    /// Manifest version committed by the flush (0 when nothing to flush)
    pub manifest_version: u64,
}

/// Store-wide statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub shard_count: u16,
    pub last_commit_version: u64,
    pub buffered_nodes: usize,
    pub buffered_edges: usize,
    pub buffered_bytes: usize,
    pub flush_in_progress: bool,
    pub manifest: ManifestStats,
    pub shards: Vec<ShardStats>,
    pub unusable: Option<String>,
}

// ── Multi-Shard Store ──────────────────────────────────────────────

pub struct MultiShardStore {
    /// Database root. None for ephemeral stores.
    root: Option<PathBuf>,
    planner: ShardPlanner,
    config: EngineConfig,

    state: RwLock<StoreState>,
    /// Last assigned commit version
    commits: Mutex<u64>,
    manifest: Mutex<ManifestStore>,
    flushes: Mutex<()>,
    compaction_locks: Vec<Mutex<()>>,
    compaction_pool: Option<rayon::ThreadPool>,

    /// Set by the first integrity error; the store refuses work afterwards.
    unusable: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Constructors ───────────────────────────────────────────────────

impl MultiShardStore {
    /// Create a new database directory at `db_path`.
    pub fn create(db_path: &Path, config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(db_path)?;
        let shard_count = config.shard_count.max(1);
        DatabaseConfig::new(EngineKind::V2, shard_count).write_to(db_path)?;
        let manifest = ManifestStore::create(db_path, shard_count)?.with_retention(config.manifest_retention);
        tracing::info!(path = %db_path.display(), shards = shard_count, "Created database");
        Self::assemble(Some(db_path.to_path_buf()), manifest, HashMap::new(), HashMap::new(), config)
    }

    /// Open an existing database. Unreferenced segment files are removed
    /// and every live segment is opened and validated.
    pub fn open(db_path: &Path, config: EngineConfig) -> Result<Self> {
        let db_config = DatabaseConfig::read_from(db_path)?.ok_or_else(|| {
            GraphError::Manifest(format!("{} has no db_config.json", db_path.display()))
        })?;
        let manifest = ManifestStore::open(db_path)?.with_retention(config.manifest_retention);
        let current = manifest.current();
        if current.shard_count != db_config.shard_count {
            return Err(GraphError::Manifest(format!(
                "manifest v{} has {} shards, db_config.json says {}",
                current.version, current.shard_count, db_config.shard_count
            )));
        }

        let orphans = manifest.remove_orphan_segments()?;
        if orphans > 0 {
            tracing::warn!(path = %db_path.display(), orphans, "Removed orphan segment files");
        }

        let mut nodes = HashMap::new();
        for d in &current.node_segments {
            let path = d.file_path(db_path);
            let mut seg = NodeSegment::open(&path)?;
            if d.level == LEVEL_L1 {
                seg = load_attr_index(seg, &path)?;
            }
            nodes.insert(d.segment_id, Arc::new(seg));
        }
        let mut edges = HashMap::new();
        for d in &current.edge_segments {
            edges.insert(d.segment_id, Arc::new(EdgeSegment::open(&d.file_path(db_path))?));
        }

        tracing::info!(
            path = %db_path.display(),
            manifest = current.version,
            segments = nodes.len() + edges.len(),
            "Opened database"
        );
        let config = config.with_shard_count(db_config.shard_count);
        Self::assemble(Some(db_path.to_path_buf()), manifest, nodes, edges, config)
    }

    pub fn open_or_create(db_path: &Path, config: EngineConfig) -> Result<Self> {
        if db_path.join(crate::config::DB_CONFIG_FILE).exists() {
            Self::open(db_path, config)
        } else {
            Self::create(db_path, config)
        }
    }

    /// In-memory store; flushed segments are kept as owned buffers.
    pub fn ephemeral(config: EngineConfig) -> Result<Self> {
        let manifest = ManifestStore::ephemeral(config.shard_count.max(1));
        Self::assemble(None, manifest, HashMap::new(), HashMap::new(), config)
    }

    fn assemble(
        root: Option<PathBuf>,
        manifest: ManifestStore,
        nodes: NodeSegmentCache,
        edges: EdgeSegmentCache,
        config: EngineConfig,
    ) -> Result<Self> {
        let current = manifest.current();
        let shard_count = current.shard_count;
        let last_version = current.last_commit_version;
        let snapshot = StoreSnapshot::build(current, nodes, edges)?;

        let compaction_pool = match config.compaction.threads {
            0 => None,
            n => match rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .thread_name(|i| format!("factdb-compact-{}", i))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!(error = %e, "Compaction pool unavailable, using global pool");
                    None
                }
            },
        };

        Ok(Self {
            root,
            planner: ShardPlanner::new(shard_count),
            config,
            state: RwLock::new(StoreState {
                active: WriteBuffer::new(),
                frozen: None,
                snapshot: Arc::new(snapshot),
            }),
            commits: Mutex::new(last_version),
            manifest: Mutex::new(manifest),
            flushes: Mutex::new(()),
            compaction_locks: (0..shard_count).map(|_| Mutex::new(())).collect(),
            compaction_pool,
            unusable: Mutex::new(None),
        })
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.root.is_none()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shard_count(&self) -> u16 {
        self.planner.shard_count()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current committed snapshot. Later flushes and compactions do not
    /// affect a handle already taken.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.read_state().snapshot)
    }
}

// ── Integrity ──────────────────────────────────────────────────────

impl MultiShardStore {
    /// Fail fast once an integrity error has been seen.
    pub fn check_usable(&self) -> Result<()> {
        match lock(&self.unusable).as_ref() {
            Some(reason) => Err(GraphError::DatabaseUnusable(reason.clone())),
            None => Ok(()),
        }
    }

    /// Record `err` if it is an integrity error, then hand it back.
    pub(crate) fn note_error(&self, err: GraphError) -> GraphError {
        if err.is_integrity() {
            let mut unusable = lock(&self.unusable);
            if unusable.is_none() {
                tracing::error!(
                    root = ?self.root,
                    error = %err,
                    "Integrity failure, database marked unusable"
                );
                *unusable = Some(err.to_string());
            }
        }
        err
    }
}

// ── Batch Commit ───────────────────────────────────────────────────

impl MultiShardStore {
    /// Atomically replace the contents of `changed_scopes` and upsert the
    /// batch.
    ///
    /// 1. Under the read lock, collect the live nodes whose `file` is one
    ///    of the changed scopes, and the live edges leaving them.
    /// 2. Under the write lock, write tombstones for all of them and then
    ///    the new records, all stamped with the commit's version.
    ///
    /// Readers take the same lock, so they see either none or all of it.
    pub fn commit(
        &self,
        nodes: Vec<NodeRecord>,
        edges: Vec<EdgeRecord>,
        changed_scopes: &[String],
    ) -> Result<CommitDelta> {
        let mut last_version = lock(&self.commits);
        self.check_usable()?;
        let version = *last_version + 1;

        // ── Phase 1: resolve what the batch replaces ──
        let new_ids: HashSet<u128> = nodes.iter().map(|n| n.id).collect();
        let new_edge_keys: HashSet<EdgeKey> = edges.iter().map(|e| e.key()).collect();
        let (old_nodes, old_edges, live_new_ids, live_new_edges) = {
            let st = self.read_state();
            let mut old_nodes: HashMap<u128, NodeRecord> = HashMap::new();
            for scope in changed_scopes {
                for n in st.find_nodes(&self.planner, &AttrQuery::new().file(scope.as_str())) {
                    old_nodes.insert(n.id, n);
                }
            }
            let mut old_edges: Vec<EdgeRecord> = Vec::new();
            for id in old_nodes.keys() {
                old_edges.extend(st.outgoing(&self.planner, *id));
            }
            let live_new_ids: HashSet<u128> = new_ids
                .iter()
                .copied()
                .filter(|id| old_nodes.contains_key(id) || st.live_node(&self.planner, *id).is_some())
                .collect();
            let old_edge_keys: HashSet<EdgeKey> = old_edges.iter().map(|e| e.key()).collect();
            let srcs: HashSet<u128> = edges.iter().map(|e| e.src).collect();
            let mut live_new_edges: HashSet<EdgeKey> = HashSet::new();
            for src in srcs {
                for e in st.outgoing(&self.planner, src) {
                    let key = e.key();
                    if new_edge_keys.contains(&key) || old_edge_keys.contains(&key) {
                        live_new_edges.insert(key);
                    }
                }
            }
            (old_nodes, old_edges, live_new_ids, live_new_edges)
        };

        let delta = CommitDelta {
            version,
            changed_scopes: changed_scopes.to_vec(),
            nodes_added: new_ids.iter().filter(|id| !live_new_ids.contains(id)).count() as u64,
            nodes_removed: old_nodes.keys().filter(|id| !new_ids.contains(id)).count() as u64,
            nodes_modified: live_new_ids.len() as u64,
            edges_added: new_edge_keys
                .iter()
                .filter(|k| !live_new_edges.contains(*k))
                .count() as u64,
            edges_removed: old_edges
                .iter()
                .filter(|e| !new_edge_keys.contains(&e.key()))
                .count() as u64,
        };

        // ── Phase 2: apply atomically ──
        {
            let mut st = self.write_state();
            for n in old_nodes.values() {
                st.active.upsert_node(n.tombstone(version));
            }
            for e in &old_edges {
                st.active.upsert_edge(e.tombstone(version));
            }
            for mut n in nodes {
                n.version = version;
                n.deleted = false;
                st.active.upsert_node(n);
            }
            for mut e in edges {
                e.version = version;
                e.deleted = false;
                st.active.upsert_edge(e);
            }
        }
        *last_version = version;

        tracing::debug!(
            version,
            scopes = changed_scopes.len(),
            added = delta.nodes_added,
            removed = delta.nodes_removed,
            "Committed batch"
        );
        Ok(delta)
    }

    /// Last assigned commit version.
    pub fn last_commit_version(&self) -> u64 {
        *lock(&self.commits)
    }

    /// True when the active buffer has outgrown a configured limit.
    pub fn buffer_over_limits(&self) -> bool {
        let st = self.read_state();
        st.active.node_count() > self.config.write_buffer_node_limit
            || st.active.edge_count() > self.config.write_buffer_edge_limit
            || st.active.estimated_bytes() > self.config.write_buffer_byte_limit
    }
}

// ── Flush ──────────────────────────────────────────────────────────

impl MultiShardStore {
    /// Serialize the write buffer into new L0 segments and commit them.
    ///
    /// The buffer is frozen under the write lock and stays readable while
    /// its segments are written. On failure the frozen records are put
    /// back under any newer commits and no segment becomes visible.
    pub fn flush(&self) -> Result<FlushStats> {
        let _flush = lock(&self.flushes);
        self.check_usable()?;

        let frozen = {
            let mut st = self.write_state();
            if st.active.is_empty() {
                return Ok(FlushStats::default());
            }
            let buf = Arc::new(std::mem::take(&mut st.active));
            st.frozen = Some(Arc::clone(&buf));
            buf
        };

        let started = Instant::now();
        match self.write_frozen(&frozen) {
            Ok(stats) => {
                tracing::debug!(
                    nodes = stats.nodes_written,
                    edges = stats.edges_written,
                    segments = stats.segments_written,
                    manifest = stats.manifest_version,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Flushed write buffer"
                );
                Ok(stats)
            }
            Err(e) => {
                {
                    let mut st = self.write_state();
                    st.frozen = None;
                    let newer = std::mem::take(&mut st.active);
                    let mut restored = Arc::try_unwrap(frozen).unwrap_or_else(|shared| (*shared).clone());
                    restored.absorb(newer);
                    st.active = restored;
                }
                tracing::warn!(error = %e, "Flush failed, write buffer restored");
                Err(self.note_error(e))
            }
        }
    }

    fn write_frozen(&self, frozen: &WriteBuffer) -> Result<FlushStats> {
        let last_version = frozen
            .iter_nodes()
            .map(|n| n.version)
            .chain(frozen.iter_edges().map(|e| e.version))
            .max()
            .unwrap_or(0);
        // The frozen buffer stays intact for a retry if anything below fails.
        let node_groups = self.planner.plan_nodes(frozen.iter_nodes());
        let edge_groups = self.planner.plan_edges(frozen.iter_edges());
        let node_count = node_groups.iter().map(Vec::len).sum::<usize>() as u64;
        let edge_count = edge_groups.iter().map(Vec::len).sum::<usize>() as u64;

        // Serialize every shard in parallel, outside all locks.
        let node_bytes: Vec<Option<(Vec<u8>, SegmentMeta)>> = node_groups
            .into_par_iter()
            .map(|group| {
                if group.is_empty() {
                    return Ok(None);
                }
                NodeSegmentWriter::borrowed_to_vec(group, LEVEL_L0).map(Some)
            })
            .collect::<Result<_>>()?;
        let edge_bytes: Vec<Option<(Vec<u8>, SegmentMeta)>> = edge_groups
            .into_par_iter()
            .map(|group| {
                if group.is_empty() {
                    return Ok(None);
                }
                EdgeSegmentWriter::borrowed_to_vec(group, LEVEL_L0).map(Some)
            })
            .collect::<Result<_>>()?;

        let mut fresh = NewSegments::default();
        let written = (|| -> Result<()> {
            for (shard, out) in node_bytes.into_iter().enumerate() {
                if let Some((bytes, meta)) = out {
                    let id = self.reserve_segment_id();
                    self.materialize(shard as u16, id, SegmentType::Nodes, bytes, &meta, &mut fresh)?;
                }
            }
            for (shard, out) in edge_bytes.into_iter().enumerate() {
                if let Some((bytes, meta)) = out {
                    let id = self.reserve_segment_id();
                    self.materialize(shard as u16, id, SegmentType::Edges, bytes, &meta, &mut fresh)?;
                }
            }
            Ok(())
        })();
        if let Err(e) = written {
            fresh.discard();
            return Err(e);
        }

        let segments_written = (fresh.node_descs.len() + fresh.edge_descs.len()) as u64;
        let manifest_version = match self.publish(&fresh, None, &HashSet::new(), last_version, true) {
            Ok(v) => v,
            Err(e) => {
                fresh.discard();
                return Err(e);
            }
        };

        Ok(FlushStats {
            nodes_written: node_count,
            edges_written: edge_count,
            segments_written,
            manifest_version,
        })
    }

    fn reserve_segment_id(&self) -> u64 {
        lock(&self.manifest).next_segment_id()
    }

    /// Persist (or keep in memory) one serialized segment and open it.
    fn materialize(
        &self,
        shard: u16,
        segment_id: u64,
        seg_type: SegmentType,
        bytes: Vec<u8>,
        meta: &SegmentMeta,
        out: &mut NewSegments,
    ) -> Result<()> {
        let desc = SegmentDescriptor::from_meta(segment_id, shard, meta);
        let path = match &self.root {
            Some(root) => {
                let path = root.join(segment_relative_path(shard, segment_id, seg_type));
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                write_atomic(&path, &bytes)?;
                out.files.push(path.clone());
                Some(path)
            }
            None => None,
        };
        match seg_type {
            SegmentType::Nodes => {
                let mut seg = match &path {
                    Some(p) => NodeSegment::open(p)?,
                    None => NodeSegment::from_bytes(bytes)?,
                };
                if meta.level == LEVEL_L1 {
                    let built = build_inverted_indexes(&seg)?;
                    if let Some(p) = &path {
                        let idx_path = sidecar_path(p);
                        write_atomic(&idx_path, &built.to_sidecar_bytes())?;
                        out.files.push(idx_path);
                    }
                    let index = AttrIndex::from_built(&built, seg.record_count())?;
                    seg = seg.with_attr_index(index);
                }
                out.nodes.push((segment_id, Arc::new(seg)));
                out.node_descs.push(desc);
            }
            SegmentType::Edges => {
                let seg = match &path {
                    Some(p) => EdgeSegment::open(p)?,
                    None => EdgeSegment::from_bytes(bytes)?,
                };
                out.edges.push((segment_id, Arc::new(seg)));
                out.edge_descs.push(desc);
            }
        }
        Ok(())
    }

    /// Commit a manifest that drops `consumed` and adds `fresh`, then
    /// install the matching snapshot. Returns the new manifest version.
    ///
    /// The manifest lock is held across commit and install so snapshots
    /// are installed in manifest order.
    fn publish(
        &self,
        fresh: &NewSegments,
        compaction: Option<u32>,
        consumed: &HashSet<u64>,
        last_commit_version: u64,
        clear_frozen: bool,
    ) -> Result<u64> {
        let mut manifest_store = lock(&self.manifest);
        let current = manifest_store.current();

        let present: HashSet<u64> = current.all_segments().map(|d| d.segment_id).collect();
        if let Some(missing) = consumed.iter().find(|id| !present.contains(id)) {
            return Err(GraphError::Compaction(format!(
                "segment {} was removed from the manifest during compaction",
                missing
            )));
        }

        let keep = |d: &&SegmentDescriptor| !consumed.contains(&d.segment_id);
        let mut node_segments: Vec<SegmentDescriptor> = current.node_segments.iter().filter(keep).cloned().collect();
        let mut edge_segments: Vec<SegmentDescriptor> = current.edge_segments.iter().filter(keep).cloned().collect();
        node_segments.extend(fresh.node_descs.iter().cloned());
        edge_segments.extend(fresh.edge_descs.iter().cloned());

        let info = compaction.map(|merged| CompactionInfo {
            manifest_version: current.version + 1,
            timestamp_ms: now_ms(),
            l0_segments_merged: merged,
        });
        let manifest = Arc::new(manifest_store.create_manifest(
            node_segments,
            edge_segments,
            info,
            last_commit_version,
        )?);

        // Open the successor before the manifest becomes durable: if it fails,
        // nothing on disk references the fresh segments yet.
        let snapshot = Arc::new(self.snapshot().successor(Arc::clone(&manifest), fresh)?);
        let committed = manifest_store.commit(manifest)?;
        {
            let mut st = self.write_state();
            st.snapshot = snapshot;
            if clear_frozen {
                st.frozen = None;
            }
        }
        Ok(committed.version)
    }
}

// ── Compaction ─────────────────────────────────────────────────────

struct ShardOutcome {
    shard_id: u16,
    nodes: u64,
    edges: u64,
    tombstones: u64,
    segments_merged: u64,
    segments_written: u64,
}

impl MultiShardStore {
    /// True when some shard has reached the L0 threshold.
    pub fn needs_compaction(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.shards.iter().any(|s| should_compact(s, &self.config.compaction))
    }

    /// Compact every shard that has L0 segments, waiting for any running
    /// compaction of the same shard.
    pub fn compact(&self) -> Result<CompactionResult> {
        self.run_compaction(true)
    }

    /// Compact only shards over the threshold, skipping shards another
    /// compactor is working on.
    pub fn compact_due(&self) -> Result<CompactionResult> {
        self.run_compaction(false)
    }

    fn run_compaction(&self, explicit: bool) -> Result<CompactionResult> {
        self.check_usable()?;
        let started = Instant::now();
        let snapshot = self.snapshot();
        let targets: Vec<u16> = snapshot
            .shards
            .iter()
            .filter(|s| {
                if explicit {
                    s.l0_segment_count() > 0
                } else {
                    should_compact(s, &self.config.compaction)
                }
            })
            .map(|s| s.id())
            .collect();
        drop(snapshot);

        let run = || -> Vec<Result<Option<ShardOutcome>>> {
            targets.par_iter().map(|&id| self.compact_one(id, explicit)).collect()
        };
        let outcomes = match &self.compaction_pool {
            Some(pool) => pool.install(run),
            None => run(),
        };

        let mut result = CompactionResult::default();
        for outcome in outcomes {
            match outcome {
                Ok(Some(o)) => {
                    result.shards_compacted.push(o.shard_id);
                    result.nodes_merged += o.nodes;
                    result.edges_merged += o.edges;
                    result.tombstones_removed += o.tombstones;
                    result.segments_merged += o.segments_merged;
                    result.segments_written += o.segments_written;
                }
                Ok(None) => {}
                Err(e) => return Err(self.note_error(e)),
            }
        }
        result.shards_compacted.sort_unstable();
        result.duration_ms = started.elapsed().as_millis() as u64;

        if !result.is_noop() {
            tracing::info!(
                shards = ?result.shards_compacted,
                nodes = result.nodes_merged,
                edges = result.edges_merged,
                tombstones = result.tombstones_removed,
                duration_ms = result.duration_ms,
                "Compaction finished"
            );
        }
        Ok(result)
    }

    fn compact_one(&self, shard_id: u16, wait: bool) -> Result<Option<ShardOutcome>> {
        let shard_lock = &self.compaction_locks[shard_id as usize];
        let _guard = if wait {
            lock(shard_lock)
        } else {
            match shard_lock.try_lock() {
                Ok(g) => g,
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
                Err(TryLockError::WouldBlock) => return Ok(None),
            }
        };

        // Fresh snapshot now that this shard is ours.
        let snapshot = self.snapshot();
        let shard = &snapshot.shards[shard_id as usize];
        if shard.l0_segment_count() == 0 {
            return Ok(None);
        }

        let merged = compact_shard(shard, &self.config.compaction)?;
        let consumed_descs: Vec<SegmentDescriptor> = shard
            .node_segments_newest_first()
            .map(|s| s.desc.clone())
            .chain(shard.edge_segments_newest_first().map(|s| s.desc.clone()))
            .collect();
        drop(snapshot);

        let mut fresh = NewSegments::default();
        let written = (|| -> Result<()> {
            for (bytes, meta) in merged.node_outputs {
                let id = self.reserve_segment_id();
                self.materialize(shard_id, id, SegmentType::Nodes, bytes, &meta, &mut fresh)?;
            }
            for (bytes, meta) in merged.edge_outputs {
                let id = self.reserve_segment_id();
                self.materialize(shard_id, id, SegmentType::Edges, bytes, &meta, &mut fresh)?;
            }
            Ok(())
        })();
        if let Err(e) = written {
            fresh.discard();
            return Err(e);
        }

        if let Err(e) = self.publish(&fresh, Some(merged.l0_segments_merged), &merged.consumed, 0, false) {
            fresh.discard();
            return Err(e);
        }

        if let Some(root) = &self.root {
            for d in &consumed_descs {
                let path = d.file_path(root);
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete compacted segment");
                }
                if d.segment_type == SegmentType::Nodes && d.level == LEVEL_L1 {
                    let idx_path = sidecar_path(&path);
                    if let Err(e) = fs::remove_file(&idx_path) {
                        tracing::warn!(path = %idx_path.display(), error = %e, "Failed to delete compacted index");
                    }
                }
            }
        }

        let segments_written = if fresh.is_empty() {
            0
        } else {
            (fresh.node_descs.len() + fresh.edge_descs.len()) as u64
        };
        Ok(Some(ShardOutcome {
            shard_id,
            nodes: merged.node_stats.records_out,
            edges: merged.edge_stats.records_out,
            tombstones: merged.node_stats.tombstones_removed + merged.edge_stats.tombstones_removed,
            segments_merged: consumed_descs.len() as u64,
            segments_written,
        }))
    }
}

// ── Point Lookup & Search ──────────────────────────────────────────

impl MultiShardStore {
    pub fn get_node(&self, id: u128) -> Result<Option<NodeRecord>> {
        self.check_usable()?;
        Ok(self.read_state().live_node(&self.planner, id))
    }

    pub fn node_exists(&self, id: u128) -> Result<bool> {
        Ok(self.get_node(id)?.is_some())
    }

    pub fn find_nodes(&self, query: &AttrQuery) -> Result<Vec<NodeRecord>> {
        self.check_usable()?;
        Ok(self.read_state().find_nodes(&self.planner, query))
    }

    pub fn find_by_type(&self, node_type: &str) -> Result<Vec<NodeRecord>> {
        self.find_nodes(&AttrQuery::new().node_type(node_type))
    }
}

// ── Neighbor Queries ───────────────────────────────────────────────

impl MultiShardStore {
    pub fn get_outgoing_edges(&self, src: u128, edge_types: Option<&[String]>) -> Result<Vec<EdgeRecord>> {
        self.check_usable()?;
        let mut edges = self.read_state().outgoing(&self.planner, src);
        edges.retain(|e| crate::storage::edge_type_allowed(edge_types, &e.edge_type));
        Ok(edges)
    }

    pub fn get_incoming_edges(&self, dst: u128, edge_types: Option<&[String]>) -> Result<Vec<EdgeRecord>> {
        self.check_usable()?;
        let mut edges = self.read_state().incoming(dst);
        edges.retain(|e| crate::storage::edge_type_allowed(edge_types, &e.edge_type));
        Ok(edges)
    }
}

// ── Counts & Stats ─────────────────────────────────────────────────

impl MultiShardStore {
    pub fn node_count(&self) -> Result<usize> {
        self.check_usable()?;
        let mut count = 0;
        self.read_state().scan_live_nodes(|_| count += 1);
        Ok(count)
    }

    pub fn edge_count(&self) -> Result<usize> {
        self.check_usable()?;
        let mut count = 0;
        self.read_state().scan_live_edges(|_| count += 1);
        Ok(count)
    }

    /// Live nodes per type. `filter` entries may end in `*`.
    pub fn count_nodes_by_type(&self, filter: Option<&[String]>) -> Result<HashMap<String, usize>> {
        self.check_usable()?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        self.read_state().scan_live_nodes(|n| {
            if type_filter_accepts(filter, &n.node_type) {
                *counts.entry(n.node_type.clone()).or_default() += 1;
            }
        });
        Ok(counts)
    }

    pub fn count_edges_by_type(&self, filter: Option<&[String]>) -> Result<HashMap<String, usize>> {
        self.check_usable()?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        self.read_state().scan_live_edges(|e| {
            if type_filter_accepts(filter, &e.edge_type) {
                *counts.entry(e.edge_type.clone()).or_default() += 1;
            }
        });
        Ok(counts)
    }

    pub fn shard_stats(&self) -> Vec<ShardStats> {
        self.snapshot().shards.iter().map(Shard::stats).collect()
    }

    pub fn stats(&self) -> StoreStats {
        let last_commit_version = self.last_commit_version();
        let st = self.read_state();
        StoreStats {
            shard_count: self.planner.shard_count(),
            last_commit_version,
            buffered_nodes: st.buffers().map(WriteBuffer::node_count).sum(),
            buffered_edges: st.buffers().map(WriteBuffer::edge_count).sum(),
            buffered_bytes: st.buffers().map(WriteBuffer::estimated_bytes).sum(),
            flush_in_progress: st.frozen.is_some(),
            manifest: st.snapshot.manifest.stats(),
            shards: st.snapshot.shards.iter().map(Shard::stats).collect(),
            unusable: lock(&self.unusable).clone(),
        }
    }
}

fn type_filter_accepts(filter: Option<&[String]>, actual: &str) -> bool {
    match filter {
        None => true,
        Some([]) => true,
        Some(patterns) => patterns.iter().any(|p| type_matches(p, actual)),
    }
}

// ── Tests ──────────────────────────────────────────────────────────
