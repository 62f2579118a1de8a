//! Manifest: the authoritative list of live segments per shard and level.
//!
//! A `Manifest` is immutable once built. `ManifestStore` hands out the
//! current one as an `Arc<Manifest>` snapshot handle; a reader holding a
//! handle keeps seeing exactly that segment set no matter how many flushes
//! or compactions commit afterwards.
//!
//! On disk (persistent databases):
//!
//! ```text
//! <db>/current.json                   {"version": N}
//! <db>/manifests/0000000042.json      one file per manifest version
//! <db>/segments/03/seg_000017_nodes.seg
//! ```
//!
//! Commit protocol: write the manifest file (temp + rename + fsync), then
//! replace `current.json` the same way, then swap the in-memory handle. A
//! crash at any point leaves `current.json` naming a complete manifest.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::storage_v2::compaction::CompactionInfo;
use crate::storage_v2::index::sidecar_path;
use crate::storage_v2::types::{SegmentMeta, SegmentType, LEVEL_L0, LEVEL_L1};

const CURRENT_FILE: &str = "current.json";
const MANIFESTS_DIR: &str = "manifests";
pub const SEGMENTS_DIR: &str = "segments";

/// Manifest files kept on disk besides the current one.
pub const DEFAULT_MANIFEST_RETENTION: usize = 4;

/// u128 keys travel as hex strings; JSON numbers cannot hold them.
mod hex_u128 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:032x}", v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let s = String::deserialize(d)?;
        u128::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Segment Descriptor ─────────────────────────────────────────────

/// One live segment as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub segment_id: u64,
    pub shard_id: u16,
    pub level: u8,
    pub segment_type: SegmentType,
    pub record_count: u64,
    pub byte_size: u64,
    #[serde(default)]
    pub tombstone_count: u64,
    #[serde(with = "hex_u128")]
    pub min_key: u128,
    #[serde(with = "hex_u128")]
    pub max_key: u128,
    #[serde(default)]
    pub node_types: Vec<String>,
    #[serde(default)]
    pub edge_types: Vec<String>,
}

impl SegmentDescriptor {
    pub fn from_meta(segment_id: u64, shard_id: u16, meta: &SegmentMeta) -> Self {
        let sorted = |set: &HashSet<String>| {
            let mut v: Vec<String> = set.iter().cloned().collect();
            v.sort();
            v
        };
        Self {
            segment_id,
            shard_id,
            level: meta.level,
            segment_type: meta.segment_type,
            record_count: meta.record_count,
            byte_size: meta.byte_size,
            tombstone_count: meta.tombstone_count,
            min_key: meta.min_key,
            max_key: meta.max_key,
            node_types: sorted(&meta.node_types),
            edge_types: sorted(&meta.edge_types),
        }
    }

    /// Path relative to the database root.
    pub fn relative_path(&self) -> PathBuf {
        segment_relative_path(self.shard_id, self.segment_id, self.segment_type)
    }

    pub fn file_path(&self, db_root: &Path) -> PathBuf {
        db_root.join(self.relative_path())
    }

    pub fn overlaps(&self, lo: u128, hi: u128) -> bool {
        self.record_count > 0 && self.min_key <= hi && lo <= self.max_key
    }
}

pub fn segment_relative_path(shard_id: u16, segment_id: u64, segment_type: SegmentType) -> PathBuf {
    PathBuf::from(SEGMENTS_DIR)
        .join(format!("{:02}", shard_id))
        .join(format!("seg_{:06}_{}.seg", segment_id, segment_type.file_suffix()))
}

// ── Manifest ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest version, +1 per commit
    pub version: u64,
    pub created_at_ms: u64,
    pub shard_count: u16,
    /// Highest commit version whose records are in these segments
    pub last_commit_version: u64,
    /// Next segment id to hand out
    pub next_segment_id: u64,
    pub node_segments: Vec<SegmentDescriptor>,
    pub edge_segments: Vec<SegmentDescriptor>,
    #[serde(default)]
    pub last_compaction: Option<CompactionInfo>,
}

impl Manifest {
    pub fn empty(shard_count: u16) -> Self {
        Self {
            version: 1,
            created_at_ms: now_ms(),
            shard_count,
            last_commit_version: 0,
            next_segment_id: 1,
            node_segments: Vec::new(),
            edge_segments: Vec::new(),
            last_compaction: None,
        }
    }

    pub fn segments(&self, segment_type: SegmentType) -> &[SegmentDescriptor] {
        match segment_type {
            SegmentType::Nodes => &self.node_segments,
            SegmentType::Edges => &self.edge_segments,
        }
    }

    /// Segments of one shard and level, in commit order (oldest first).
    pub fn shard_segments(
        &self,
        shard_id: u16,
        segment_type: SegmentType,
        level: u8,
    ) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segments(segment_type)
            .iter()
            .filter(move |d| d.shard_id == shard_id && d.level == level)
    }

    /// L0 segment count (nodes + edges) for a shard.
    pub fn l0_count(&self, shard_id: u16) -> usize {
        self.shard_segments(shard_id, SegmentType::Nodes, LEVEL_L0).count()
            + self.shard_segments(shard_id, SegmentType::Edges, LEVEL_L0).count()
    }

    pub fn all_segments(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.node_segments.iter().chain(self.edge_segments.iter())
    }

    pub fn stats(&self) -> ManifestStats {
        let mut stats = ManifestStats {
            version: self.version,
            ..ManifestStats::default()
        };
        for d in self.all_segments() {
            let records = d.record_count;
            match (d.segment_type, d.level) {
                (SegmentType::Nodes, LEVEL_L0) => stats.l0_node_segments += 1,
                (SegmentType::Nodes, _) => stats.l1_node_segments += 1,
                (SegmentType::Edges, LEVEL_L0) => stats.l0_edge_segments += 1,
                (SegmentType::Edges, _) => stats.l1_edge_segments += 1,
            }
            match d.segment_type {
                SegmentType::Nodes => stats.node_records += records,
                SegmentType::Edges => stats.edge_records += records,
            }
            stats.tombstone_records += d.tombstone_count;
            stats.total_bytes += d.byte_size;
        }
        stats
    }

    /// Structural checks: unique ids, descriptor shards in range, L1 runs
    /// non-overlapping per shard.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for d in self.all_segments() {
            if !ids.insert(d.segment_id) {
                return Err(GraphError::Manifest(format!(
                    "segment id {} listed twice in manifest v{}",
                    d.segment_id, self.version
                )));
            }
            if d.shard_id >= self.shard_count {
                return Err(GraphError::Manifest(format!(
                    "segment {} names shard {} but database has {} shards",
                    d.segment_id, d.shard_id, self.shard_count
                )));
            }
            if d.segment_id >= self.next_segment_id {
                return Err(GraphError::Manifest(format!(
                    "segment {} is not below next_segment_id {}",
                    d.segment_id, self.next_segment_id
                )));
            }
        }
        for shard in 0..self.shard_count {
            for seg_type in [SegmentType::Nodes, SegmentType::Edges] {
                let mut runs: Vec<&SegmentDescriptor> = self
                    .shard_segments(shard, seg_type, LEVEL_L1)
                    .filter(|d| d.record_count > 0)
                    .collect();
                runs.sort_by_key(|d| d.min_key);
                if runs.windows(2).any(|w| w[0].max_key >= w[1].min_key) {
                    return Err(GraphError::Manifest(format!(
                        "overlapping L1 {:?} segments in shard {}",
                        seg_type, shard
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Summary counters derived from a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStats {
    pub version: u64,
    pub l0_node_segments: u64,
    pub l1_node_segments: u64,
    pub l0_edge_segments: u64,
    pub l1_edge_segments: u64,
    pub node_records: u64,
    pub edge_records: u64,
    pub tombstone_records: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CurrentPointer {
    version: u64,
}

// ── Manifest Store ─────────────────────────────────────────────────

/// Persists manifests and owns the current snapshot handle.
#[derive(Debug)]
pub struct ManifestStore {
    /// Database root. None for ephemeral databases.
    root: Option<PathBuf>,
    current: Arc<Manifest>,
    next_segment_id: u64,
    retention: usize,
}

impl ManifestStore {
    /// Initialize an empty manifest under `root`.
    pub fn create(root: &Path, shard_count: u16) -> Result<Self> {
        fs::create_dir_all(root.join(MANIFESTS_DIR))?;
        fs::create_dir_all(root.join(SEGMENTS_DIR))?;
        let manifest = Manifest::empty(shard_count);
        let store = Self {
            root: Some(root.to_path_buf()),
            next_segment_id: manifest.next_segment_id,
            current: Arc::new(manifest),
            retention: DEFAULT_MANIFEST_RETENTION,
        };
        store.persist(&store.current)?;
        Ok(store)
    }

    /// Load the manifest named by `current.json`.
    pub fn open(root: &Path) -> Result<Self> {
        let pointer_path = root.join(CURRENT_FILE);
        let pointer: CurrentPointer = serde_json::from_slice(&fs::read(&pointer_path)?)
            .map_err(|e| GraphError::Manifest(format!("{}: {}", pointer_path.display(), e)))?;

        let path = manifest_path(root, pointer.version);
        let bytes = fs::read(&path).map_err(|e| {
            GraphError::Manifest(format!(
                "current.json names manifest v{} but {} is unreadable: {}",
                pointer.version,
                path.display(),
                e
            ))
        })?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| GraphError::Manifest(format!("{}: {}", path.display(), e)))?;
        if manifest.version != pointer.version {
            return Err(GraphError::Manifest(format!(
                "{} holds version {}, expected {}",
                path.display(),
                manifest.version,
                pointer.version
            )));
        }
        manifest.validate()?;

        Ok(Self {
            root: Some(root.to_path_buf()),
            next_segment_id: manifest.next_segment_id,
            current: Arc::new(manifest),
            retention: DEFAULT_MANIFEST_RETENTION,
        })
    }

    pub fn ephemeral(shard_count: u16) -> Self {
        let manifest = Manifest::empty(shard_count);
        Self {
            root: None,
            next_segment_id: manifest.next_segment_id,
            current: Arc::new(manifest),
            retention: DEFAULT_MANIFEST_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.root.is_none()
    }

    /// Snapshot handle of the committed manifest.
    pub fn current(&self) -> Arc<Manifest> {
        Arc::clone(&self.current)
    }

    /// Reserve a segment id. Ids are never reused, even if the segment
    /// that would have used one is abandoned.
    pub fn next_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    /// Build the successor of the current manifest with the given full
    /// segment lists.
    pub fn create_manifest(
        &self,
        node_segments: Vec<SegmentDescriptor>,
        edge_segments: Vec<SegmentDescriptor>,
        last_compaction: Option<CompactionInfo>,
        last_commit_version: u64,
    ) -> Result<Manifest> {
        let manifest = Manifest {
            version: self.current.version + 1,
            created_at_ms: now_ms(),
            shard_count: self.current.shard_count,
            last_commit_version: last_commit_version.max(self.current.last_commit_version),
            next_segment_id: self.next_segment_id,
            node_segments,
            edge_segments,
            last_compaction: last_compaction.or_else(|| self.current.last_compaction.clone()),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Persist `manifest` and make it current. On error the previous
    /// manifest stays current.
    pub fn commit(&mut self, manifest: impl Into<Arc<Manifest>>) -> Result<Arc<Manifest>> {
        let manifest: Arc<Manifest> = manifest.into();
        if manifest.version != self.current.version + 1 {
            return Err(GraphError::Manifest(format!(
                "manifest v{} does not follow current v{}",
                manifest.version, self.current.version
            )));
        }
        self.persist(&manifest)?;
        self.current = manifest;
        if let Err(e) = self.gc() {
            tracing::warn!(error = %e, "Manifest garbage collection failed");
        }
        Ok(self.current())
    }

    fn persist(&self, manifest: &Manifest) -> Result<()> {
        let root = match &self.root {
            Some(r) => r,
            None => return Ok(()),
        };
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&manifest_path(root, manifest.version), &json)?;
        let pointer = serde_json::to_vec(&CurrentPointer { version: manifest.version })?;
        write_atomic(&root.join(CURRENT_FILE), &pointer)?;
        Ok(())
    }

    /// Delete manifest files older than the retention window.
    fn gc(&self) -> Result<usize> {
        let root = match &self.root {
            Some(r) => r,
            None => return Ok(0),
        };
        let keep_from = self.current.version.saturating_sub(self.retention as u64);
        let mut removed = 0;
        for entry in fs::read_dir(root.join(MANIFESTS_DIR))? {
            let path = entry?.path();
            let version = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(v) = version {
                if v < keep_from {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Remove segment files the current manifest does not reference:
    /// leftovers of a flush or compaction interrupted before its manifest
    /// committed, or of a compaction whose cleanup did not finish. Index
    /// sidecars of live L1 node segments are kept.
    pub fn remove_orphan_segments(&self) -> Result<usize> {
        let root = match &self.root {
            Some(r) => r,
            None => return Ok(0),
        };
        let mut live: HashSet<PathBuf> = HashSet::new();
        for d in self.current.all_segments() {
            let path = d.file_path(root);
            if d.segment_type == SegmentType::Nodes && d.level == LEVEL_L1 {
                live.insert(sidecar_path(&path));
            }
            live.insert(path);
        }
        let segments_dir = root.join(SEGMENTS_DIR);
        if !segments_dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for shard_dir in fs::read_dir(&segments_dir)? {
            let shard_dir = shard_dir?.path();
            if !shard_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&shard_dir)? {
                let path = entry?.path();
                if !live.contains(&path) {
                    tracing::info!(path = %path.display(), "Removing orphan segment file");
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn manifest_path(root: &Path, version: u64) -> PathBuf {
    root.join(MANIFESTS_DIR).join(format!("{:010}.json", version))
}

/// Write `bytes` to `path` via a synced temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        sync_dir(dir);
    }
    Ok(())
}

/// Best-effort directory fsync so a rename survives power loss.
pub(crate) fn sync_dir(dir: &Path) {
    if cfg!(unix) {
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn desc(id: u64, shard: u16, level: u8, min: u128, max: u128) -> SegmentDescriptor {
        SegmentDescriptor {
            segment_id: id,
            shard_id: shard,
            level,
            segment_type: SegmentType::Nodes,
            record_count: 10,
            byte_size: 100,
            tombstone_count: 1,
            min_key: min,
            max_key: max,
            node_types: vec!["FUNCTION".into()],
            edge_types: vec![],
        }
    }

    #[test]
    fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::create(dir.path(), 4).unwrap();
        assert_eq!(store.current().version, 1);
        assert!(dir.path().join("current.json").exists());

        let reopened = ManifestStore::open(dir.path()).unwrap();
        assert_eq!(reopened.current().shard_count, 4);
        assert!(reopened.current().node_segments.is_empty());
    }

    #[test]
    fn test_commit_swaps_handle_but_old_snapshot_survives() {
        let mut store = ManifestStore::ephemeral(2);
        let before = store.current();
        let id = store.next_segment_id();
        let m = store
            .create_manifest(vec![desc(id, 0, LEVEL_L0, 1, 5)], vec![], None, 7)
            .unwrap();
        store.commit(m).unwrap();

        assert!(before.node_segments.is_empty());
        let after = store.current();
        assert_eq!(after.version, 2);
        assert_eq!(after.node_segments.len(), 1);
        assert_eq!(after.last_commit_version, 7);
        assert_eq!(after.next_segment_id, id + 1);
    }

    #[test]
    fn test_commit_persists_and_reopens() {
        let dir = TempDir::new().unwrap();
        let mut store = ManifestStore::create(dir.path(), 2).unwrap();
        let id = store.next_segment_id();
        let m = store
            .create_manifest(vec![desc(id, 1, LEVEL_L1, u128::MAX - 5, u128::MAX)], vec![], None, 3)
            .unwrap();
        store.commit(m).unwrap();

        let reopened = ManifestStore::open(dir.path()).unwrap();
        let current = reopened.current();
        assert_eq!(current.version, 2);
        assert_eq!(current.node_segments[0].max_key, u128::MAX);
        assert_eq!(current.last_commit_version, 3);
    }

    #[test]
    fn test_stale_manifest_version_is_rejected() {
        let mut store = ManifestStore::ephemeral(1);
        let m1 = store.create_manifest(vec![], vec![], None, 0).unwrap();
        let m2 = m1.clone();
        store.commit(m1).unwrap();
        assert!(store.commit(m2).is_err());
    }

    #[test]
    fn test_validate_rejects_overlapping_l1_and_duplicates() {
        let mut store = ManifestStore::ephemeral(1);
        let a = store.next_segment_id();
        let b = store.next_segment_id();
        let err = store
            .create_manifest(
                vec![desc(a, 0, LEVEL_L1, 0, 100), desc(b, 0, LEVEL_L1, 50, 200)],
                vec![],
                None,
                0,
            )
            .unwrap_err();
        assert!(err.to_string().contains("overlapping"));

        let err = store
            .create_manifest(vec![desc(a, 0, LEVEL_L0, 0, 1), desc(a, 0, LEVEL_L0, 0, 1)], vec![], None, 0)
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_missing_manifest_file_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        ManifestStore::create(dir.path(), 1).unwrap();
        fs::write(dir.path().join("current.json"), br#"{"version":9}"#).unwrap();
        let err = ManifestStore::open(dir.path()).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_gc_keeps_retention_window() {
        let dir = TempDir::new().unwrap();
        let mut store = ManifestStore::create(dir.path(), 1).unwrap().with_retention(2);
        for _ in 0..6 {
            let m = store.create_manifest(vec![], vec![], None, 0).unwrap();
            store.commit(m).unwrap();
        }
        let count = fs::read_dir(dir.path().join(MANIFESTS_DIR)).unwrap().count();
        assert_eq!(count, 3); // current (v7) plus v5, v6
        assert!(ManifestStore::open(dir.path()).is_ok());
    }

    #[test]
    fn test_orphan_segments_are_removed() {
        let dir = TempDir::new().unwrap();
        let mut store = ManifestStore::create(dir.path(), 1).unwrap();
        let id = store.next_segment_id();
        let live = desc(id, 0, LEVEL_L0, 0, 1);
        let live_path = live.file_path(dir.path());
        fs::create_dir_all(live_path.parent().unwrap()).unwrap();
        fs::write(&live_path, b"x").unwrap();
        let orphan = segment_relative_path(0, 99, SegmentType::Edges);
        fs::write(dir.path().join(&orphan), b"y").unwrap();

        let m = store.create_manifest(vec![live], vec![], None, 0).unwrap();
        store.commit(m).unwrap();
        assert_eq!(store.remove_orphan_segments().unwrap(), 1);
        assert!(live_path.exists());
        assert!(!dir.path().join(orphan).exists());
    }

    #[test]
    fn test_stats_counts_levels() {
        let mut m = Manifest::empty(1);
        m.next_segment_id = 10;
        m.node_segments = vec![desc(1, 0, LEVEL_L0, 0, 1), desc(2, 0, LEVEL_L1, 5, 9)];
        let stats = m.stats();
        assert_eq!(stats.l0_node_segments, 1);
        assert_eq!(stats.l1_node_segments, 1);
        assert_eq!(stats.node_records, 20);
        assert_eq!(stats.tombstone_records, 2);
        assert_eq!(m.l0_count(0), 1);
    }
}
