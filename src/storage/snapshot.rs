//! Single-file snapshot used by the legacy engine.
//!
//! Layout: 4-byte magic `FDB1`, then the bincode-encoded `GraphSnapshot`.
//! Written to a temp file and renamed over `graph.bin`, so a crash leaves
//! either the old or the new snapshot.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{EdgeRecord, NodeRecord};
use crate::error::{GraphError, Result};
use crate::storage_v2::manifest::write_atomic;

pub const SNAPSHOT_FILE: &str = "graph.bin";
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"FDB1";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub format_version: u32,
    /// Last commit version contained in this snapshot
    pub last_version: u64,
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
}

impl GraphSnapshot {
    pub fn new(last_version: u64, nodes: Vec<NodeRecord>, edges: Vec<EdgeRecord>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            last_version,
            nodes,
            edges,
        }
    }

    /// Write `graph.bin` under `dir`. Returns the file size.
    pub fn write_to(&self, dir: &Path) -> Result<u64> {
        let body = bincode::serialize(self)?;
        let mut bytes = Vec::with_capacity(SNAPSHOT_MAGIC.len() + body.len());
        bytes.extend_from_slice(&SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&body);
        write_atomic(&dir.join(SNAPSHOT_FILE), &bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Load `graph.bin` from `dir`; `None` if it was never written.
    pub fn read_from(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        if bytes.len() < SNAPSHOT_MAGIC.len() || bytes[..4] != SNAPSHOT_MAGIC {
            return Err(GraphError::InvalidFormat(format!(
                "{} is not a graph snapshot",
                path.display()
            )));
        }
        let snapshot: GraphSnapshot = bincode::deserialize(&bytes[4..]).map_err(|e| {
            GraphError::InvalidFormat(format!("{}: {}", path.display(), e))
        })?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(GraphError::InvalidFormat(format!(
                "{}: unsupported snapshot format {}",
                path.display(),
                snapshot.format_version
            )));
        }
        Ok(Some(snapshot))
    }
}
