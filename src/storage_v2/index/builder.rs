//! Inverted index builder, run over each L1 node segment at compaction.
//!
//! Two indexes per segment:
//! - **by_type**: node_type -> rows
//! - **by_file**: file -> rows
//!
//! Tombstoned rows are left out; they never answer an attribute query.

use std::collections::BTreeMap;
use std::io::Write;

use crate::error::{GraphError, Result};
use crate::storage_v2::index::format::{IndexEntry, IndexFileHeader, LookupTableEntry};
use crate::storage_v2::segment::NodeSegment;

/// Serialized indexes, ready to load or write as a sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltIndexes {
    pub by_type: Vec<u8>,
    pub by_file: Vec<u8>,
}

impl BuiltIndexes {
    /// Sidecar layout: by_type length (u64 LE), by_type, by_file.
    pub fn to_sidecar_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.by_type.len() + self.by_file.len());
        out.extend_from_slice(&(self.by_type.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.by_type);
        out.extend_from_slice(&self.by_file);
        out
    }
}

/// Build both indexes from the rows of `segment`.
///
/// O(N log K) for N rows and K distinct keys.
pub fn build_inverted_indexes(segment: &NodeSegment) -> Result<BuiltIndexes> {
    let mut by_type: BTreeMap<&str, Vec<IndexEntry>> = BTreeMap::new();
    let mut by_file: BTreeMap<&str, Vec<IndexEntry>> = BTreeMap::new();

    for i in 0..segment.record_count() {
        if segment.is_deleted(i) {
            continue;
        }
        let row = u32::try_from(i)
            .map_err(|_| GraphError::InvalidFormat("segment too large to index".into()))?;
        let entry = IndexEntry::new(segment.get_id(i), row);
        by_type.entry(segment.get_node_type(i)).or_default().push(entry);
        by_file.entry(segment.get_file(i)).or_default().push(entry);
    }

    Ok(BuiltIndexes {
        by_type: serialize_index(&by_type)?,
        by_file: serialize_index(&by_file)?,
    })
}

fn too_large() -> GraphError {
    GraphError::InvalidFormat("index section exceeds u32 range".into())
}

fn serialize_index(index: &BTreeMap<&str, Vec<IndexEntry>>) -> Result<Vec<u8>> {
    let mut string_table = Vec::new();
    let mut lookups = Vec::with_capacity(index.len());
    let mut entry_offset = 0u32;
    for (key, entries) in index {
        let entry_count = u32::try_from(entries.len()).map_err(|_| too_large())?;
        lookups.push(LookupTableEntry {
            key_offset: u32::try_from(string_table.len()).map_err(|_| too_large())?,
            key_length: u32::try_from(key.len()).map_err(|_| too_large())?,
            entry_offset,
            entry_count,
        });
        string_table.extend_from_slice(key.as_bytes());
        entry_offset = entry_offset.checked_add(entry_count).ok_or_else(too_large)?;
    }

    let header = IndexFileHeader::new(
        entry_offset as u64,
        u32::try_from(lookups.len()).map_err(|_| too_large())?,
        u32::try_from(string_table.len()).map_err(|_| too_large())?,
    );

    let mut buf = Vec::new();
    header.write_to(&mut buf)?;
    buf.write_all(&string_table)?;
    for lookup in &lookups {
        lookup.write_to(&mut buf)?;
    }
    for entries in index.values() {
        for entry in entries {
            entry.write_to(&mut buf)?;
        }
    }
    Ok(buf)
}
