//! Binary format of the per-segment attribute index.
//!
//! # File Layout
//!
//! ```text
//! [IndexFileHeader]             32 bytes
//! [key data]                    string_table_len bytes, keys sorted
//! [LookupTableEntry] * keys     16 bytes each
//! [IndexEntry] * entry_count    24 bytes each, grouped by key
//! ```
//!
//! A sidecar file holds two of these back to back (by type, then by
//! file), the first prefixed with its byte length as u64 LE.

use std::io::Write;

use crate::error::{GraphError, Result};
use crate::storage_v2::types::{read_u128, read_u32, read_u64};

pub const INDEX_MAGIC: [u8; 4] = *b"FIDX";
pub const INDEX_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 32;
pub const ENTRY_SIZE: usize = 24;
pub const LOOKUP_SIZE: usize = 16;

fn corrupt(msg: impl Into<String>) -> GraphError {
    GraphError::InvalidFormat(msg.into())
}

// ── Header ─────────────────────────────────────────────────────────

/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"FIDX"
/// 4       4     version: u32 = 1
/// 8       8     entry_count: u64
/// 16      4     lookup_count: u32
/// 20      4     string_table_len: u32
/// 24      8     _reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexFileHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub entry_count: u64,
    pub lookup_count: u32,
    pub string_table_len: u32,
}

impl IndexFileHeader {
    pub fn new(entry_count: u64, lookup_count: u32, string_table_len: u32) -> Self {
        Self {
            magic: INDEX_MAGIC,
            version: INDEX_VERSION,
            entry_count,
            lookup_count,
            string_table_len,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.magic)?;
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(&self.entry_count.to_le_bytes())?;
        w.write_all(&self.lookup_count.to_le_bytes())?;
        w.write_all(&self.string_table_len.to_le_bytes())?;
        w.write_all(&[0u8; 8])?;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(corrupt("Failed to read index header: too short"));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != INDEX_MAGIC {
            return Err(corrupt(format!("Not an index file: expected FIDX, got {:?}", magic)));
        }
        let version = read_u32(bytes, 4);
        if version != INDEX_VERSION {
            return Err(corrupt(format!("Unsupported index version: {}", version)));
        }
        Ok(Self {
            magic,
            version,
            entry_count: read_u64(bytes, 8),
            lookup_count: read_u32(bytes, 16),
            string_table_len: read_u32(bytes, 20),
        })
    }
}

// ── Entries ────────────────────────────────────────────────────────

/// One indexed row: the node id and its row number in the segment.
///
/// ```text
/// Offset  Size  Field
/// 0       16    node_id: u128
/// 16      4     row: u32
/// 20      4     _padding
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub node_id: u128,
    pub row: u32,
}

impl IndexEntry {
    pub fn new(node_id: u128, row: u32) -> Self {
        Self { node_id, row }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.node_id.to_le_bytes())?;
        w.write_all(&self.row.to_le_bytes())?;
        w.write_all(&[0u8; 4])?;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8], offset: usize) -> Self {
        Self {
            node_id: read_u128(bytes, offset),
            row: read_u32(bytes, offset + 16),
        }
    }
}

/// Key location in the key data plus the entry range it owns.
///
/// ```text
/// Offset  Size  Field
/// 0       4     key_offset: u32
/// 4       4     key_length: u32
/// 8       4     entry_offset: u32
/// 12      4     entry_count: u32
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupTableEntry {
    pub key_offset: u32,
    pub key_length: u32,
    pub entry_offset: u32,
    pub entry_count: u32,
}

impl LookupTableEntry {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.key_offset.to_le_bytes())?;
        w.write_all(&self.key_length.to_le_bytes())?;
        w.write_all(&self.entry_offset.to_le_bytes())?;
        w.write_all(&self.entry_count.to_le_bytes())?;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8], offset: usize) -> Self {
        Self {
            key_offset: read_u32(bytes, offset),
            key_length: read_u32(bytes, offset + 4),
            entry_offset: read_u32(bytes, offset + 8),
            entry_count: read_u32(bytes, offset + 12),
        }
    }

    pub fn key_range(&self) -> std::ops::Range<usize> {
        let start = self.key_offset as usize;
        start..start + self.key_length as usize
    }

    pub fn entry_range(&self) -> std::ops::Range<usize> {
        let start = self.entry_offset as usize;
        start..start + self.entry_count as usize
    }
}
