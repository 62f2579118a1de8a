//! Segment format types and constants.
//!
//! Defines the binary layout of immutable sorted segments, the unit the
//! write buffer flushes into and the compactor merges.

use std::collections::HashSet;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

// ── Constants ──────────────────────────────────────────────────────

/// Magic bytes for segment files
pub const SEGMENT_MAGIC: [u8; 4] = *b"FDS2";

/// Format version
pub const FORMAT_VERSION: u16 = 1;

/// Header size in bytes (fixed, power-of-2, cache-line friendly)
pub const HEADER_SIZE: usize = 32;

/// Footer index magic (ASCII "FTR2")
pub const FOOTER_INDEX_MAGIC: u32 = 0x4654_5232;

/// Footer index size in bytes: 5 * u64 + u32(size) + u32(magic) = 48 bytes
pub const FOOTER_INDEX_SIZE: usize = 48;

/// Bloom filter: bits per key (10 → ~0.82% FPR with k=7)
pub const BLOOM_BITS_PER_KEY: usize = 10;

/// Bloom filter: number of hash functions (optimal for 10 bits/key)
pub const BLOOM_NUM_HASHES: usize = 7;

/// Zone map: max distinct values per field before the field is omitted
pub const MAX_ZONE_MAP_VALUES_PER_FIELD: usize = 10_000;

/// Flag column bit: record is a tombstone
pub const FLAG_DELETED: u8 = 0b0000_0001;

/// Level of freshly flushed segments
pub const LEVEL_L0: u8 = 0;

/// Level of compacted, non-overlapping segments
pub const LEVEL_L1: u8 = 1;

// ── Segment Type ───────────────────────────────────────────────────

/// Type of segment (stored as u8 in header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SegmentType {
    Nodes = 0,
    Edges = 1,
}

impl SegmentType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Nodes),
            1 => Some(Self::Edges),
            _ => None,
        }
    }

    /// File name suffix: `seg_000001_nodes.seg`
    pub fn file_suffix(self) -> &'static str {
        match self {
            Self::Nodes => "nodes",
            Self::Edges => "edges",
        }
    }
}

// ── Header ─────────────────────────────────────────────────────────

/// Segment header, exactly 32 bytes on disk.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"FDS2"
/// 4       2     version: u16
/// 6       1     segment_type: u8
/// 7       1     level: u8 (0 = L0, 1 = L1)
/// 8       8     record_count: u64
/// 16      8     footer_offset: u64
/// 24      8     reserved: 0x00
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub segment_type: SegmentType,
    pub level: u8,
    pub record_count: u64,
    pub footer_offset: u64,
}

impl SegmentHeader {
    pub fn new(segment_type: SegmentType, level: u8, record_count: u64, footer_offset: u64) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: FORMAT_VERSION,
            segment_type,
            level,
            record_count,
            footer_offset,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != SEGMENT_MAGIC {
            return Err(GraphError::InvalidFormat(format!(
                "Not a segment file: expected FDS2, got {:?}",
                self.magic
            )));
        }
        if self.version != FORMAT_VERSION {
            return Err(GraphError::InvalidFormat(format!(
                "Unsupported segment version: {}",
                self.version
            )));
        }
        if self.level > LEVEL_L1 {
            return Err(GraphError::InvalidFormat(format!(
                "Unknown segment level: {}",
                self.level
            )));
        }
        Ok(())
    }

    /// Parse header from byte slice (>= HEADER_SIZE bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(GraphError::InvalidFormat(
                "File too small for segment header".into(),
            ));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        let segment_type_u8 = bytes[6];
        let segment_type = SegmentType::from_u8(segment_type_u8).ok_or_else(|| {
            GraphError::InvalidFormat(format!("Unknown segment type: {}", segment_type_u8))
        })?;
        let level = bytes[7];
        let record_count = read_u64(bytes, 8);
        let footer_offset = read_u64(bytes, 16);

        let header = Self {
            magic,
            version,
            segment_type,
            level,
            record_count,
            footer_offset,
        };
        header.validate()?;
        Ok(header)
    }

    /// Write header to writer (exactly HEADER_SIZE bytes).
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&[self.segment_type as u8])?;
        writer.write_all(&[self.level])?;
        writer.write_all(&self.record_count.to_le_bytes())?;
        writer.write_all(&self.footer_offset.to_le_bytes())?;
        writer.write_all(&[0u8; 8])?; // reserved
        Ok(())
    }
}

// ── Footer Index ───────────────────────────────────────────────────

/// Footer index, the last FOOTER_INDEX_SIZE bytes of the file.
///
/// ```text
/// Offset  Size  Field
/// +0      8     bloom_offset: u64
/// +8      8     dst_bloom_offset: u64 (0 for node segments)
/// +16     8     zone_maps_offset: u64
/// +24     8     string_table_offset: u64
/// +32     8     data_end_offset: u64
/// +40     4     footer_index_size: u32
/// +44     4     magic: u32 = 0x46545232 ("FTR2")
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FooterIndex {
    pub bloom_offset: u64,
    pub dst_bloom_offset: u64,
    pub zone_maps_offset: u64,
    pub string_table_offset: u64,
    pub data_end_offset: u64,
    pub footer_index_size: u32,
    pub magic: u32,
}

impl FooterIndex {
    /// Parse footer index from byte slice (>= FOOTER_INDEX_SIZE bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FOOTER_INDEX_SIZE {
            return Err(GraphError::InvalidFormat("Footer index too small".into()));
        }
        let magic = u32::from_le_bytes([bytes[44], bytes[45], bytes[46], bytes[47]]);
        if magic != FOOTER_INDEX_MAGIC {
            return Err(GraphError::InvalidFormat("Invalid footer index magic".into()));
        }
        let footer_index_size = u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]);
        if (footer_index_size as usize) < FOOTER_INDEX_SIZE {
            return Err(GraphError::InvalidFormat(format!(
                "Footer index size too small: {}",
                footer_index_size
            )));
        }

        Ok(Self {
            bloom_offset: read_u64(bytes, 0),
            dst_bloom_offset: read_u64(bytes, 8),
            zone_maps_offset: read_u64(bytes, 16),
            string_table_offset: read_u64(bytes, 24),
            data_end_offset: read_u64(bytes, 32),
            footer_index_size,
            magic,
        })
    }

    /// Write footer index to writer (exactly FOOTER_INDEX_SIZE bytes).
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.bloom_offset.to_le_bytes())?;
        writer.write_all(&self.dst_bloom_offset.to_le_bytes())?;
        writer.write_all(&self.zone_maps_offset.to_le_bytes())?;
        writer.write_all(&self.string_table_offset.to_le_bytes())?;
        writer.write_all(&self.data_end_offset.to_le_bytes())?;
        writer.write_all(&self.footer_index_size.to_le_bytes())?;
        writer.write_all(&self.magic.to_le_bytes())?;
        Ok(())
    }
}

// ── Segment Metadata ───────────────────────────────────────────────

/// Metadata about a written segment, returned by the writer and copied
/// into the manifest descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMeta {
    pub record_count: u64,
    pub byte_size: u64,
    pub segment_type: SegmentType,
    pub level: u8,
    /// Smallest primary key (node id / edge src). 0 when empty.
    pub min_key: u128,
    /// Largest primary key. 0 when empty.
    pub max_key: u128,
    pub tombstone_count: u64,
    pub node_types: HashSet<String>,
    pub file_paths: HashSet<String>,
    pub edge_types: HashSet<String>,
}

// ── Commit Delta ──────────────────────────────────────────────────

/// Structured diff returned by `commit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitDelta {
    /// Version assigned to every record of this commit.
    pub version: u64,

    /// Scopes whose previous records were tombstoned.
    pub changed_scopes: Vec<String>,

    /// Nodes written that did not exist before.
    pub nodes_added: u64,

    /// Previously live nodes tombstoned and not rewritten.
    pub nodes_removed: u64,

    /// Previously live nodes rewritten by this batch.
    pub nodes_modified: u64,

    pub edges_added: u64,
    pub edges_removed: u64,
}

// ── Helpers ────────────────────────────────────────────────────────

/// Compute padding bytes needed to align `offset` to `alignment`.
/// Padding bytes are always 0x00.
pub fn compute_padding(offset: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return 0;
    }
    let rem = offset % alignment;
    if rem == 0 {
        0
    } else {
        alignment - rem
    }
}

/// Read a little-endian u64 at `offset`. Caller checks bounds.
#[inline]
pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Read a little-endian u32 at `offset`. Caller checks bounds.
#[inline]
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

/// Read a little-endian u128 at `offset`. Caller checks bounds.
#[inline]
pub(crate) fn read_u128(bytes: &[u8], offset: usize) -> u128 {
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&bytes[offset..offset + 16]);
    u128::from_le_bytes(buf)
}
