//! Segment writers.
//!
//! `NodeSegmentWriter` and `EdgeSegmentWriter` accumulate records, sort
//! them by primary key and emit one immutable segment with its bloom
//! filter, zone map and string table. A key appearing more than once is
//! written once, keeping the highest version.

use std::collections::HashSet;
use std::io::{Cursor, Seek, SeekFrom, Write};

use crate::error::Result;
use crate::storage::{EdgeRecord, NodeRecord};
use crate::storage_v2::bloom::BloomFilter;
use crate::storage_v2::string_table::StringTable;
use crate::storage_v2::types::*;
use crate::storage_v2::zone_map::{ZoneMap, FIELD_EDGE_TYPE, FIELD_FILE, FIELD_NODE_TYPE};

fn flags_of(deleted: bool) -> u8 {
    if deleted {
        FLAG_DELETED
    } else {
        0
    }
}

/// Write the footer sections and index, then patch the header's
/// footer_offset. Returns the total byte size.
fn write_footer<W: Write + Seek>(
    writer: &mut W,
    data_end_offset: u64,
    bloom: &BloomFilter,
    dst_bloom: Option<&BloomFilter>,
    zone_map: &ZoneMap,
    string_table: &StringTable,
) -> Result<u64> {
    let bloom_offset = writer.stream_position()?;
    bloom.write_to(writer)?;

    let dst_bloom_offset = match dst_bloom {
        Some(b) => {
            let off = writer.stream_position()?;
            b.write_to(writer)?;
            off
        }
        None => 0,
    };

    let zone_maps_offset = writer.stream_position()?;
    zone_map.write_to(writer)?;

    let string_table_offset = writer.stream_position()?;
    string_table.write_to(writer)?;

    let footer_offset = writer.stream_position()?;
    FooterIndex {
        bloom_offset,
        dst_bloom_offset,
        zone_maps_offset,
        string_table_offset,
        data_end_offset,
        footer_index_size: FOOTER_INDEX_SIZE as u32,
        magic: FOOTER_INDEX_MAGIC,
    }
    .write_to(writer)?;
    let total_size = writer.stream_position()?;

    writer.seek(SeekFrom::Start(16))?;
    writer.write_all(&footer_offset.to_le_bytes())?;
    writer.seek(SeekFrom::Start(total_size))?;
    writer.flush()?;
    Ok(total_size)
}

// ── NodeSegmentWriter ──────────────────────────────────────────────

/// Writer for node segments.
///
/// ## Binary layout
///
/// ```text
/// [Header 32 bytes]
/// [semantic_key indices: u32 × N]
/// [node_type indices: u32 × N]
/// [name indices: u32 × N]
/// [file indices: u32 × N]
/// [metadata indices: u32 × N]
/// [padding to 16-byte boundary]
/// [id column: u128 × N]          sorted ascending
/// [version column: u64 × N]
/// [flags column: u8 × N]         bit0 = tombstone
/// [bloom filter over ids]
/// [zone map]
/// [string table]
/// [footer index 48 bytes]
/// ```
#[derive(Default)]
pub struct NodeSegmentWriter {
    records: Vec<NodeRecord>,
}

impl NodeSegmentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: NodeRecord) {
        self.records.push(record);
    }

    pub fn extend<I: IntoIterator<Item = NodeRecord>>(&mut self, records: I) {
        self.records.extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish<W: Write + Seek>(self, writer: &mut W, level: u8) -> Result<SegmentMeta> {
        write_node_segment(self.records.iter().collect(), writer, level)
    }

    /// Serialize into an in-memory buffer.
    pub fn finish_to_vec(self, level: u8) -> Result<(Vec<u8>, SegmentMeta)> {
        let mut cursor = Cursor::new(Vec::new());
        let meta = self.finish(&mut cursor, level)?;
        Ok((cursor.into_inner(), meta))
    }

    /// Serialize records the caller keeps ownership of.
    pub fn borrowed_to_vec(records: Vec<&NodeRecord>, level: u8) -> Result<(Vec<u8>, SegmentMeta)> {
        let mut cursor = Cursor::new(Vec::new());
        let meta = write_node_segment(records, &mut cursor, level)?;
        Ok((cursor.into_inner(), meta))
    }
}

fn write_node_segment<W: Write + Seek>(
    mut records: Vec<&NodeRecord>,
    writer: &mut W,
    level: u8,
) -> Result<SegmentMeta> {
    records.sort_by(|a, b| a.id.cmp(&b.id).then(b.version.cmp(&a.version)));
    records.dedup_by_key(|r| r.id);
    let n = records.len();

    let mut string_table = StringTable::new();
    let mut zone_map = ZoneMap::new();
    let mut u32_columns: [Vec<u32>; 5] = Default::default();
    let mut node_types = HashSet::new();
    let mut file_paths = HashSet::new();
    let mut tombstone_count = 0u64;

    for r in &records {
        u32_columns[0].push(string_table.intern(&r.semantic_key));
        u32_columns[1].push(string_table.intern(&r.node_type));
        u32_columns[2].push(string_table.intern(&r.name));
        u32_columns[3].push(string_table.intern(&r.file));
        u32_columns[4].push(string_table.intern(&r.metadata));

        zone_map.add_key(r.id);
        zone_map.add(FIELD_NODE_TYPE, &r.node_type);
        zone_map.add(FIELD_FILE, &r.file);
        node_types.insert(r.node_type.clone());
        file_paths.insert(r.file.clone());
        if r.deleted {
            tombstone_count += 1;
        }
    }
    let bloom = BloomFilter::from_keys(n, records.iter().map(|r| r.id));

    SegmentHeader::new(SegmentType::Nodes, level, n as u64, 0).write_to(writer)?;
    for column in &u32_columns {
        for idx in column {
            writer.write_all(&idx.to_le_bytes())?;
        }
    }
    let padding = compute_padding(HEADER_SIZE + 20 * n, 16);
    writer.write_all(&[0u8; 16][..padding])?;
    for r in &records {
        writer.write_all(&r.id.to_le_bytes())?;
    }
    for r in &records {
        writer.write_all(&r.version.to_le_bytes())?;
    }
    for r in &records {
        writer.write_all(&[flags_of(r.deleted)])?;
    }
    let data_end_offset = writer.stream_position()?;

    let byte_size = write_footer(writer, data_end_offset, &bloom, None, &zone_map, &string_table)?;

    let (min_key, max_key) = zone_map.key_range().unwrap_or((0, 0));
    Ok(SegmentMeta {
        record_count: n as u64,
        byte_size,
        segment_type: SegmentType::Nodes,
        level,
        min_key,
        max_key,
        tombstone_count,
        node_types,
        file_paths,
        edge_types: HashSet::new(),
    })
}

// ── EdgeSegmentWriter ──────────────────────────────────────────────

/// Writer for edge segments.
///
/// ## Binary layout
///
/// ```text
/// [Header 32 bytes]
/// [src column: u128 × N]         sorted by (src, dst, edge_type)
/// [dst column: u128 × N]
/// [edge_type indices: u32 × N]
/// [metadata indices: u32 × N]
/// [version column: u64 × N]
/// [flags column: u8 × N]
/// [src bloom filter]
/// [dst bloom filter]
/// [zone map]                     key range over src
/// [string table]
/// [footer index 48 bytes]
/// ```
#[derive(Default)]
pub struct EdgeSegmentWriter {
    records: Vec<EdgeRecord>,
}

impl EdgeSegmentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: EdgeRecord) {
        self.records.push(record);
    }

    pub fn extend<I: IntoIterator<Item = EdgeRecord>>(&mut self, records: I) {
        self.records.extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish<W: Write + Seek>(self, writer: &mut W, level: u8) -> Result<SegmentMeta> {
        write_edge_segment(self.records.iter().collect(), writer, level)
    }

    pub fn finish_to_vec(self, level: u8) -> Result<(Vec<u8>, SegmentMeta)> {
        let mut cursor = Cursor::new(Vec::new());
        let meta = self.finish(&mut cursor, level)?;
        Ok((cursor.into_inner(), meta))
    }

    /// Serialize records the caller keeps ownership of.
    pub fn borrowed_to_vec(records: Vec<&EdgeRecord>, level: u8) -> Result<(Vec<u8>, SegmentMeta)> {
        let mut cursor = Cursor::new(Vec::new());
        let meta = write_edge_segment(records, &mut cursor, level)?;
        Ok((cursor.into_inner(), meta))
    }
}

fn write_edge_segment<W: Write + Seek>(
    mut records: Vec<&EdgeRecord>,
    writer: &mut W,
    level: u8,
) -> Result<SegmentMeta> {
    records.sort_by(|a, b| {
        (a.src, a.dst, &a.edge_type)
            .cmp(&(b.src, b.dst, &b.edge_type))
            .then(b.version.cmp(&a.version))
    });
    records.dedup_by(|later, earlier| {
        later.src == earlier.src && later.dst == earlier.dst && later.edge_type == earlier.edge_type
    });
    let n = records.len();

    let mut string_table = StringTable::new();
    let mut zone_map = ZoneMap::new();
    let mut type_indices = Vec::with_capacity(n);
    let mut metadata_indices = Vec::with_capacity(n);
    let mut edge_types = HashSet::new();
    let mut tombstone_count = 0u64;

    for r in &records {
        type_indices.push(string_table.intern(&r.edge_type));
        metadata_indices.push(string_table.intern(&r.metadata));
        zone_map.add_key(r.src);
        zone_map.add(FIELD_EDGE_TYPE, &r.edge_type);
        edge_types.insert(r.edge_type.clone());
        if r.deleted {
            tombstone_count += 1;
        }
    }
    let src_bloom = BloomFilter::from_keys(n, records.iter().map(|r| r.src));
    let dst_bloom = BloomFilter::from_keys(n, records.iter().map(|r| r.dst));

    SegmentHeader::new(SegmentType::Edges, level, n as u64, 0).write_to(writer)?;
    for r in &records {
        writer.write_all(&r.src.to_le_bytes())?;
    }
    for r in &records {
        writer.write_all(&r.dst.to_le_bytes())?;
    }
    for idx in type_indices.iter().chain(metadata_indices.iter()) {
        writer.write_all(&idx.to_le_bytes())?;
    }
    for r in &records {
        writer.write_all(&r.version.to_le_bytes())?;
    }
    for r in &records {
        writer.write_all(&[flags_of(r.deleted)])?;
    }
    let data_end_offset = writer.stream_position()?;

    let byte_size = write_footer(
        writer,
        data_end_offset,
        &src_bloom,
        Some(&dst_bloom),
        &zone_map,
        &string_table,
    )?;

    let (min_key, max_key) = zone_map.key_range().unwrap_or((0, 0));
    Ok(SegmentMeta {
        record_count: n as u64,
        byte_size,
        segment_type: SegmentType::Edges,
        level,
        min_key,
        max_key,
        tombstone_count,
        node_types: HashSet::new(),
        file_paths: HashSet::new(),
        edge_types,
    })
}
