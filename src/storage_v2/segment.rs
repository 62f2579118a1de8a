//! Segment readers.
//!
//! `NodeSegment` and `EdgeSegment` read immutable sorted segments either
//! from a memory-mapped file or from an owned buffer (ephemeral stores).
//! Every offset and string index is validated on open, so accessors never
//! fail afterwards; a bad file surfaces as `GraphError::InvalidFormat`.

use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{GraphError, Result};
use crate::storage::{type_matches, EdgeRecord, NodeRecord};
use crate::storage_v2::bloom::BloomFilter;
use crate::storage_v2::index::AttrIndex;
use crate::storage_v2::string_table::StringTable;
use crate::storage_v2::types::*;
use crate::storage_v2::zone_map::{ZoneMap, FIELD_EDGE_TYPE, FIELD_FILE, FIELD_NODE_TYPE};

// ── Backing bytes ──────────────────────────────────────────────────

#[derive(Debug)]
enum SegmentBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for SegmentBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            SegmentBytes::Mapped(m) => m,
            SegmentBytes::Owned(v) => v,
        }
    }
}

fn map_file(path: &Path) -> Result<SegmentBytes> {
    let file = File::open(path)?;
    prefetch_file(&file);
    // Segment files are write-once; nothing modifies them while mapped.
    let mmap = unsafe { Mmap::map(&file) }?;
    Ok(SegmentBytes::Mapped(mmap))
}

/// Hint the kernel to read the whole file ahead (Linux only).
#[cfg(target_os = "linux")]
fn prefetch_file(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_WILLNEED);
    }
}

#[cfg(not(target_os = "linux"))]
fn prefetch_file(_file: &File) {}

// ── Shared footer parsing ──────────────────────────────────────────

struct Footer {
    header: SegmentHeader,
    bloom: BloomFilter,
    dst_bloom: Option<BloomFilter>,
    zone_map: ZoneMap,
    string_table: StringTable,
}

fn corrupt(msg: impl Into<String>) -> GraphError {
    GraphError::InvalidFormat(msg.into())
}

/// Validate header and footer layout against the expected column size and
/// decode the footer sections.
fn parse_footer(
    bytes: &[u8],
    expected: SegmentType,
    data_end: impl Fn(usize) -> usize,
) -> Result<Footer> {
    if bytes.len() < HEADER_SIZE + FOOTER_INDEX_SIZE {
        return Err(corrupt("File too small for segment"));
    }
    let header = SegmentHeader::from_bytes(&bytes[..HEADER_SIZE])?;
    if header.segment_type != expected {
        return Err(corrupt(format!(
            "Expected {:?} segment, got {:?}",
            expected, header.segment_type
        )));
    }

    let fi_start = bytes.len() - FOOTER_INDEX_SIZE;
    let fi = FooterIndex::from_bytes(&bytes[fi_start..])?;
    if header.footer_offset as usize != fi_start {
        return Err(corrupt("footer_offset does not point at footer index"));
    }

    let n = usize::try_from(header.record_count)
        .map_err(|_| corrupt("record_count overflows usize"))?;
    if n > bytes.len() {
        return Err(corrupt("record_count exceeds file size"));
    }
    if fi.data_end_offset != data_end(n) as u64 {
        return Err(corrupt("data_end_offset does not match column layout"));
    }

    let bloom_end = if expected == SegmentType::Edges {
        fi.dst_bloom_offset
    } else {
        fi.zone_maps_offset
    };
    let ordered = [
        fi.data_end_offset,
        fi.bloom_offset,
        bloom_end,
        fi.zone_maps_offset,
        fi.string_table_offset,
        header.footer_offset,
    ];
    if fi.bloom_offset != fi.data_end_offset || ordered.windows(2).any(|w| w[0] > w[1]) {
        return Err(corrupt("footer section offsets out of order"));
    }

    let slice = |from: u64, to: u64| &bytes[from as usize..to as usize];
    let bloom = BloomFilter::from_bytes(slice(fi.bloom_offset, bloom_end))?;
    let dst_bloom = if expected == SegmentType::Edges {
        Some(BloomFilter::from_bytes(slice(fi.dst_bloom_offset, fi.zone_maps_offset))?)
    } else {
        None
    };
    let zone_map = ZoneMap::from_bytes(slice(fi.zone_maps_offset, fi.string_table_offset))?;
    let string_table =
        StringTable::from_bytes(slice(fi.string_table_offset, header.footer_offset))?;

    Ok(Footer {
        header,
        bloom,
        dst_bloom,
        zone_map,
        string_table,
    })
}

fn check_string_column(bytes: &[u8], offset: usize, n: usize, table: &StringTable) -> Result<()> {
    for i in 0..n {
        let idx = read_u32(bytes, offset + i * 4);
        if idx as usize >= table.len() {
            return Err(corrupt(format!("String index {} out of range at row {}", idx, i)));
        }
    }
    Ok(())
}

// ── Node column layout ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct NodeColumns {
    semantic_key: usize,
    node_type: usize,
    name: usize,
    file: usize,
    metadata: usize,
    ids: usize,
    versions: usize,
    flags: usize,
}

impl NodeColumns {
    fn for_count(n: usize) -> Self {
        let semantic_key = HEADER_SIZE;
        let node_type = semantic_key + 4 * n;
        let name = node_type + 4 * n;
        let file = name + 4 * n;
        let metadata = file + 4 * n;
        let u32_end = metadata + 4 * n;
        let ids = u32_end + compute_padding(u32_end, 16);
        let versions = ids + 16 * n;
        let flags = versions + 8 * n;
        Self {
            semantic_key,
            node_type,
            name,
            file,
            metadata,
            ids,
            versions,
            flags,
        }
    }

    fn data_end(n: usize) -> usize {
        Self::for_count(n).flags + n
    }
}

// ── NodeSegment ────────────────────────────────────────────────────

/// Immutable node segment, rows sorted by id.
#[derive(Debug)]
pub struct NodeSegment {
    data: SegmentBytes,
    header: SegmentHeader,
    bloom: BloomFilter,
    zone_map: ZoneMap,
    string_table: StringTable,
    cols: NodeColumns,
    /// Present on L1 segments once attached
    attr_index: Option<AttrIndex>,
}

impl NodeSegment {
    pub fn open(path: &Path) -> Result<Self> {
        Self::parse(map_file(path)?)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(SegmentBytes::Owned(bytes))
    }

    fn parse(data: SegmentBytes) -> Result<Self> {
        let footer = parse_footer(&data, SegmentType::Nodes, NodeColumns::data_end)?;
        let n = footer.header.record_count as usize;
        let cols = NodeColumns::for_count(n);
        for offset in [cols.semantic_key, cols.node_type, cols.name, cols.file, cols.metadata] {
            check_string_column(&data, offset, n, &footer.string_table)?;
        }
        for i in 1..n {
            if read_u128(&data, cols.ids + (i - 1) * 16) >= read_u128(&data, cols.ids + i * 16) {
                return Err(corrupt("node id column is not strictly sorted"));
            }
        }
        Ok(Self {
            data,
            header: footer.header,
            bloom: footer.bloom,
            zone_map: footer.zone_map,
            string_table: footer.string_table,
            cols,
            attr_index: None,
        })
    }

    pub fn with_attr_index(mut self, index: AttrIndex) -> Self {
        self.attr_index = Some(index);
        self
    }

    pub fn attr_index(&self) -> Option<&AttrIndex> {
        self.attr_index.as_ref()
    }

    pub fn record_count(&self) -> usize {
        self.header.record_count as usize
    }

    pub fn level(&self) -> u8 {
        self.header.level
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn key_range(&self) -> Option<(u128, u128)> {
        self.zone_map.key_range()
    }

    // ── Column accessors ───────────────────────────────────────────

    pub fn get_id(&self, index: usize) -> u128 {
        read_u128(&self.data, self.cols.ids + index * 16)
    }

    pub fn get_version(&self, index: usize) -> u64 {
        read_u64(&self.data, self.cols.versions + index * 8)
    }

    pub fn is_deleted(&self, index: usize) -> bool {
        self.data[self.cols.flags + index] & FLAG_DELETED != 0
    }

    pub fn get_node_type(&self, index: usize) -> &str {
        self.string_at(self.cols.node_type, index)
    }

    pub fn get_file(&self, index: usize) -> &str {
        self.string_at(self.cols.file, index)
    }

    pub fn get_record(&self, index: usize) -> NodeRecord {
        NodeRecord {
            id: self.get_id(index),
            semantic_key: self.string_at(self.cols.semantic_key, index).to_string(),
            node_type: self.get_node_type(index).to_string(),
            name: self.string_at(self.cols.name, index).to_string(),
            file: self.get_file(index).to_string(),
            version: self.get_version(index),
            metadata: self.string_at(self.cols.metadata, index).to_string(),
            deleted: self.is_deleted(index),
        }
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// Zone-map range check, then bloom filter.
    pub fn maybe_contains(&self, id: u128) -> bool {
        self.zone_map.may_contain_key(id) && self.bloom.maybe_contains(id)
    }

    /// Row index of `id` by binary search over the sorted id column.
    pub fn position(&self, id: u128) -> Option<usize> {
        let (mut lo, mut hi) = (0usize, self.record_count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.get_id(mid).cmp(&id) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Record for `id`, tombstones included.
    pub fn find(&self, id: u128) -> Option<NodeRecord> {
        if !self.maybe_contains(id) {
            return None;
        }
        self.position(id).map(|i| self.get_record(i))
    }

    /// False when no row can have a type matching `pattern`.
    pub fn may_contain_type(&self, pattern: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.zone_map.may_contain_prefix(FIELD_NODE_TYPE, prefix),
            None => self.zone_map.may_contain(FIELD_NODE_TYPE, pattern),
        }
    }

    pub fn may_contain_file(&self, file: &str) -> bool {
        self.zone_map.may_contain(FIELD_FILE, file)
    }

    /// Distinct node types present, when tracked by the zone map.
    pub fn node_types(&self) -> Option<impl Iterator<Item = &String>> {
        self.zone_map.get_values(FIELD_NODE_TYPE).map(|s| s.iter())
    }

    /// Rows whose type matches `pattern`, without decoding other rows.
    pub fn rows_of_type<'a>(&'a self, pattern: &'a str) -> impl Iterator<Item = usize> + 'a {
        (0..self.record_count()).filter(move |&i| type_matches(pattern, self.get_node_type(i)))
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeRecord> + '_ {
        (0..self.record_count()).map(move |i| self.get_record(i))
    }

    fn string_at(&self, column: usize, index: usize) -> &str {
        let idx = read_u32(&self.data, column + index * 4);
        self.string_table.get(idx).unwrap_or_default()
    }
}

// ── Edge column layout ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct EdgeColumns {
    src: usize,
    dst: usize,
    edge_type: usize,
    metadata: usize,
    versions: usize,
    flags: usize,
}

impl EdgeColumns {
    fn for_count(n: usize) -> Self {
        let src = HEADER_SIZE;
        let dst = src + 16 * n;
        let edge_type = dst + 16 * n;
        let metadata = edge_type + 4 * n;
        let versions = metadata + 4 * n;
        let flags = versions + 8 * n;
        Self {
            src,
            dst,
            edge_type,
            metadata,
            versions,
            flags,
        }
    }

    fn data_end(n: usize) -> usize {
        Self::for_count(n).flags + n
    }
}

// ── EdgeSegment ────────────────────────────────────────────────────

/// Immutable edge segment, rows sorted by (src, dst, edge_type).
#[derive(Debug)]
pub struct EdgeSegment {
    data: SegmentBytes,
    header: SegmentHeader,
    src_bloom: BloomFilter,
    dst_bloom: BloomFilter,
    zone_map: ZoneMap,
    string_table: StringTable,
    cols: EdgeColumns,
}

impl EdgeSegment {
    pub fn open(path: &Path) -> Result<Self> {
        Self::parse(map_file(path)?)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(SegmentBytes::Owned(bytes))
    }

    fn parse(data: SegmentBytes) -> Result<Self> {
        let footer = parse_footer(&data, SegmentType::Edges, EdgeColumns::data_end)?;
        let n = footer.header.record_count as usize;
        let cols = EdgeColumns::for_count(n);
        check_string_column(&data, cols.edge_type, n, &footer.string_table)?;
        check_string_column(&data, cols.metadata, n, &footer.string_table)?;
        for i in 1..n {
            if read_u128(&data, cols.src + (i - 1) * 16) > read_u128(&data, cols.src + i * 16) {
                return Err(corrupt("edge src column is not sorted"));
            }
        }
        let dst_bloom = footer
            .dst_bloom
            .ok_or_else(|| corrupt("edge segment without dst bloom"))?;
        Ok(Self {
            data,
            header: footer.header,
            src_bloom: footer.bloom,
            dst_bloom,
            zone_map: footer.zone_map,
            string_table: footer.string_table,
            cols,
        })
    }

    pub fn record_count(&self) -> usize {
        self.header.record_count as usize
    }

    pub fn level(&self) -> u8 {
        self.header.level
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn key_range(&self) -> Option<(u128, u128)> {
        self.zone_map.key_range()
    }

    pub fn get_src(&self, index: usize) -> u128 {
        read_u128(&self.data, self.cols.src + index * 16)
    }

    pub fn get_dst(&self, index: usize) -> u128 {
        read_u128(&self.data, self.cols.dst + index * 16)
    }

    pub fn get_edge_type(&self, index: usize) -> &str {
        self.string_at(self.cols.edge_type, index)
    }

    pub fn get_version(&self, index: usize) -> u64 {
        read_u64(&self.data, self.cols.versions + index * 8)
    }

    pub fn is_deleted(&self, index: usize) -> bool {
        self.data[self.cols.flags + index] & FLAG_DELETED != 0
    }

    pub fn get_record(&self, index: usize) -> EdgeRecord {
        EdgeRecord {
            src: self.get_src(index),
            dst: self.get_dst(index),
            edge_type: self.get_edge_type(index).to_string(),
            version: self.get_version(index),
            metadata: self.string_at(self.cols.metadata, index).to_string(),
            deleted: self.is_deleted(index),
        }
    }

    pub fn maybe_contains_src(&self, src: u128) -> bool {
        self.zone_map.may_contain_key(src) && self.src_bloom.maybe_contains(src)
    }

    pub fn maybe_contains_dst(&self, dst: u128) -> bool {
        self.dst_bloom.maybe_contains(dst)
    }

    pub fn may_contain_edge_type(&self, edge_type: &str) -> bool {
        match edge_type.strip_suffix('*') {
            Some(prefix) => self.zone_map.may_contain_prefix(FIELD_EDGE_TYPE, prefix),
            None => self.zone_map.may_contain(FIELD_EDGE_TYPE, edge_type),
        }
    }

    /// All rows with this src (tombstones included), via binary search.
    pub fn find_by_src(&self, src: u128) -> Vec<EdgeRecord> {
        if !self.maybe_contains_src(src) {
            return Vec::new();
        }
        let n = self.record_count();
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get_src(mid) < src {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo..n)
            .take_while(|&i| self.get_src(i) == src)
            .map(|i| self.get_record(i))
            .collect()
    }

    /// All rows with this dst (tombstones included). Linear scan gated by
    /// the dst bloom filter.
    pub fn find_by_dst(&self, dst: u128) -> Vec<EdgeRecord> {
        if !self.maybe_contains_dst(dst) {
            return Vec::new();
        }
        (0..self.record_count())
            .filter(|&i| self.get_dst(i) == dst)
            .map(|i| self.get_record(i))
            .collect()
    }

    pub fn edge_types(&self) -> Option<impl Iterator<Item = &String>> {
        self.zone_map.get_values(FIELD_EDGE_TYPE).map(|s| s.iter())
    }

    pub fn iter(&self) -> impl Iterator<Item = EdgeRecord> + '_ {
        (0..self.record_count()).map(move |i| self.get_record(i))
    }

    fn string_at(&self, column: usize, index: usize) -> &str {
        let idx = read_u32(&self.data, column + index * 4);
        self.string_table.get(idx).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_v2::writer::{EdgeSegmentWriter, NodeSegmentWriter};
    use std::io::BufWriter;
    use tempfile::TempDir;

    fn node(key: &str, node_type: &str, file: &str) -> NodeRecord {
        NodeRecord::new(key, node_type, key, file)
    }

    fn node_segment(records: Vec<NodeRecord>) -> NodeSegment {
        let mut w = NodeSegmentWriter::new();
        w.extend(records);
        let (bytes, _) = w.finish_to_vec(LEVEL_L0).unwrap();
        NodeSegment::from_bytes(bytes).unwrap()
    }

    fn edge_segment(records: Vec<EdgeRecord>) -> EdgeSegment {
        let mut w = EdgeSegmentWriter::new();
        w.extend(records);
        let (bytes, _) = w.finish_to_vec(LEVEL_L0).unwrap();
        EdgeSegment::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_empty_node_segment() {
        let seg = node_segment(vec![]);
        assert_eq!(seg.record_count(), 0);
        assert_eq!(seg.key_range(), None);
        assert!(seg.find(42).is_none());
    }

    #[test]
    fn test_every_node_is_found_with_all_fields() {
        let records: Vec<NodeRecord> = (0..100)
            .map(|i| {
                let mut n = node(&format!("src/a.js->f{}", i), "FUNCTION", "src/a.js")
                    .with_metadata(format!("{{\"line\":{}}}", i));
                n.version = i as u64;
                n
            })
            .collect();
        let seg = node_segment(records.clone());
        assert_eq!(seg.record_count(), 100);
        for r in &records {
            assert_eq!(seg.find(r.id).as_ref(), Some(r));
        }
        // sorted by id
        let ids: Vec<u128> = seg.iter().map(|r| r.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_tombstone_flag_survives() {
        let n = node("gone", "CLASS", "src/b.js");
        let seg = node_segment(vec![n.tombstone(3)]);
        let found = seg.find(n.id).unwrap();
        assert!(found.deleted);
        assert_eq!(found.version, 3);
        assert_eq!(found.file, "src/b.js");
    }

    #[test]
    fn test_node_zone_map_pruning() {
        let seg = node_segment(vec![
            node("a", "FUNCTION", "src/a.js"),
            node("b", "http:route", "src/a.js"),
        ]);
        assert!(seg.may_contain_type("FUNCTION"));
        assert!(seg.may_contain_type("http:*"));
        assert!(!seg.may_contain_type("CLASS"));
        assert!(seg.may_contain_file("src/a.js"));
        assert!(!seg.may_contain_file("src/z.js"));
        assert_eq!(seg.rows_of_type("http:*").count(), 1);
    }

    #[test]
    fn test_unicode_and_empty_strings() {
        let n = NodeRecord::new("модуль->функция", "FUNCTION", "", "src/ü.js");
        let seg = node_segment(vec![n.clone()]);
        assert_eq!(seg.find(n.id), Some(n));
    }

    #[test]
    fn test_edges_by_src_and_dst() {
        let mut edges = Vec::new();
        for src in 1..=5u128 {
            for dst in 10..13u128 {
                edges.push(EdgeRecord::new(src, dst, "CALLS"));
            }
        }
        edges.push(EdgeRecord::new(3, 10, "CONTAINS").tombstone(2));
        let seg = edge_segment(edges);
        assert_eq!(seg.record_count(), 16);

        let out = seg.find_by_src(3);
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|e| e.src == 3));
        assert_eq!(out.iter().filter(|e| e.deleted).count(), 1);

        let inc = seg.find_by_dst(11);
        assert_eq!(inc.len(), 5);
        assert!(seg.find_by_src(99).is_empty());
        assert!(seg.may_contain_edge_type("CALLS"));
        assert!(!seg.may_contain_edge_type("IMPORTS"));
    }

    #[test]
    fn test_file_backed_segment_is_mapped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg_000001_nodes.seg");
        let n = node("x", "FUNCTION", "src/x.js");
        {
            let file = File::create(&path).unwrap();
            let mut out = BufWriter::new(file);
            let mut w = NodeSegmentWriter::new();
            w.add(n.clone());
            w.finish(&mut out, LEVEL_L0).unwrap();
        }
        let seg = NodeSegment::open(&path).unwrap();
        assert_eq!(seg.find(n.id), Some(n));
        assert!(matches!(seg.data, SegmentBytes::Mapped(_)));
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut w = NodeSegmentWriter::new();
        w.add(node("a", "FUNCTION", "src/a.js"));
        let (bytes, _) = w.finish_to_vec(LEVEL_L0).unwrap();

        // truncated
        let err = NodeSegment::from_bytes(bytes[..bytes.len() - 10].to_vec()).unwrap_err();
        assert!(err.is_integrity());

        // wrong type
        let err = EdgeSegment::from_bytes(bytes.clone()).unwrap_err();
        assert!(err.to_string().contains("Expected"));

        // record count lies about the column layout
        let mut lying = bytes.clone();
        lying[8..16].copy_from_slice(&5u64.to_le_bytes());
        assert!(NodeSegment::from_bytes(lying).is_err());

        // dangling string index in the name column
        let mut dangling = bytes;
        let name_col = HEADER_SIZE + 8;
        dangling[name_col..name_col + 4].copy_from_slice(&999u32.to_le_bytes());
        let err = NodeSegment::from_bytes(dangling).unwrap_err();
        assert!(err.to_string().contains("String index"));

        assert!(NodeSegment::from_bytes(Vec::new()).is_err());
    }
}
