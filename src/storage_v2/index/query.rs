//! Loading and searching attribute indexes.
//!
//! `InvertedIndex` decodes one serialized index and answers exact and
//! prefix key lookups by binary search over its sorted lookup table.
//! `AttrIndex` pairs the by-type and by-file indexes of one segment.

use crate::error::{GraphError, Result};
use crate::storage::AttrQuery;
use crate::storage_v2::index::builder::BuiltIndexes;
use crate::storage_v2::index::format::{
    IndexEntry, IndexFileHeader, LookupTableEntry, ENTRY_SIZE, HEADER_SIZE, LOOKUP_SIZE,
};
use crate::storage_v2::types::read_u64;

fn corrupt(msg: impl Into<String>) -> GraphError {
    GraphError::InvalidFormat(msg.into())
}

#[derive(Debug)]
pub struct InvertedIndex {
    /// Concatenated keys, in lookup order
    string_table: Vec<u8>,
    /// Sorted by key
    lookup_entries: Vec<LookupTableEntry>,
    entries: Vec<IndexEntry>,
}

impl InvertedIndex {
    /// Decode and validate. Every key must be in bounds, valid UTF-8 and
    /// strictly greater than the one before; entry ranges must tile the
    /// entry section.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = IndexFileHeader::from_bytes(data)?;
        let st_len = header.string_table_len as usize;
        let lookup_count = header.lookup_count as usize;
        let entry_count = usize::try_from(header.entry_count)
            .map_err(|_| corrupt("index entry_count overflows usize"))?;

        let lookups_at = HEADER_SIZE + st_len;
        let entries_at = lookup_count
            .checked_mul(LOOKUP_SIZE)
            .and_then(|n| n.checked_add(lookups_at))
            .ok_or_else(|| corrupt("index lookup table overflows"))?;
        let end = entry_count
            .checked_mul(ENTRY_SIZE)
            .and_then(|n| n.checked_add(entries_at))
            .ok_or_else(|| corrupt("index entries overflow"))?;
        if end != data.len() {
            return Err(corrupt(format!(
                "index size mismatch: layout needs {} bytes, got {}",
                end,
                data.len()
            )));
        }

        let string_table = data[HEADER_SIZE..lookups_at].to_vec();
        let lookup_entries: Vec<LookupTableEntry> = (0..lookup_count)
            .map(|i| LookupTableEntry::from_bytes(data, lookups_at + i * LOOKUP_SIZE))
            .collect();
        let entries: Vec<IndexEntry> = (0..entry_count)
            .map(|i| IndexEntry::from_bytes(data, entries_at + i * ENTRY_SIZE))
            .collect();

        let mut next_entry = 0usize;
        let mut prev_key: Option<&str> = None;
        for lookup in &lookup_entries {
            let key_range = lookup.key_range();
            let key = string_table
                .get(key_range)
                .and_then(|b| std::str::from_utf8(b).ok())
                .ok_or_else(|| corrupt("index key out of bounds or not UTF-8"))?;
            if prev_key.map_or(false, |p| p >= key) {
                return Err(corrupt("index keys are not strictly sorted"));
            }
            prev_key = Some(key);
            if lookup.entry_offset as usize != next_entry || lookup.entry_count == 0 {
                return Err(corrupt("index entry ranges do not tile the entry section"));
            }
            next_entry += lookup.entry_count as usize;
        }
        if next_entry != entry_count {
            return Err(corrupt("index entry ranges do not cover every entry"));
        }

        Ok(Self {
            string_table,
            lookup_entries,
            entries,
        })
    }

    fn key_at(&self, lookup: &LookupTableEntry) -> &str {
        // Validated in from_bytes.
        std::str::from_utf8(&self.string_table[lookup.key_range()]).unwrap_or("")
    }

    /// Entries for exactly `key`, O(log K).
    pub fn lookup(&self, key: &str) -> &[IndexEntry] {
        match self
            .lookup_entries
            .binary_search_by(|l| self.key_at(l).cmp(key))
        {
            Ok(i) => &self.entries[self.lookup_entries[i].entry_range()],
            Err(_) => &[],
        }
    }

    /// Entries for every key starting with `prefix`. Keys sharing a prefix
    /// are contiguous in byte order.
    pub fn lookup_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a IndexEntry> + 'a {
        let start = self
            .lookup_entries
            .partition_point(|l| self.key_at(l) < prefix);
        self.lookup_entries[start..]
            .iter()
            .take_while(move |l| self.key_at(l).starts_with(prefix))
            .flat_map(move |l| self.entries[l.entry_range()].iter())
    }

    /// Entries matching a type pattern; a trailing `*` matches by prefix.
    pub fn lookup_pattern<'a>(
        &'a self,
        pattern: &'a str,
    ) -> Box<dyn Iterator<Item = &'a IndexEntry> + 'a> {
        match pattern.strip_suffix('*') {
            Some(prefix) => Box::new(self.lookup_prefix(prefix)),
            None => Box::new(self.lookup(pattern).iter()),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.lookup_entries
            .iter()
            .map(|l| self.key_at(l).to_string())
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn max_row(&self) -> Option<u32> {
        self.entries.iter().map(|e| e.row).max()
    }
}

/// By-type and by-file indexes of one node segment.
#[derive(Debug)]
pub struct AttrIndex {
    by_type: InvertedIndex,
    by_file: InvertedIndex,
}

impl AttrIndex {
    /// Load freshly built indexes for a segment of `record_count` rows.
    pub fn from_built(built: &BuiltIndexes, record_count: usize) -> Result<Self> {
        Self::checked(
            InvertedIndex::from_bytes(&built.by_type)?,
            InvertedIndex::from_bytes(&built.by_file)?,
            record_count,
        )
    }

    /// Load a sidecar written by `BuiltIndexes::to_sidecar_bytes`.
    pub fn from_sidecar(data: &[u8], record_count: usize) -> Result<Self> {
        if data.len() < 8 {
            return Err(corrupt("index sidecar too short"));
        }
        let split = usize::try_from(read_u64(data, 0))
            .ok()
            .and_then(|n| n.checked_add(8))
            .filter(|&n| n <= data.len())
            .ok_or_else(|| corrupt("index sidecar section length out of bounds"))?;
        Self::checked(
            InvertedIndex::from_bytes(&data[8..split])?,
            InvertedIndex::from_bytes(&data[split..])?,
            record_count,
        )
    }

    fn checked(
        by_type: InvertedIndex,
        by_file: InvertedIndex,
        record_count: usize,
    ) -> Result<Self> {
        for idx in [&by_type, &by_file] {
            if idx.max_row().map_or(false, |r| r as usize >= record_count) {
                return Err(corrupt(format!(
                    "index row out of range for a segment of {} rows",
                    record_count
                )));
            }
        }
        if by_type.entry_count() != by_file.entry_count() {
            return Err(corrupt("type and file indexes disagree on row count"));
        }
        Ok(Self { by_type, by_file })
    }

    pub fn by_type(&self) -> &InvertedIndex {
        &self.by_type
    }

    pub fn by_file(&self) -> &InvertedIndex {
        &self.by_file
    }

    /// Rows that may match `query`, ascending, or `None` when the query
    /// filters on neither type nor file. File wins when both are set.
    pub fn candidate_rows(&self, query: &AttrQuery) -> Option<Vec<usize>> {
        let mut rows: Vec<usize> = match (&query.file, &query.node_type) {
            (Some(f), _) => self.by_file.lookup(f).iter().map(|e| e.row as usize).collect(),
            (None, Some(t)) => self.by_type.lookup_pattern(t).map(|e| e.row as usize).collect(),
            (None, None) => return None,
        };
        rows.sort_unstable();
        Some(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NodeRecord;
    use crate::storage_v2::index::builder::build_inverted_indexes;
    use crate::storage_v2::segment::NodeSegment;
    use crate::storage_v2::types::LEVEL_L1;
    use crate::storage_v2::writer::NodeSegmentWriter;

    fn node(id: u128, node_type: &str, file: &str) -> NodeRecord {
        NodeRecord {
            id,
            semantic_key: format!("{}:{}", node_type, id),
            node_type: node_type.to_string(),
            name: format!("n{}", id),
            file: file.to_string(),
            version: 1,
            metadata: String::new(),
            deleted: false,
        }
    }

    fn sample() -> (NodeSegment, BuiltIndexes) {
        let records = vec![
            node(10, "http:route", "api.js"),
            node(20, "http:request", "client.js"),
            node(30, "httpx", "api.js"),
            node(40, "FUNCTION", "api.js"),
            node(50, "http:route", "server.js"),
        ];
        let (bytes, _) =
            NodeSegmentWriter::borrowed_to_vec(records.iter().collect(), LEVEL_L1).unwrap();
        let seg = NodeSegment::from_bytes(bytes).unwrap();
        let built = build_inverted_indexes(&seg).unwrap();
        (seg, built)
    }

    #[test]
    fn test_prefix_lookup_stays_inside_prefix() {
        let (_, built) = sample();
        let by_type = InvertedIndex::from_bytes(&built.by_type).unwrap();

        let mut ids: Vec<u128> = by_type.lookup_prefix("http:").map(|e| e.node_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![10, 20, 50]);

        let all: Vec<u128> = by_type.lookup_pattern("*").map(|e| e.node_id).collect();
        assert_eq!(all.len(), 5);
        assert_eq!(by_type.lookup_pattern("http:route").count(), 2);
        assert_eq!(by_type.lookup_prefix("zzz").count(), 0);
    }

    #[test]
    fn test_candidate_rows_prefers_file() {
        let (seg, built) = sample();
        let index = AttrIndex::from_built(&built, seg.record_count()).unwrap();

        let rows = index
            .candidate_rows(&AttrQuery::new().node_type("http:*").file("api.js"))
            .unwrap();
        assert_eq!(rows, vec![0, 2, 3]);

        let rows = index.candidate_rows(&AttrQuery::new().node_type("http:*")).unwrap();
        assert_eq!(rows, vec![0, 1, 4]);

        assert!(index.candidate_rows(&AttrQuery::new().name("n10")).is_none());
    }

    #[test]
    fn test_sidecar_reload() {
        let (seg, built) = sample();
        let sidecar = built.to_sidecar_bytes();
        let index = AttrIndex::from_sidecar(&sidecar, seg.record_count()).unwrap();
        assert_eq!(index.by_file().keys(), vec!["api.js", "client.js", "server.js"]);
        assert_eq!(index.by_type().entry_count(), 5);
    }

    #[test]
    fn test_sidecar_for_wrong_segment_rejected() {
        let (_, built) = sample();
        let err = AttrIndex::from_sidecar(&built.to_sidecar_bytes(), 3).unwrap_err();
        assert!(err.to_string().contains("row out of range"));
    }

    #[test]
    fn test_truncated_index_rejected() {
        let (_, built) = sample();
        let cut = &built.by_type[..built.by_type.len() - 1];
        assert!(InvertedIndex::from_bytes(cut).is_err());
        assert!(AttrIndex::from_sidecar(&[1, 2, 3], 5).is_err());
    }

    #[test]
    fn test_unsorted_keys_rejected() {
        let (_, built) = sample();
        let mut bytes = built.by_file.clone();
        // Key data starts right after the header: "api.js" -> "zpi.js".
        bytes[HEADER_SIZE] = b'z';
        let err = InvertedIndex::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("not strictly sorted"));
    }
}
