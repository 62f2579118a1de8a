//! Zone map: per-segment summary used to skip segments without reading them.
//!
//! Two kinds of summary:
//! - the primary key range `[min_key, max_key]` (node id, or edge src),
//!   which lets point lookups skip segments whose range excludes the key;
//! - per-field distinct value sets (`node_type`, `file`, `edge_type`),
//!   which let attribute scans skip segments that cannot match.
//!
//! ## Binary format
//!
//! ```text
//! [has_range: u32 LE]                     // 0 or 1
//! [reserved: u32 LE]
//! [min_key: u128 LE]
//! [max_key: u128 LE]
//! [field_count: u32 LE]
//! For each field (sorted by name):
//!   [field_name_len: u16 LE] [field_name: utf8]
//!   [value_count: u32 LE]
//!   For each value (sorted):
//!     [value_len: u32 LE] [value: utf8]
//! ```
//!
//! A field with more than MAX_ZONE_MAP_VALUES_PER_FIELD values is not
//! written; an absent field means "any value possible".

use std::collections::{HashMap, HashSet};
use std::io::Write;

use crate::error::{GraphError, Result};
use crate::storage_v2::types::{read_u128, read_u32, MAX_ZONE_MAP_VALUES_PER_FIELD};

pub const FIELD_NODE_TYPE: &str = "node_type";
pub const FIELD_FILE: &str = "file";
pub const FIELD_EDGE_TYPE: &str = "edge_type";

const RANGE_SECTION_SIZE: usize = 40;

#[derive(Debug, Clone, Default)]
pub struct ZoneMap {
    key_range: Option<(u128, u128)>,
    fields: HashMap<String, HashSet<String>>,
}

impl ZoneMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Widen the key range to include `key`.
    pub fn add_key(&mut self, key: u128) {
        self.key_range = Some(match self.key_range {
            None => (key, key),
            Some((lo, hi)) => (lo.min(key), hi.max(key)),
        });
    }

    pub fn add(&mut self, field: &str, value: &str) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .insert(value.to_string());
    }

    pub fn key_range(&self) -> Option<(u128, u128)> {
        self.key_range
    }

    /// False only when the key is provably outside this segment.
    pub fn may_contain_key(&self, key: u128) -> bool {
        match self.key_range {
            Some((lo, hi)) => key >= lo && key <= hi,
            None => false,
        }
    }

    /// False only when the field is tracked and the value is absent.
    pub fn may_contain(&self, field: &str, value: &str) -> bool {
        match self.fields.get(field) {
            Some(values) => values.contains(value),
            None => true,
        }
    }

    /// Prefix-aware variant for wildcard type filters (`http:*`).
    pub fn may_contain_prefix(&self, field: &str, prefix: &str) -> bool {
        match self.fields.get(field) {
            Some(values) => values.iter().any(|v| v.starts_with(prefix)),
            None => true,
        }
    }

    pub fn get_values(&self, field: &str) -> Option<&HashSet<String>> {
        self.fields.get(field)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let (has_range, lo, hi) = match self.key_range {
            Some((lo, hi)) => (1u32, lo, hi),
            None => (0u32, 0, 0),
        };
        writer.write_all(&has_range.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&lo.to_le_bytes())?;
        writer.write_all(&hi.to_le_bytes())?;

        let mut written: Vec<(&String, &HashSet<String>)> = self
            .fields
            .iter()
            .filter(|(name, values)| {
                if values.len() > MAX_ZONE_MAP_VALUES_PER_FIELD {
                    tracing::warn!(
                        field = name.as_str(),
                        count = values.len(),
                        max = MAX_ZONE_MAP_VALUES_PER_FIELD,
                        "Zone map field exceeds cap, omitting it"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        written.sort_by_key(|(name, _)| name.as_str());

        writer.write_all(&(written.len() as u32).to_le_bytes())?;
        for (name, values) in written {
            writer.write_all(&(name.len() as u16).to_le_bytes())?;
            writer.write_all(name.as_bytes())?;
            let mut sorted: Vec<&String> = values.iter().collect();
            sorted.sort();
            writer.write_all(&(sorted.len() as u32).to_le_bytes())?;
            for v in sorted {
                writer.write_all(&(v.len() as u32).to_le_bytes())?;
                writer.write_all(v.as_bytes())?;
            }
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RANGE_SECTION_SIZE + 4 {
            return Err(GraphError::InvalidFormat("Zone map too small".into()));
        }
        let key_range = match read_u32(bytes, 0) {
            0 => None,
            1 => Some((read_u128(bytes, 8), read_u128(bytes, 24))),
            other => {
                return Err(GraphError::InvalidFormat(format!(
                    "Zone map has invalid range flag {}",
                    other
                )))
            }
        };

        let mut pos = RANGE_SECTION_SIZE;
        let field_count = read_u32(bytes, pos) as usize;
        pos += 4;

        let mut fields = HashMap::new();
        for _ in 0..field_count {
            let name_len = u16::from_le_bytes([
                *byte_at(bytes, pos)?,
                *byte_at(bytes, pos + 1)?,
            ]) as usize;
            pos += 2;
            let name = utf8_at(bytes, pos, name_len)?;
            pos += name_len;

            let value_count = u32_at(bytes, pos)? as usize;
            pos += 4;
            let mut values = HashSet::new();
            for _ in 0..value_count {
                let len = u32_at(bytes, pos)? as usize;
                pos += 4;
                values.insert(utf8_at(bytes, pos, len)?);
                pos += len;
            }
            fields.insert(name, values);
        }

        Ok(Self { key_range, fields })
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = RANGE_SECTION_SIZE + 4;
        for (name, values) in &self.fields {
            if values.len() > MAX_ZONE_MAP_VALUES_PER_FIELD {
                continue;
            }
            size += 2 + name.len() + 4;
            size += values.iter().map(|v| 4 + v.len()).sum::<usize>();
        }
        size
    }
}

fn byte_at(bytes: &[u8], pos: usize) -> Result<&u8> {
    bytes
        .get(pos)
        .ok_or_else(|| GraphError::InvalidFormat("Zone map truncated".into()))
}

fn u32_at(bytes: &[u8], pos: usize) -> Result<u32> {
    if pos + 4 > bytes.len() {
        return Err(GraphError::InvalidFormat("Zone map truncated".into()));
    }
    Ok(read_u32(bytes, pos))
}

fn utf8_at(bytes: &[u8], pos: usize, len: usize) -> Result<String> {
    let slice = pos
        .checked_add(len)
        .and_then(|end| bytes.get(pos..end))
        .ok_or_else(|| GraphError::InvalidFormat("Zone map truncated".into()))?;
    std::str::from_utf8(slice)
        .map(str::to_string)
        .map_err(|_| GraphError::InvalidFormat("Zone map contains invalid UTF-8".into()))
}
