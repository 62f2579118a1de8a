//! Deduplicated string table attached to each segment.
//!
//! Columns store u32 indexes into this table instead of inline strings.
//!
//! Binary format:
//! ```text
//! [string_count: u32 LE]
//! [total_data_len: u32 LE]
//! [entries: (offset: u32 LE, length: u32 LE) x string_count]
//! [data: u8 x total_data_len]                  // concatenated UTF-8
//! ```

use std::collections::HashMap;
use std::io::Write;

use crate::error::{GraphError, Result};
use crate::storage_v2::types::read_u32;

#[derive(Debug, Default)]
pub struct StringTable {
    data: Vec<u8>,
    /// (offset, length) into `data`, one per string
    entries: Vec<(u32, u32)>,
    /// Write-side dedup index; empty on tables decoded from bytes.
    index: HashMap<String, u32>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning its 0-based index.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let offset = self.data.len() as u32;
        let idx = self.entries.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.entries.push((offset, s.len() as u32));
        self.index.insert(s.to_string(), idx);
        idx
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        let (offset, length) = *self.entries.get(index as usize)?;
        let start = offset as usize;
        let end = start + length as usize;
        self.data
            .get(start..end)
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Like `get`, but a dangling index is reported as corruption.
    pub fn resolve(&self, index: u32) -> Result<&str> {
        self.get(index).ok_or_else(|| {
            GraphError::InvalidFormat(format!(
                "String index {} out of range ({} strings)",
                index,
                self.entries.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        if self.data.len() > u32::MAX as usize {
            return Err(GraphError::InvalidFormat(
                "String table exceeds 4 GiB".into(),
            ));
        }
        writer.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        writer.write_all(&(self.data.len() as u32).to_le_bytes())?;
        for &(offset, length) in &self.entries {
            writer.write_all(&offset.to_le_bytes())?;
            writer.write_all(&length.to_le_bytes())?;
        }
        writer.write_all(&self.data)?;
        Ok(())
    }

    /// Decode and validate every entry (bounds and UTF-8).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(GraphError::InvalidFormat("String table too small".into()));
        }
        let string_count = read_u32(bytes, 0) as usize;
        let total_data_len = read_u32(bytes, 4) as usize;

        let data_start = string_count
            .checked_mul(8)
            .and_then(|n| n.checked_add(8))
            .ok_or_else(|| GraphError::InvalidFormat("String table size overflow".into()))?;
        if bytes.len() < data_start {
            return Err(GraphError::InvalidFormat(
                "String table entries truncated".into(),
            ));
        }
        if bytes.len() - data_start < total_data_len {
            return Err(GraphError::InvalidFormat(
                "String table data truncated".into(),
            ));
        }

        let data = bytes[data_start..data_start + total_data_len].to_vec();
        let mut entries = Vec::with_capacity(string_count);
        for i in 0..string_count {
            let pos = 8 + i * 8;
            let offset = read_u32(bytes, pos);
            let length = read_u32(bytes, pos + 4);
            let end = offset as usize + length as usize;
            let slice = data.get(offset as usize..end).ok_or_else(|| {
                GraphError::InvalidFormat("String table entry out of bounds".into())
            })?;
            std::str::from_utf8(slice).map_err(|_| {
                GraphError::InvalidFormat("String table contains invalid UTF-8".into())
            })?;
            entries.push((offset, length));
        }

        Ok(Self {
            data,
            entries,
            index: HashMap::new(),
        })
    }

    pub fn serialized_size(&self) -> usize {
        8 + self.entries.len() * 8 + self.data.len()
    }
}
