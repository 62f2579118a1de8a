//! Attribute indexes for L1 node segments.
//!
//! - `format` -- on-disk layout (header, lookup table, entries)
//! - `builder` -- builds by-type and by-file indexes at compaction
//! - `query` -- loads indexes and answers key and prefix lookups
//!
//! Each L1 node segment `seg_NNNNNN_nodes.seg` gets a sidecar
//! `seg_NNNNNN_nodes.idx`. A missing or unreadable sidecar is rebuilt
//! from the segment on open.

pub mod builder;
pub mod format;
pub mod query;

use std::path::{Path, PathBuf};

pub use builder::{build_inverted_indexes, BuiltIndexes};
pub use format::{IndexEntry, IndexFileHeader, LookupTableEntry};
pub use query::{AttrIndex, InvertedIndex};

pub const SIDECAR_EXTENSION: &str = "idx";

/// Sidecar path for the segment file at `segment_path`.
pub fn sidecar_path(segment_path: &Path) -> PathBuf {
    segment_path.with_extension(SIDECAR_EXTENSION)
}
