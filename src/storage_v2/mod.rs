//! Multi-shard LSM storage engine.
//!
//! Immutable, mmap-based columnar segments with bloom filters, zone maps
//! and per-segment string tables, organized per shard into L0 and L1 and
//! tracked by versioned manifests. L1 node segments carry by-type and
//! by-file attribute indexes.

pub mod types;
pub mod string_table;
pub mod bloom;
pub mod zone_map;
pub mod writer;
pub mod segment;
pub mod manifest;
pub mod write_buffer;
pub mod shard;
pub mod shard_planner;
pub mod multi_shard;
pub mod compaction;
pub mod index;
pub mod resource;

pub use types::*;
pub use bloom::BloomFilter;
pub use zone_map::ZoneMap;
pub use writer::{EdgeSegmentWriter, NodeSegmentWriter};
pub use segment::{EdgeSegment, NodeSegment};
pub use index::AttrIndex;

pub use manifest::{Manifest, ManifestStats, ManifestStore, SegmentDescriptor};
pub use write_buffer::WriteBuffer;
pub use shard::{Shard, ShardStats};
pub use shard_planner::ShardPlanner;
pub use multi_shard::{FlushStats, MultiShardStore, StoreSnapshot, StoreStats};
pub use compaction::{CompactionConfig, CompactionInfo, CompactionResult, CompactionWorker};
pub use resource::{ResourceManager, SystemResources, TuningProfile};
