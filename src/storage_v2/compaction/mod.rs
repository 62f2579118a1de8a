//! LSM compaction for the multi-shard store.
//!
//! Merges a shard's L0 (flush) segments and its L1 run into a fresh,
//! non-overlapping L1 run, dropping tombstones and superseded versions.

pub mod coordinator;
pub mod merge;
pub mod types;
pub mod worker;

pub use coordinator::{compact_shard, should_compact, ShardCompaction};
pub use merge::{merge_edge_segments, merge_node_segments, MergeStats};
pub use types::*;
pub use worker::CompactionWorker;
