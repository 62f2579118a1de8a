//! FactDB: a graph store for code-analysis facts.
//!
//! Nodes and edges live in a multi-shard LSM store (`storage_v2`): each
//! commit lands in a shard's write buffer, flushes produce immutable L0
//! segments, and compaction merges them into indexed L1 segments per
//! shard. A single-file engine (`graph::GraphEngine`) serves small or
//! legacy databases behind the same `GraphStore` trait.
//!
//! The `server` module exposes named databases to many clients over a
//! session-oriented MessagePack protocol.

pub mod config;
pub mod database_manager;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod server;
pub mod session;
pub mod storage;
pub mod storage_v2;

pub use config::{DatabaseConfig, EngineConfig, EngineKind};
pub use database_manager::{AccessMode, Database, DatabaseManager};
pub use error::{GraphError, Result};
pub use graph::{compute_node_id, GraphEngine, GraphEngineV2, GraphStore};
pub use session::{ClientSession, SessionRegistry};
pub use storage::{AttrQuery, EdgeRecord, NodeRecord};
