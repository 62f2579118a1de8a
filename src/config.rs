//! Engine, database and server configuration.
//!
//! - `EngineConfig`: runtime limits of one store (write buffer, shards,
//!   compaction). Defaults come from `ResourceManager::auto_tune()`.
//! - `DatabaseConfig`: persistent per-database settings, written once to
//!   `db_config.json` at creation.
//! - `ServerConfig`: command line of `factdb-server`.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage_v2::compaction::CompactionConfig;
use crate::storage_v2::manifest::{write_atomic, DEFAULT_MANIFEST_RETENTION};
use crate::storage_v2::resource::{ResourceManager, TuningProfile};

pub const DB_CONFIG_FILE: &str = "db_config.json";

// ── Engine Config ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Shards for newly created databases. Existing databases keep the
    /// count recorded in their `db_config.json`.
    pub shard_count: u16,
    /// Auto-flush once the buffer holds more node records than this
    pub write_buffer_node_limit: usize,
    pub write_buffer_edge_limit: usize,
    pub write_buffer_byte_limit: usize,
    /// Old manifest files kept on disk
    pub manifest_retention: usize,
    pub compaction: CompactionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_profile(&ResourceManager::auto_tune())
    }
}

impl EngineConfig {
    pub fn from_profile(profile: &TuningProfile) -> Self {
        Self {
            shard_count: profile.shard_count.max(1),
            write_buffer_node_limit: profile.write_buffer_node_limit,
            write_buffer_edge_limit: profile.write_buffer_edge_limit,
            write_buffer_byte_limit: profile.write_buffer_byte_limit,
            manifest_retention: DEFAULT_MANIFEST_RETENTION,
            compaction: CompactionConfig {
                segment_threshold: profile.segment_threshold,
                l1_target_records: profile.l1_target_records,
                threads: profile.compaction_threads,
                background: true,
            },
        }
    }

    /// Host-independent settings: `TuningProfile::default()` limits with
    /// synchronous compaction only.
    pub fn conservative() -> Self {
        let mut config = Self::from_profile(&TuningProfile::default());
        config.compaction.background = false;
        config
    }

    pub fn with_shard_count(mut self, shard_count: u16) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    pub fn with_background_compaction(mut self, enabled: bool) -> Self {
        self.compaction.background = enabled;
        self
    }

    /// Load overrides from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

// ── Database Config ────────────────────────────────────────────────

/// Storage engine behind a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Single-file in-memory engine with a bincode snapshot
    V1,
    /// Multi-shard LSM engine
    #[default]
    V2,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::V1 => "v1",
            EngineKind::V2 => "v2",
        }
    }
}

/// Persistent database configuration, written once at creation and read
/// on every open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub shard_count: u16,
    #[serde(default)]
    pub engine: EngineKind,
}

impl DatabaseConfig {
    pub fn new(engine: EngineKind, shard_count: u16) -> Self {
        Self {
            shard_count: shard_count.max(1),
            engine,
        }
    }

    /// `None` if the database root has no config file.
    pub fn read_from(db_path: &Path) -> Result<Option<Self>> {
        let path = db_path.join(DB_CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn write_to(&self, db_path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&db_path.join(DB_CONFIG_FILE), &json)
    }
}

// ── Server Config ──────────────────────────────────────────────────

#[derive(Parser, Debug, Clone)]
#[command(name = "factdb-server", version)]
#[command(about = "Graph store for code-analysis facts, served over a MessagePack protocol")]
pub struct ServerConfig {
    /// Path of the default database (opened for legacy clients)
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,

    /// Unix socket path
    #[arg(long, default_value = "/tmp/factdb.sock")]
    pub socket: PathBuf,

    /// Base directory for named databases (default: parent of DB_PATH)
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Also serve the protocol over WebSocket on this address
    #[arg(long, value_name = "HOST:PORT")]
    pub ws_addr: Option<String>,

    /// Collect per-operation latency metrics
    #[arg(long)]
    pub metrics: bool,

    /// JSON file with engine overrides
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl ServerConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            self.db_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => EngineConfig::from_json_file(path),
            None => Ok(EngineConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_conservative_engine_config() {
        let config = EngineConfig::conservative();
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.compaction.segment_threshold, 4);
        assert!(!config.compaction.background);
        assert_eq!(config.with_shard_count(0).shard_count, 1);
    }

    #[test]
    fn test_engine_config_json_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"shard_count": 2, "compaction": {"segment_threshold": 9}}"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.shard_count, 2);
        assert_eq!(config.compaction.segment_threshold, 9);
        assert!(config.compaction.background);
    }

    #[test]
    fn test_database_config_roundtrip_and_default_engine() {
        let dir = TempDir::new().unwrap();
        assert!(DatabaseConfig::read_from(dir.path()).unwrap().is_none());

        DatabaseConfig::new(EngineKind::V1, 1).write_to(dir.path()).unwrap();
        let read = DatabaseConfig::read_from(dir.path()).unwrap().unwrap();
        assert_eq!(read.engine, EngineKind::V1);

        fs::write(dir.path().join(DB_CONFIG_FILE), r#"{"shard_count": 3}"#).unwrap();
        let legacy = DatabaseConfig::read_from(dir.path()).unwrap().unwrap();
        assert_eq!(legacy.engine, EngineKind::V2);
        assert_eq!(legacy.shard_count, 3);
    }

    #[test]
    fn test_server_config_parse() {
        let config = ServerConfig::parse_from([
            "factdb-server",
            "/data/default.factdb",
            "--socket",
            "/tmp/x.sock",
            "--metrics",
        ]);
        assert_eq!(config.socket, PathBuf::from("/tmp/x.sock"));
        assert!(config.metrics);
        assert_eq!(config.data_dir(), PathBuf::from("/data"));
        assert!(config.ws_addr.is_none());
    }
}
