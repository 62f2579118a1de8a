//! DatabaseManager - thread-safe registry of named databases
//!
//! One server hosts many isolated databases. Each lives in
//! `<base_path>/<name>.factdb` (persistent) or only in memory (ephemeral).
//!
//! - Persistent databases found on disk are opened lazily on first use,
//!   with the engine recorded in their `db_config.json`.
//! - Connection counts decide when a database may be dropped and when an
//!   ephemeral database disappears.
//! - At most one session holds the exclusive writer slot of a database.
//!
//! ```no_run
//! use factdb::config::EngineConfig;
//! use factdb::database_manager::{AccessMode, DatabaseManager};
//! use std::path::PathBuf;
//!
//! let manager = DatabaseManager::new(PathBuf::from("/data"), EngineConfig::default());
//! manager.create_database("scratch", true).unwrap();
//! let db = manager.acquire("scratch", AccessMode::ReadWrite, 1).unwrap();
//! // ...
//! db.release_writer(1);
//! db.remove_connection();
//! manager.cleanup_ephemeral_if_unused("scratch");
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{DatabaseConfig, EngineConfig, EngineKind};
use crate::error::{GraphError, Result};
use crate::graph::{GraphEngine, GraphEngineV2, GraphStore};
use crate::storage_v2::multi_shard::FlushStats;

/// Unique identifier for a client connection
pub type ClientId = usize;

/// Directory suffix of persistent databases
pub const DATABASE_EXTENSION: &str = "factdb";

/// Name legacy clients are bound to
pub const DEFAULT_DATABASE: &str = "default";

/// Per-session access mode.
///
/// Any number of `ReadOnly` sessions may share a database; `ReadWrite`
/// sessions opened through `openDatabase` are exclusive writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    /// Wire protocol string
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "ro",
            AccessMode::ReadWrite => "rw",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

impl FromStr for AccessMode {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rw" => Ok(AccessMode::ReadWrite),
            "ro" => Ok(AccessMode::ReadOnly),
            other => Err(GraphError::InvalidRequest(format!(
                "unknown access mode '{}', expected \"rw\" or \"ro\"",
                other
            ))),
        }
    }
}

/// A named database: one engine plus connection bookkeeping.
pub struct Database {
    pub name: String,
    pub engine: Box<dyn GraphStore>,
    pub ephemeral: bool,
    connection_count: AtomicUsize,
    /// Session holding the exclusive writer slot
    writer: Mutex<Option<ClientId>>,
}

impl Database {
    pub fn new(name: String, engine: Box<dyn GraphStore>, ephemeral: bool) -> Self {
        Self {
            name,
            engine,
            ephemeral,
            connection_count: AtomicUsize::new(0),
            writer: Mutex::new(None),
        }
    }

    pub fn add_connection(&self) {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_connection(&self) {
        // Saturating: a double close must not wrap the counter.
        let _ = self
            .connection_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub fn is_in_use(&self) -> bool {
        self.connection_count() > 0
    }

    /// Take the exclusive writer slot. Re-claiming by the holder succeeds.
    pub fn try_claim_writer(&self, client: ClientId) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match *writer {
            Some(holder) if holder != client => Err(GraphError::ModeConflict(self.name.clone())),
            _ => {
                *writer = Some(client);
                Ok(())
            }
        }
    }

    /// Release the writer slot if `client` holds it.
    pub fn release_writer(&self, client: ClientId) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if *writer == Some(client) {
            *writer = None;
        }
    }

    pub fn writer(&self) -> Option<ClientId> {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node_count(&self) -> Result<usize> {
        self.engine.node_count()
    }

    pub fn edge_count(&self) -> Result<usize> {
        self.engine.edge_count()
    }

    pub fn info(&self) -> DatabaseInfo {
        DatabaseInfo {
            name: self.name.clone(),
            ephemeral: self.ephemeral,
            open: true,
            engine: Some(self.engine.kind()),
            node_count: self.node_count().ok(),
            edge_count: self.edge_count().ok(),
            connection_count: self.connection_count(),
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("engine", &self.engine.kind())
            .field("ephemeral", &self.ephemeral)
            .field("connection_count", &self.connection_count())
            .finish()
    }
}

/// Entry of the `listDatabases` response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    pub name: String,
    pub ephemeral: bool,
    /// False for databases found on disk but not opened yet
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_count: Option<usize>,
    pub connection_count: usize,
}

/// Registry of named databases.
pub struct DatabaseManager {
    databases: RwLock<HashMap<String, Arc<Database>>>,
    /// Directory holding persistent databases
    base_path: PathBuf,
    /// Engine settings for databases created or opened by this manager
    engine_config: EngineConfig,
}

impl DatabaseManager {
    pub fn new(base_path: PathBuf, engine_config: EngineConfig) -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            base_path,
            engine_config,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Allowed characters: [a-zA-Z0-9_-], 1-128 characters
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > 128 {
            return Err(GraphError::InvalidDatabaseName(
                "Name must be 1-128 characters".to_string(),
            ));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(GraphError::InvalidDatabaseName(
                "Name can only contain a-z, A-Z, 0-9, _, -".to_string(),
            ));
        }
        Ok(())
    }

    fn database_path(&self, name: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}", name, DATABASE_EXTENSION))
    }

    /// Name of a persistent database directory, if `path` is one.
    fn name_from_path(path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != DATABASE_EXTENSION {
            return None;
        }
        if !path.join(crate::config::DB_CONFIG_FILE).is_file() {
            return None;
        }
        let name = path.file_stem()?.to_str()?.to_string();
        Self::validate_name(&name).ok().map(|_| name)
    }

    /// Persistent databases present in `base_path`, opened or not.
    fn on_disk_names(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| Self::name_from_path(&entry.path()))
            .collect()
    }

    /// Sorted names of every database, registered or on disk.
    pub fn database_names(&self) -> Vec<String> {
        let databases = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        self.names_with(&databases)
    }

    fn names_with(&self, databases: &HashMap<String, Arc<Database>>) -> Vec<String> {
        let mut names: BTreeSet<String> = databases.keys().cloned().collect();
        names.extend(self.on_disk_names());
        names.into_iter().collect()
    }

    /// `DatabaseNotFound` for `name`. Takes the map so callers holding the
    /// lock can build it.
    fn not_found(&self, databases: &HashMap<String, Arc<Database>>, name: &str) -> GraphError {
        GraphError::DatabaseNotFound {
            name: name.to_string(),
            available: self.names_with(databases),
        }
    }

    /// Create a database with the default (LSM) engine.
    ///
    /// `ephemeral` databases live in memory only and are removed when the
    /// last session closes them.
    pub fn create_database(&self, name: &str, ephemeral: bool) -> Result<()> {
        self.create_database_with(name, ephemeral, EngineKind::V2)
    }

    pub fn create_database_with(&self, name: &str, ephemeral: bool, engine: EngineKind) -> Result<()> {
        Self::validate_name(name)?;

        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        let db_path = self.database_path(name);
        if databases.contains_key(name) || (!ephemeral && db_path.exists()) {
            return Err(GraphError::DatabaseExists(name.to_string()));
        }

        let engine: Box<dyn GraphStore> = match (engine, ephemeral) {
            (EngineKind::V1, true) => Box::new(GraphEngine::ephemeral()),
            (EngineKind::V1, false) => Box::new(GraphEngine::create(&db_path)?),
            (EngineKind::V2, true) => Box::new(GraphEngineV2::ephemeral(self.engine_config.clone())?),
            (EngineKind::V2, false) => Box::new(GraphEngineV2::create(&db_path, self.engine_config.clone())?),
        };

        info!(database = name, ephemeral, engine = engine.kind().as_str(), "Created database");
        databases.insert(name.to_string(), Arc::new(Database::new(name.to_string(), engine, ephemeral)));
        Ok(())
    }

    /// Look up a database, opening it from disk on first use.
    ///
    /// The returned handle carries no connection: a concurrent
    /// `drop_database` may still remove it. Sessions bind through
    /// [`DatabaseManager::acquire`].
    pub fn get_database(&self, name: &str) -> Result<Arc<Database>> {
        if let Some(db) = self.databases.read().unwrap_or_else(PoisonError::into_inner).get(name) {
            return Ok(Arc::clone(db));
        }
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        self.lookup_or_open(&mut databases, name)
    }

    /// Bind a session to `name`: look it up (opening from disk if needed),
    /// claim the writer slot for `ReadWrite` and count the connection, all
    /// under the registry lock. `drop_database` and ephemeral cleanup take
    /// the same lock, so they either run before the lookup or see the
    /// connection.
    pub fn acquire(&self, name: &str, mode: AccessMode, client: ClientId) -> Result<Arc<Database>> {
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        let db = self.lookup_or_open(&mut databases, name)?;
        if mode.is_write() {
            db.try_claim_writer(client)?;
        }
        db.add_connection();
        Ok(db)
    }

    /// Like `acquire`, without touching the writer slot. Legacy sessions
    /// write through this.
    pub fn acquire_shared(&self, name: &str) -> Result<Arc<Database>> {
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        let db = self.lookup_or_open(&mut databases, name)?;
        db.add_connection();
        Ok(db)
    }

    fn lookup_or_open(
        &self,
        databases: &mut HashMap<String, Arc<Database>>,
        name: &str,
    ) -> Result<Arc<Database>> {
        if let Some(db) = databases.get(name) {
            return Ok(Arc::clone(db));
        }
        if Self::validate_name(name).is_err() {
            return Err(self.not_found(databases, name));
        }
        let db_path = self.database_path(name);
        if Self::name_from_path(&db_path).is_none() {
            return Err(self.not_found(databases, name));
        }

        let engine = open_engine(&db_path, &self.engine_config)?;
        info!(database = name, engine = engine.kind().as_str(), "Opened database");
        let db = Arc::new(Database::new(name.to_string(), engine, false));
        databases.insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
            || Self::name_from_path(&self.database_path(name)).is_some()
    }

    /// Drop a database and delete its files. Fails while any session has
    /// it open.
    pub fn drop_database(&self, name: &str) -> Result<()> {
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);

        let path = match databases.get(name) {
            Some(db) => {
                if db.is_in_use() {
                    return Err(GraphError::DatabaseInUse(name.to_string()));
                }
                let path = db.engine.path().map(Path::to_path_buf);
                databases.remove(name);
                path
            }
            None => {
                let path = self.database_path(name);
                if Self::validate_name(name).is_err() || Self::name_from_path(&path).is_none() {
                    return Err(self.not_found(&databases, name));
                }
                Some(path)
            }
        };

        if let Some(path) = path {
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }
        info!(database = name, "Dropped database");
        Ok(())
    }

    /// Every database, sorted by name. Databases on disk that no session
    /// has opened yet are listed without counts.
    pub fn list_databases(&self) -> Vec<DatabaseInfo> {
        let databases = self.databases.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<DatabaseInfo> = databases.values().map(|db| db.info()).collect();
        for name in self.on_disk_names() {
            if !databases.contains_key(&name) {
                list.push(DatabaseInfo {
                    name,
                    ephemeral: false,
                    open: false,
                    engine: None,
                    node_count: None,
                    edge_count: None,
                    connection_count: 0,
                });
            }
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Remove an ephemeral database once its last connection is gone.
    pub fn cleanup_ephemeral_if_unused(&self, name: &str) {
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(db) = databases.get(name) {
            if db.ephemeral && !db.is_in_use() {
                databases.remove(name);
                info!(database = name, "Removed ephemeral database");
            }
        }
    }

    /// Register `db_path` as the "default" database, creating it if
    /// needed. Legacy clients are bound to it.
    pub fn create_default_from_path(&self, db_path: &Path) -> Result<()> {
        let engine: Box<dyn GraphStore> = if DatabaseConfig::read_from(db_path)?.is_some() {
            open_engine(db_path, &self.engine_config)?
        } else {
            Box::new(GraphEngineV2::create(db_path, self.engine_config.clone())?)
        };

        let database = Arc::new(Database::new(DEFAULT_DATABASE.to_string(), engine, false));
        self.databases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(DEFAULT_DATABASE.to_string(), database);
        Ok(())
    }

    /// Flush every open persistent database. Used on shutdown.
    pub fn flush_all(&self) -> Vec<(String, Result<FlushStats>)> {
        let databases: Vec<Arc<Database>> = self
            .databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|db| !db.ephemeral)
            .cloned()
            .collect();

        databases
            .into_iter()
            .map(|db| {
                let result = db.engine.flush();
                if let Err(e) = &result {
                    warn!(database = %db.name, error = %e, "Flush failed");
                }
                (db.name.clone(), result)
            })
            .collect()
    }
}

/// Open a database directory with the engine its `db_config.json` names.
pub fn open_engine(db_path: &Path, config: &EngineConfig) -> Result<Box<dyn GraphStore>> {
    let db_config = DatabaseConfig::read_from(db_path)?.ok_or_else(|| {
        GraphError::Manifest(format!("{} has no db_config.json", db_path.display()))
    })?;
    Ok(match db_config.engine {
        EngineKind::V1 => Box::new(GraphEngine::open(db_path)?),
        EngineKind::V2 => Box::new(GraphEngineV2::open(db_path, config.clone())?),
    })
}

#[cfg(test)]
mod database_tests {
    use super::*;
    use crate::storage::NodeRecord;
    use std::thread;

    fn database(name: &str) -> Database {
        Database::new(name.to_string(), Box::new(GraphEngine::ephemeral()), true)
    }

    #[test]
    fn test_connection_count_starts_at_zero() {
        let db = database("test");
        assert_eq!(db.connection_count(), 0);
        assert!(!db.is_in_use());
    }

    #[test]
    fn test_add_remove_connection() {
        let db = database("test");
        db.add_connection();
        db.add_connection();
        assert_eq!(db.connection_count(), 2);
        db.remove_connection();
        db.remove_connection();
        assert!(!db.is_in_use());
        // Extra close saturates at zero
        db.remove_connection();
        assert_eq!(db.connection_count(), 0);
    }

    #[test]
    fn test_concurrent_connection_tracking() {
        let db = Arc::new(database("test"));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    db.add_connection();
                    thread::sleep(std::time::Duration::from_millis(1));
                    db.remove_connection();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(db.connection_count(), 0);
    }

    #[test]
    fn test_writer_slot_is_exclusive() {
        let db = database("shared");
        db.try_claim_writer(1).unwrap();
        db.try_claim_writer(1).unwrap();
        let err = db.try_claim_writer(2).unwrap_err();
        assert!(matches!(err, GraphError::ModeConflict(ref n) if n == "shared"));

        // Only the holder can release
        db.release_writer(2);
        assert_eq!(db.writer(), Some(1));
        db.release_writer(1);
        db.try_claim_writer(2).unwrap();
    }

    #[test]
    fn test_node_and_edge_count() {
        let db = database("test");
        db.engine
            .commit(vec![NodeRecord::new("a->f", "FUNCTION", "f", "a.js")], vec![], &[])
            .unwrap();
        assert_eq!(db.node_count().unwrap(), 1);
        assert_eq!(db.edge_count().unwrap(), 0);
    }
}

#[cfg(test)]
mod manager_tests {
    use super::*;
    use crate::storage::NodeRecord;
    use tempfile::{tempdir, TempDir};

    fn manager() -> (TempDir, DatabaseManager) {
        let dir = tempdir().unwrap();
        let manager = DatabaseManager::new(dir.path().to_path_buf(), EngineConfig::conservative());
        (dir, manager)
    }

    // ── Creation ──

    #[test]
    fn test_create_database_persistent() {
        let (dir, manager) = manager();
        manager.create_database("mydb", false).unwrap();
        assert!(manager.database_exists("mydb"));
        assert!(dir.path().join("mydb.factdb").join("db_config.json").exists());
        assert_eq!(manager.get_database("mydb").unwrap().engine.kind(), EngineKind::V2);
    }

    #[test]
    fn test_create_database_ephemeral() {
        let (dir, manager) = manager();
        manager.create_database("testdb", true).unwrap();
        let db = manager.get_database("testdb").unwrap();
        assert!(db.ephemeral);
        assert!(db.engine.is_ephemeral());
        assert!(!dir.path().join("testdb.factdb").exists());
    }

    #[test]
    fn test_create_legacy_engine_database() {
        let (_dir, manager) = manager();
        manager.create_database_with("old", false, EngineKind::V1).unwrap();
        assert_eq!(manager.get_database("old").unwrap().engine.kind(), EngineKind::V1);
    }

    #[test]
    fn test_create_database_already_exists() {
        let (_dir, manager) = manager();
        manager.create_database("mydb", false).unwrap();
        let result = manager.create_database("mydb", true);
        assert!(matches!(result, Err(GraphError::DatabaseExists(_))));
    }

    // ── Name validation ──

    #[test]
    fn test_validate_name_valid() {
        let (_dir, manager) = manager();
        for name in ["test", "test-123", "test_abc", "Test123", "a"] {
            assert!(manager.create_database(name, true).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_validate_name_invalid() {
        let (_dir, manager) = manager();
        let long_name = "a".repeat(129);
        for name in ["", long_name.as_str(), "test db", "test/db", "test.db", "test@db"] {
            let result = manager.create_database(name, false);
            assert!(matches!(result, Err(GraphError::InvalidDatabaseName(_))), "{}", name);
        }
    }

    // ── Retrieval ──

    #[test]
    fn test_get_database_not_found_lists_existing() {
        let (_dir, manager) = manager();
        manager.create_database("beta", false).unwrap();
        manager.create_database("alpha", true).unwrap();

        match manager.get_database("nonexistent") {
            Err(GraphError::DatabaseNotFound { name, available }) => {
                assert_eq!(name, "nonexistent");
                assert_eq!(available, vec!["alpha".to_string(), "beta".to_string()]);
            }
            Err(e) => panic!("Expected DatabaseNotFound error, got: {:?}", e),
            Ok(_) => panic!("Expected DatabaseNotFound error"),
        }
    }

    #[test]
    fn test_databases_on_disk_are_opened_lazily() {
        let dir = tempdir().unwrap();
        let node = NodeRecord::new("a->f", "FUNCTION", "f", "a.js");
        {
            let manager = DatabaseManager::new(dir.path().to_path_buf(), EngineConfig::conservative());
            manager.create_database("persisted", false).unwrap();
            manager.create_database_with("legacy", false, EngineKind::V1).unwrap();
            for name in ["persisted", "legacy"] {
                let db = manager.get_database(name).unwrap();
                db.engine.commit(vec![node.clone()], vec![], &[]).unwrap();
            }
            assert_eq!(manager.flush_all().len(), 2);
        }

        let manager = DatabaseManager::new(dir.path().to_path_buf(), EngineConfig::conservative());
        let listed = manager.list_databases();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|info| !info.open && info.node_count.is_none()));

        let db = manager.get_database("persisted").unwrap();
        assert!(db.engine.node_exists(node.id).unwrap());
        let legacy = manager.get_database("legacy").unwrap();
        assert_eq!(legacy.engine.kind(), EngineKind::V1);
        assert!(legacy.engine.node_exists(node.id).unwrap());
        assert!(manager.list_databases().iter().all(|info| info.open));
    }

    // ── Dropping ──

    #[test]
    fn test_drop_database_deletes_files() {
        let (dir, manager) = manager();
        manager.create_database("mydb", false).unwrap();
        manager.drop_database("mydb").unwrap();
        assert!(!manager.database_exists("mydb"));
        assert!(!dir.path().join("mydb.factdb").exists());
    }

    #[test]
    fn test_drop_database_in_use() {
        let (_dir, manager) = manager();
        manager.create_database("mydb", false).unwrap();
        let db = manager.get_database("mydb").unwrap();
        db.add_connection();
        assert!(matches!(manager.drop_database("mydb"), Err(GraphError::DatabaseInUse(_))));
        db.remove_connection();
        drop(db);
        manager.drop_database("mydb").unwrap();
    }

    #[test]
    fn test_acquire_counts_connection_and_claims_writer() {
        let (_dir, manager) = manager();
        manager.create_database("mydb", false).unwrap();

        let db = manager.acquire("mydb", AccessMode::ReadWrite, 1).unwrap();
        assert_eq!(db.connection_count(), 1);
        assert_eq!(db.writer(), Some(1));
        assert!(matches!(manager.drop_database("mydb"), Err(GraphError::DatabaseInUse(_))));

        // a second writer is refused and leaves no connection behind
        assert!(matches!(
            manager.acquire("mydb", AccessMode::ReadWrite, 2),
            Err(GraphError::ModeConflict(_))
        ));
        assert_eq!(db.connection_count(), 1);

        let reader = manager.acquire_shared("mydb").unwrap();
        assert_eq!(reader.connection_count(), 2);
        assert_eq!(reader.writer(), Some(1));

        db.release_writer(1);
        db.remove_connection();
        reader.remove_connection();
        drop((db, reader));
        manager.drop_database("mydb").unwrap();
        assert!(matches!(
            manager.acquire("mydb", AccessMode::ReadOnly, 3),
            Err(GraphError::DatabaseNotFound { .. })
        ));
    }

    #[test]
    fn test_drop_database_not_found() {
        let (_dir, manager) = manager();
        assert!(matches!(
            manager.drop_database("nonexistent"),
            Err(GraphError::DatabaseNotFound { .. })
        ));
    }

    // ── Listing ──

    #[test]
    fn test_list_databases_sorted_with_info() {
        let (_dir, manager) = manager();
        assert!(manager.list_databases().is_empty());

        manager.create_database("db2", true).unwrap();
        manager.create_database("db1", false).unwrap();
        let db = manager.get_database("db2").unwrap();
        db.add_connection();
        db.add_connection();

        let list = manager.list_databases();
        let names: Vec<&str> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["db1", "db2"]);
        let info = &list[1];
        assert!(info.ephemeral);
        assert_eq!(info.connection_count, 2);
        assert_eq!(info.node_count, Some(0));
        assert_eq!(info.engine, Some(EngineKind::V2));
    }

    // ── Ephemeral cleanup ──

    #[test]
    fn test_ephemeral_cleanup_on_last_disconnect() {
        let (_dir, manager) = manager();
        manager.create_database("ephemeral-test", true).unwrap();
        let db = manager.get_database("ephemeral-test").unwrap();
        db.add_connection();
        db.add_connection();

        db.remove_connection();
        manager.cleanup_ephemeral_if_unused("ephemeral-test");
        assert!(manager.database_exists("ephemeral-test"));

        db.remove_connection();
        manager.cleanup_ephemeral_if_unused("ephemeral-test");
        assert!(!manager.database_exists("ephemeral-test"));
    }

    #[test]
    fn test_persistent_not_cleaned_on_disconnect() {
        let (_dir, manager) = manager();
        manager.create_database("persistent-test", false).unwrap();
        let db = manager.get_database("persistent-test").unwrap();
        db.add_connection();
        db.remove_connection();
        manager.cleanup_ephemeral_if_unused("persistent-test");
        assert!(manager.database_exists("persistent-test"));
    }

    // ── Default database ──

    #[test]
    fn test_create_default_from_path() {
        let (dir, manager) = manager();
        let db_path = dir.path().join("legacy-location");
        manager.create_default_from_path(&db_path).unwrap();

        let db = manager.get_database(DEFAULT_DATABASE).unwrap();
        assert!(!db.ephemeral);
        assert_eq!(db.engine.path(), Some(db_path.as_path()));
        db.engine
            .commit(vec![NodeRecord::new("k", "T", "k", "f")], vec![], &[])
            .unwrap();
        db.engine.flush().unwrap();

        // Reopen from the same path
        let again = DatabaseManager::new(dir.path().to_path_buf(), EngineConfig::conservative());
        again.create_default_from_path(&db_path).unwrap();
        assert_eq!(again.get_database(DEFAULT_DATABASE).unwrap().node_count().unwrap(), 1);
    }
}
