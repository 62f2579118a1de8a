//! ClientSession - per-connection protocol state
//!
//! ```text
//! Connected --hello--> Idle --openDatabase--> Active
//!     |                  ^                      |
//!     |                  +----closeDatabase-----+
//!     +--first other request--> legacy: Active on "default" (or Idle)
//! ```
//!
//! Sessions are owned by a `SessionRegistry` that the transport layer
//! receives by reference; there is no process-wide session table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::database_manager::{AccessMode, ClientId, Database, DatabaseManager, DEFAULT_DATABASE};
use crate::error::{GraphError, Result};

/// Protocol spoken by clients that never send `hello`
pub const LEGACY_PROTOCOL_VERSION: u32 = 1;
pub const MIN_PROTOCOL_VERSION: u32 = 2;
pub const MAX_PROTOCOL_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing negotiated yet
    Connected,
    /// Negotiated, no database open
    Idle,
    /// Bound to a database
    Active,
}

pub struct ClientSession {
    pub id: ClientId,
    /// None until `hello` or the first legacy request
    protocol_version: Option<u32>,
    current_db: Option<Arc<Database>>,
    access_mode: AccessMode,
    /// True while this session holds the database's writer slot
    holds_writer: bool,
}

impl ClientSession {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            protocol_version: None,
            current_db: None,
            access_mode: AccessMode::ReadOnly,
            holds_writer: false,
        }
    }

    pub fn state(&self) -> SessionState {
        match (&self.current_db, self.protocol_version) {
            (Some(_), _) => SessionState::Active,
            (None, Some(_)) => SessionState::Idle,
            (None, None) => SessionState::Connected,
        }
    }

    /// Negotiated version, `LEGACY_PROTOCOL_VERSION` if none.
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version.unwrap_or(LEGACY_PROTOCOL_VERSION)
    }

    /// Agree on `min(proposed, MAX_PROTOCOL_VERSION)`. A proposal below
    /// `MIN_PROTOCOL_VERSION` fails and leaves the session unchanged.
    pub fn negotiate(&mut self, proposed: u32) -> Result<u32> {
        if proposed < MIN_PROTOCOL_VERSION {
            return Err(GraphError::ProtocolVersionUnsupported {
                proposed,
                min: MIN_PROTOCOL_VERSION,
                max: MAX_PROTOCOL_VERSION,
            });
        }
        let version = proposed.min(MAX_PROTOCOL_VERSION);
        self.protocol_version = Some(version);
        Ok(version)
    }

    /// Legacy compatibility: a client that starts talking without `hello`
    /// is bound to the default database, read-write. Legacy sessions do
    /// not take the exclusive writer slot. Without a default database the
    /// session is left Idle.
    pub fn bind_legacy(&mut self, manager: &DatabaseManager) {
        if self.protocol_version.is_some() {
            return;
        }
        self.protocol_version = Some(LEGACY_PROTOCOL_VERSION);
        match manager.acquire_shared(DEFAULT_DATABASE) {
            Ok(db) => {
                self.current_db = Some(db);
                self.access_mode = AccessMode::ReadWrite;
                debug!(client = self.id, "Legacy client bound to default database");
            }
            Err(e) => debug!(client = self.id, error = %e, "Legacy client has no default database"),
        }
    }

    /// Bind this session to `name`. On failure the session keeps its
    /// previous database. On success a previously open database is closed.
    pub fn open_database(&mut self, manager: &DatabaseManager, name: &str, mode: AccessMode) -> Result<Arc<Database>> {
        let db = manager.acquire(name, mode, self.id)?;

        let previous = self.current_db.replace(Arc::clone(&db));
        let held_writer = std::mem::replace(&mut self.holds_writer, mode.is_write());
        self.access_mode = mode;
        if self.protocol_version.is_none() {
            self.protocol_version = Some(LEGACY_PROTOCOL_VERSION);
        }

        if let Some(prev) = previous {
            let reclaimed = Arc::ptr_eq(&prev, &db) && mode.is_write();
            if held_writer && !reclaimed {
                prev.release_writer(self.id);
            }
            prev.remove_connection();
            manager.cleanup_ephemeral_if_unused(&prev.name);
        }
        Ok(db)
    }

    /// Unbind the current database. Returns false if none was open.
    /// An ephemeral database is removed once its last session closes it.
    pub fn close_database(&mut self, manager: &DatabaseManager) -> bool {
        let Some(db) = self.current_db.take() else {
            return false;
        };
        if std::mem::take(&mut self.holds_writer) {
            db.release_writer(self.id);
        }
        db.remove_connection();
        manager.cleanup_ephemeral_if_unused(&db.name);
        self.access_mode = AccessMode::ReadOnly;
        true
    }

    pub fn current_db(&self) -> Option<&Arc<Database>> {
        self.current_db.as_ref()
    }

    pub fn current_db_name(&self) -> Option<&str> {
        self.current_db.as_ref().map(|db| db.name.as_str())
    }

    pub fn access_mode(&self) -> Option<AccessMode> {
        self.current_db.as_ref().map(|_| self.access_mode)
    }

    pub fn has_database(&self) -> bool {
        self.current_db.is_some()
    }

    pub fn can_write(&self) -> bool {
        self.current_db.is_some() && self.access_mode.is_write()
    }

    /// The open database, or `NoDatabaseSelected`.
    pub fn require_db(&self) -> Result<&Arc<Database>> {
        self.current_db.as_ref().ok_or(GraphError::NoDatabaseSelected)
    }

    /// The open database if this session may write to it.
    pub fn require_writable(&self) -> Result<&Arc<Database>> {
        let db = self.require_db()?;
        if !self.access_mode.is_write() {
            return Err(GraphError::ReadOnlyMode);
        }
        Ok(db)
    }
}

/// Live sessions of one server, keyed by client id.
pub struct SessionRegistry {
    next_id: AtomicUsize,
    sessions: RwLock<HashMap<ClientId, Arc<Mutex<ClientSession>>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session for a new connection.
    pub fn create(&self) -> (ClientId, Arc<Mutex<ClientSession>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Mutex::new(ClientSession::new(id)));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&session));
        (id, session)
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<Mutex<ClientSession>>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Remove a session, closing its database. Returns false for an
    /// unknown id.
    pub fn destroy(&self, id: ClientId, manager: &DatabaseManager) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(session) => {
                session
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .close_database(manager);
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}


#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::tempdir;

    #[test]
    fn test_registry_lifecycle() {
        let dir = tempdir().unwrap();
        let manager = DatabaseManager::new(dir.path().to_path_buf(), EngineConfig::conservative());
        manager.create_database("tmp", true).unwrap();
        let registry = SessionRegistry::new();

        let (a, session_a) = registry.create();
        let (b, _session_b) = registry.create();
        assert_ne!(a, b);
        assert_eq!(registry.count(), 2);

        session_a
            .lock()
            .unwrap()
            .open_database(&manager, "tmp", AccessMode::ReadWrite)
            .unwrap();
        assert!(registry.get(a).is_some());

        assert!(registry.destroy(a, &manager));
        assert!(!registry.destroy(a, &manager));
        assert!(registry.get(a).is_none());
        assert_eq!(registry.count(), 1);
        // The ephemeral database went away with its only session
        assert!(!manager.database_exists("tmp"));
    }
}
