//! Error types for the graph store and its server

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

/// Coarse error category. Decides how an error propagates: whether the
/// connection stays usable, whether the database is poisoned, whether
/// the client can fix it by issuing another command first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request or unsupported protocol version.
    Protocol,
    /// Precondition violation: no database selected, wrong access mode.
    SessionState,
    /// Database or record absent.
    NotFound,
    /// Segment corruption or manifest mismatch. Fatal to the database.
    Integrity,
    /// I/O failure during flush/compaction. The operation rolled back.
    Resource,
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Node not found: {0:032x}")]
    NodeNotFound(u128),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Compaction error: {0}")]
    Compaction(String),

    #[error("Database unusable after an integrity failure ({0}); repair its files and restart the server")]
    DatabaseUnusable(String),

    // Protocol
    #[error("Unsupported protocol version {proposed}: this server speaks versions {min}..={max}")]
    ProtocolVersionUnsupported { proposed: u32, min: u32, max: u32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Multi-database
    #[error("Database '{0}' already exists")]
    DatabaseExists(String),

    #[error("{}", not_found_message(.name, .available))]
    DatabaseNotFound { name: String, available: Vec<String> },

    #[error("Database '{0}' is in use and cannot be dropped")]
    DatabaseInUse(String),

    #[error("Database '{0}' already has an exclusive writer; open it with mode \"ro\" or retry later")]
    ModeConflict(String),

    #[error("No database selected. Use openDatabase first.")]
    NoDatabaseSelected,

    #[error("Operation not allowed in read-only mode; reopen the database with mode \"rw\"")]
    ReadOnlyMode,

    #[error("Invalid database name: {0}")]
    InvalidDatabaseName(String),
}

fn not_found_message(name: &str, available: &[String]) -> String {
    let listed = if available.is_empty() {
        "none".to_string()
    } else {
        available.join(", ")
    };
    format!(
        "Database '{}' not found (existing: {}). Use createDatabase to create it.",
        name, listed
    )
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::ProtocolVersionUnsupported { .. } | GraphError::InvalidRequest(_) => {
                ErrorKind::Protocol
            }
            GraphError::NoDatabaseSelected
            | GraphError::ReadOnlyMode
            | GraphError::ModeConflict(_)
            | GraphError::DatabaseExists(_)
            | GraphError::DatabaseInUse(_)
            | GraphError::InvalidDatabaseName(_) => ErrorKind::SessionState,
            GraphError::NodeNotFound(_) | GraphError::DatabaseNotFound { .. } => {
                ErrorKind::NotFound
            }
            GraphError::InvalidFormat(_)
            | GraphError::Manifest(_)
            | GraphError::DatabaseUnusable(_) => ErrorKind::Integrity,
            GraphError::Io(_)
            | GraphError::Serialization(_)
            | GraphError::Json(_)
            | GraphError::Compaction(_) => ErrorKind::Resource,
        }
    }

    /// True for errors that must poison the owning database.
    pub fn is_integrity(&self) -> bool {
        self.kind() == ErrorKind::Integrity
    }

    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::ProtocolVersionUnsupported { .. } => "PROTOCOL_VERSION_UNSUPPORTED",
            GraphError::InvalidRequest(_) => "INVALID_REQUEST",
            GraphError::NodeNotFound(_) => "NODE_NOT_FOUND",
            GraphError::DatabaseExists(_) => "DATABASE_EXISTS",
            GraphError::DatabaseNotFound { .. } => "DATABASE_NOT_FOUND",
            GraphError::DatabaseInUse(_) => "DATABASE_IN_USE",
            GraphError::ModeConflict(_) => "MODE_CONFLICT",
            GraphError::NoDatabaseSelected => "NO_DATABASE_SELECTED",
            GraphError::ReadOnlyMode => "READ_ONLY_MODE",
            GraphError::InvalidDatabaseName(_) => "INVALID_DATABASE_NAME",
            GraphError::InvalidFormat(_) | GraphError::Manifest(_) => "INTEGRITY_ERROR",
            GraphError::DatabaseUnusable(_) => "DATABASE_UNUSABLE",
            GraphError::Io(_) | GraphError::Compaction(_) => "RESOURCE_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}
