//! Record model shared by both engines
//!
//! Nodes and edges are plain owned records. Segments, the write buffer and
//! the legacy snapshot all store these same types; only their on-disk
//! encodings differ.

pub mod snapshot;

use serde::{Deserialize, Serialize};

use crate::graph::compute_node_id;

/// Node record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// BLAKE3(semantic_key) truncated to u128
    pub id: u128,

    /// Human-meaningful identity path, e.g. `src/a.js->Foo->bar`
    pub semantic_key: String,

    /// Node type: "FUNCTION", "CLASS", "http:route", ...
    pub node_type: String,

    pub name: String,

    /// Source file path; also the scope used by `commit(changed_scopes)`
    pub file: String,

    /// Commit version that wrote this record. Assigned by the store.
    #[serde(default)]
    pub version: u64,

    /// JSON metadata. "" = no metadata.
    #[serde(default)]
    pub metadata: String,

    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
}

impl NodeRecord {
    pub fn new(
        semantic_key: impl Into<String>,
        node_type: impl Into<String>,
        name: impl Into<String>,
        file: impl Into<String>,
    ) -> Self {
        let semantic_key = semantic_key.into();
        Self {
            id: compute_node_id(&semantic_key),
            semantic_key,
            node_type: node_type.into(),
            name: name.into(),
            file: file.into(),
            version: 0,
            metadata: String::new(),
            deleted: false,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Tombstone for this node. Keeps type and file so zone-map pruning
    /// and scope matching still see it.
    pub fn tombstone(&self, version: u64) -> Self {
        Self {
            version,
            deleted: true,
            ..self.clone()
        }
    }
}

/// Identity of an edge: (src, dst, edge_type)
pub type EdgeKey = (u128, u128, String);

/// Edge record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub src: u128,
    pub dst: u128,

    /// Edge type: "CALLS", "CONTAINS", "IMPORTS_FROM", ...
    pub edge_type: String,

    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub metadata: String,

    #[serde(default)]
    pub deleted: bool,
}

impl EdgeRecord {
    pub fn new(src: u128, dst: u128, edge_type: impl Into<String>) -> Self {
        Self {
            src,
            dst,
            edge_type: edge_type.into(),
            version: 0,
            metadata: String::new(),
            deleted: false,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn key(&self) -> EdgeKey {
        (self.src, self.dst, self.edge_type.clone())
    }

    pub fn tombstone(&self, version: u64) -> Self {
        Self {
            version,
            deleted: true,
            ..self.clone()
        }
    }
}

/// Match a type against a filter. A trailing `*` is a prefix wildcard
/// (`"http:*"` matches `"http:route"`).
pub fn type_matches(pattern: &str, actual: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => actual.starts_with(prefix),
        None => pattern == actual,
    }
}

/// True when `edge_type` passes an optional type filter. An empty filter
/// accepts everything.
pub fn edge_type_allowed(filter: Option<&[String]>, edge_type: &str) -> bool {
    match filter {
        None => true,
        Some([]) => true,
        Some(types) => types.iter().any(|t| type_matches(t, edge_type)),
    }
}

/// Query for filtering nodes by attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrQuery {
    /// Node type. Supports wildcard: "http:*" for all http types
    pub node_type: Option<String>,
    pub name: Option<String>,
    pub file: Option<String>,
    /// Metadata field filters: (key, value) pairs matched against top-level
    /// keys of the node's metadata JSON. All filters must match (AND).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata_filters: Vec<(String, String)>,
}

impl AttrQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_type(mut self, t: impl Into<String>) -> Self {
        self.node_type = Some(t.into());
        self
    }

    pub fn name(mut self, n: impl Into<String>) -> Self {
        self.name = Some(n.into());
        self
    }

    pub fn file(mut self, f: impl Into<String>) -> Self {
        self.file = Some(f.into());
        self
    }

    pub fn metadata_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_filters.push((key.into(), value.into()));
        self
    }

    /// Test a live record against every populated field.
    pub fn matches(&self, node: &NodeRecord) -> bool {
        if let Some(ref t) = self.node_type {
            if !type_matches(t, &node.node_type) {
                return false;
            }
        }
        if let Some(ref n) = self.name {
            if n != &node.name {
                return false;
            }
        }
        if let Some(ref f) = self.file {
            if f != &node.file {
                return false;
            }
        }
        if self.metadata_filters.is_empty() {
            return true;
        }
        metadata_matches(&node.metadata, &self.metadata_filters)
    }
}

fn metadata_matches(metadata: &str, filters: &[(String, String)]) -> bool {
    if metadata.is_empty() {
        return false;
    }
    let parsed: serde_json::Value = match serde_json::from_str(metadata) {
        Ok(v) => v,
        Err(_) => return false,
    };
    filters.iter().all(|(key, expected)| match parsed.get(key) {
        Some(serde_json::Value::String(s)) => s == expected,
        Some(serde_json::Value::Null) | None => false,
        Some(other) => &other.to_string() == expected,
    })
}
