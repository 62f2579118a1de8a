//! Wire protocol types
//!
//! Every request is a MessagePack map with a `cmd` field and an optional
//! `requestId`, echoed back in the response. Ids travel as strings: a
//! decimal or `0x`-hex u128, or a semantic key that is hashed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::EngineKind;
use crate::database_manager::DatabaseInfo;
use crate::error::{GraphError, Result};
use crate::graph::{compute_node_id, id_to_string, string_id_to_u128, EngineStats};
use crate::metrics::MetricsSnapshot;
use crate::storage::{AttrQuery, EdgeRecord, NodeRecord};
use crate::storage_v2::compaction::CompactionResult;
use crate::storage_v2::multi_shard::FlushStats;
use crate::storage_v2::types::CommitDelta;

/// Request from client
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    // === Session & database management ===
    Hello {
        #[serde(rename = "protocolVersion")]
        protocol_version: Option<u32>,
        #[serde(rename = "clientId")]
        client_id: Option<String>,
    },
    CreateDatabase {
        name: String,
        #[serde(default)]
        ephemeral: bool,
        /// Storage engine, "v2" if absent
        #[serde(default)]
        engine: Option<EngineKind>,
    },
    OpenDatabase {
        name: String,
        #[serde(default = "default_rw_mode")]
        mode: String,
    },
    CloseDatabase,
    DropDatabase {
        name: String,
    },
    ListDatabases,
    CurrentDatabase,

    // === Server ===
    Ping,
    GetStats,
    Shutdown,

    // === Writes ===
    Commit {
        #[serde(default)]
        nodes: Vec<WireNode>,
        #[serde(default)]
        edges: Vec<WireEdge>,
        #[serde(default, rename = "changedScopes")]
        changed_scopes: Vec<String>,
    },
    Flush,
    Compact,

    // === Reads ===
    GetNode {
        id: String,
    },
    NodeExists {
        id: String,
    },
    FindByType {
        #[serde(rename = "nodeType")]
        node_type: String,
    },
    FindByAttr {
        query: WireAttrQuery,
    },
    Neighbors {
        id: String,
        #[serde(default, rename = "edgeTypes")]
        edge_types: Vec<String>,
    },
    GetOutgoingEdges {
        id: String,
        #[serde(rename = "edgeTypes")]
        edge_types: Option<Vec<String>>,
    },
    GetIncomingEdges {
        id: String,
        #[serde(rename = "edgeTypes")]
        edge_types: Option<Vec<String>>,
    },
    Bfs {
        #[serde(rename = "startIds")]
        start_ids: Vec<String>,
        #[serde(rename = "maxDepth")]
        max_depth: u32,
        #[serde(default, rename = "edgeTypes")]
        edge_types: Vec<String>,
    },
    Reachability {
        #[serde(rename = "startIds")]
        start_ids: Vec<String>,
        #[serde(rename = "maxDepth")]
        max_depth: u32,
        #[serde(default, rename = "edgeTypes")]
        edge_types: Vec<String>,
        #[serde(default)]
        backward: bool,
    },
    NodeCount,
    EdgeCount,
    CountNodesByType {
        types: Option<Vec<String>>,
    },
    CountEdgesByType {
        #[serde(rename = "edgeTypes")]
        edge_types: Option<Vec<String>>,
    },
}

fn default_rw_mode() -> String {
    "rw".to_string()
}

impl Request {
    /// Wire command name, used for metrics and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::CreateDatabase { .. } => "createDatabase",
            Request::OpenDatabase { .. } => "openDatabase",
            Request::CloseDatabase => "closeDatabase",
            Request::DropDatabase { .. } => "dropDatabase",
            Request::ListDatabases => "listDatabases",
            Request::CurrentDatabase => "currentDatabase",
            Request::Ping => "ping",
            Request::GetStats => "getStats",
            Request::Shutdown => "shutdown",
            Request::Commit { .. } => "commit",
            Request::Flush => "flush",
            Request::Compact => "compact",
            Request::GetNode { .. } => "getNode",
            Request::NodeExists { .. } => "nodeExists",
            Request::FindByType { .. } => "findByType",
            Request::FindByAttr { .. } => "findByAttr",
            Request::Neighbors { .. } => "neighbors",
            Request::GetOutgoingEdges { .. } => "getOutgoingEdges",
            Request::GetIncomingEdges { .. } => "getIncomingEdges",
            Request::Bfs { .. } => "bfs",
            Request::Reachability { .. } => "reachability",
            Request::NodeCount => "nodeCount",
            Request::EdgeCount => "edgeCount",
            Request::CountNodesByType { .. } => "countNodesByType",
            Request::CountEdgesByType { .. } => "countEdgesByType",
        }
    }
}

/// Response to client
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    HelloOk {
        ok: bool,
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(rename = "serverVersion")]
        server_version: String,
        features: Vec<String>,
    },
    DatabaseCreated {
        ok: bool,
        #[serde(rename = "databaseId")]
        database_id: String,
    },
    DatabaseOpened {
        ok: bool,
        #[serde(rename = "databaseId")]
        database_id: String,
        mode: String,
        #[serde(rename = "nodeCount")]
        node_count: usize,
        #[serde(rename = "edgeCount")]
        edge_count: usize,
    },
    DatabaseList {
        databases: Vec<DatabaseInfo>,
    },
    CurrentDb {
        database: Option<String>,
        mode: Option<String>,
    },
    /// Every failure: message plus a stable code for programmatic handling
    ErrorWithCode {
        error: String,
        code: String,
    },
    Committed {
        ok: bool,
        delta: CommitDelta,
    },
    Flushed {
        ok: bool,
        flush: FlushStats,
    },
    Compacted {
        ok: bool,
        compaction: CompactionResult,
    },
    Ok {
        ok: bool,
    },
    Node {
        node: Option<WireNode>,
    },
    Nodes {
        nodes: Vec<WireNode>,
    },
    Edges {
        edges: Vec<WireEdge>,
    },
    Ids {
        ids: Vec<String>,
    },
    Bool {
        value: bool,
    },
    Count {
        count: usize,
    },
    Counts {
        counts: HashMap<String, usize>,
    },
    Pong {
        pong: bool,
        version: String,
    },
    Stats(Box<WireStats>),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok { ok: true }
    }

    pub fn error(err: &GraphError) -> Self {
        Response::ErrorWithCode {
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

/// `getStats` payload. Engine fields are absent when no database is open.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<EngineStats>,
    pub sessions: usize,
    pub memory_percent: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}

/// Request envelope: captures requestId alongside the tagged Request.
#[derive(Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, rename = "requestId")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub request: Request,
}

/// Salvages the requestId of a payload that failed to decode as a request.
#[derive(Deserialize)]
struct RequestIdOnly {
    #[serde(default, rename = "requestId")]
    request_id: Option<String>,
}

/// Response envelope: wraps Response with optional requestId for echo-back.
#[derive(Serialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub response: Response,
}

/// Decode one request payload. On failure the error is paired with
/// whatever requestId could still be read.
pub fn decode_request(payload: &[u8]) -> std::result::Result<RequestEnvelope, (Option<String>, GraphError)> {
    rmp_serde::from_slice::<RequestEnvelope>(payload).map_err(|e| {
        let request_id = rmp_serde::from_slice::<RequestIdOnly>(payload)
            .ok()
            .and_then(|r| r.request_id);
        (request_id, GraphError::InvalidRequest(e.to_string()))
    })
}

pub fn encode_response(request_id: Option<String>, response: Response) -> Result<Vec<u8>> {
    let envelope = ResponseEnvelope { request_id, response };
    rmp_serde::to_vec_named(&envelope).map_err(|e| GraphError::InvalidRequest(format!("encode failed: {}", e)))
}

// ── Records ─────────────────────────────────────────────────────────

/// Node representation for wire protocol. The id is derived from
/// `semanticKey`; an `id` sent by the client is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub semantic_key: String,
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Edge representation for wire protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEdge {
    pub src: String,
    pub dst: String,
    pub edge_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Attribute query for wire protocol.
/// Fields other than the known ones are matched against top-level
/// metadata keys.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttrQuery {
    pub node_type: Option<String>,
    pub name: Option<String>,
    pub file: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl From<NodeRecord> for WireNode {
    fn from(node: NodeRecord) -> Self {
        WireNode {
            id: Some(id_to_string(node.id)),
            semantic_key: node.semantic_key,
            node_type: node.node_type,
            name: node.name,
            file: node.file,
            metadata: node.metadata,
            version: Some(node.version),
        }
    }
}

impl From<WireNode> for NodeRecord {
    fn from(node: WireNode) -> Self {
        NodeRecord {
            id: compute_node_id(&node.semantic_key),
            semantic_key: node.semantic_key,
            node_type: node.node_type,
            name: node.name,
            file: node.file,
            version: 0,
            metadata: node.metadata,
            deleted: false,
        }
    }
}

impl From<EdgeRecord> for WireEdge {
    fn from(edge: EdgeRecord) -> Self {
        WireEdge {
            src: id_to_string(edge.src),
            dst: id_to_string(edge.dst),
            edge_type: edge.edge_type,
            metadata: edge.metadata,
            version: Some(edge.version),
        }
    }
}

impl From<WireEdge> for EdgeRecord {
    fn from(edge: WireEdge) -> Self {
        EdgeRecord::new(string_id_to_u128(&edge.src), string_id_to_u128(&edge.dst), edge.edge_type)
            .with_metadata(edge.metadata)
    }
}

impl From<WireAttrQuery> for AttrQuery {
    fn from(query: WireAttrQuery) -> Self {
        // Scalars only; null, arrays and objects cannot match a metadata value.
        let mut metadata_filters: Vec<(String, String)> = query
            .extra
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                serde_json::Value::Bool(b) => Some((k, b.to_string())),
                serde_json::Value::Number(n) => Some((k, n.to_string())),
                _ => None,
            })
            .collect();
        metadata_filters.sort();
        AttrQuery {
            node_type: query.node_type,
            name: query.name,
            file: query.file,
            metadata_filters,
        }
    }
}

pub fn ids_to_strings(ids: impl IntoIterator<Item = u128>) -> Vec<String> {
    ids.into_iter().map(id_to_string).collect()
}
