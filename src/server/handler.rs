//! Request dispatch
//!
//! `process_frame` is the whole per-request path shared by both
//! transports: decode, legacy binding, dispatch, metrics, encode.

use std::time::Instant;

use tracing::{error, warn};

use super::protocol::{
    decode_request, encode_response, ids_to_strings, Request, Response, WireEdge, WireNode, WireStats,
};
use super::ServerContext;
use crate::database_manager::{AccessMode, Database};
use crate::error::{GraphError, Result};
use crate::graph::{reachability, string_id_to_u128, GraphStore};
use crate::metrics::SLOW_QUERY_THRESHOLD_MS;
use crate::session::{ClientSession, SessionState, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};
use crate::storage::{AttrQuery, EdgeRecord, NodeRecord};
use crate::storage_v2::resource::SystemResources;

/// Encoded response for one request frame.
pub struct Reply {
    pub bytes: Vec<u8>,
    /// The client asked the server to shut down; the transport sends
    /// `bytes` first.
    pub shutdown: bool,
}

/// Handle one request payload for `session`.
pub fn process_frame(ctx: &ServerContext, session: &mut ClientSession, payload: &[u8]) -> Reply {
    let (request_id, request) = match decode_request(payload) {
        Ok(envelope) => (envelope.request_id, envelope.request),
        Err((request_id, e)) => {
            warn!(client = session.id, error = %e, "Rejected request");
            return Reply {
                bytes: encode_or_log(request_id, Response::error(&e)),
                shutdown: false,
            };
        }
    };

    // Clients that skip `hello` speak the legacy protocol.
    if session.state() == SessionState::Connected && !matches!(request, Request::Hello { .. }) {
        session.bind_legacy(&ctx.manager);
    }

    let shutdown = matches!(request, Request::Shutdown);
    let op = request.name();
    let start = Instant::now();
    let response = handle_request(ctx, session, request);
    let duration_ms = start.elapsed().as_millis() as u64;

    if let Some(metrics) = &ctx.metrics {
        metrics.record_query(op, duration_ms);
    }
    if duration_ms >= SLOW_QUERY_THRESHOLD_MS {
        warn!(client = session.id, op, duration_ms, "Slow request");
    }

    Reply {
        bytes: encode_or_log(request_id, response),
        shutdown,
    }
}

fn encode_or_log(request_id: Option<String>, response: Response) -> Vec<u8> {
    match encode_response(request_id.clone(), response) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            encode_response(request_id, Response::error(&e)).unwrap_or_default()
        }
    }
}

/// Dispatch one decoded request. Failures become `ErrorWithCode`.
pub fn handle_request(ctx: &ServerContext, session: &mut ClientSession, request: Request) -> Response {
    let op = request.name();
    match dispatch(ctx, session, request) {
        Ok(response) => response,
        Err(e) => {
            if e.is_integrity() {
                error!(client = session.id, op, database = ?session.current_db_name(), error = %e, "Integrity failure");
            }
            Response::error(&e)
        }
    }
}

fn dispatch(ctx: &ServerContext, session: &mut ClientSession, request: Request) -> Result<Response> {
    match request {
        // ====================================================================
        // Session & database management
        // ====================================================================
        Request::Hello { protocol_version, client_id } => {
            let version = session.negotiate(protocol_version.unwrap_or(MIN_PROTOCOL_VERSION))?;
            tracing::debug!(client = session.id, client_id = ?client_id, version, "Negotiated protocol");
            Ok(Response::HelloOk {
                ok: true,
                protocol_version: version,
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                features: ["multiDatabase", "ephemeral", "exclusiveWriter", "compaction"]
                    .iter()
                    .map(|f| f.to_string())
                    .collect(),
            })
        }

        Request::CreateDatabase { name, ephemeral, engine } => {
            ctx.manager.create_database_with(&name, ephemeral, engine.unwrap_or_default())?;
            Ok(Response::DatabaseCreated {
                ok: true,
                database_id: name,
            })
        }

        Request::OpenDatabase { name, mode } => {
            let mode: AccessMode = mode.parse()?;
            let db = session.open_database(&ctx.manager, &name, mode)?;
            Ok(Response::DatabaseOpened {
                ok: true,
                database_id: name,
                mode: mode.as_str().to_string(),
                node_count: db.node_count()?,
                edge_count: db.edge_count()?,
            })
        }

        Request::CloseDatabase => {
            if !session.close_database(&ctx.manager) {
                return Err(GraphError::NoDatabaseSelected);
            }
            Ok(Response::ok())
        }

        Request::DropDatabase { name } => {
            ctx.manager.drop_database(&name)?;
            Ok(Response::ok())
        }

        Request::ListDatabases => Ok(Response::DatabaseList {
            databases: ctx.manager.list_databases(),
        }),

        Request::CurrentDatabase => Ok(Response::CurrentDb {
            database: session.current_db_name().map(str::to_string),
            mode: session.access_mode().map(|m| m.as_str().to_string()),
        }),

        // ====================================================================
        // Server
        // ====================================================================
        Request::Ping => Ok(Response::Pong {
            pong: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),

        Request::GetStats => {
            let mut stats = WireStats {
                database: None,
                node_count: None,
                edge_count: None,
                storage: None,
                sessions: ctx.sessions.count(),
                memory_percent: (SystemResources::detect().memory_pressure() * 100.0) as f32,
                metrics: None,
            };
            if let Some(db) = session.current_db() {
                record_background_compactions(ctx, db);
                stats.database = Some(db.name.clone());
                stats.node_count = Some(db.node_count()?);
                stats.edge_count = Some(db.edge_count()?);
                stats.storage = Some(db.engine.stats());
            }
            stats.metrics = ctx.metrics.as_ref().map(|m| m.snapshot());
            Ok(Response::Stats(Box::new(stats)))
        }

        Request::Shutdown => Ok(Response::ok()),

        // ====================================================================
        // Writes
        // ====================================================================
        Request::Commit { nodes, edges, changed_scopes } => {
            let db = session.require_writable()?;
            let nodes: Vec<NodeRecord> = nodes.into_iter().map(NodeRecord::from).collect();
            let edges: Vec<EdgeRecord> = edges.into_iter().map(EdgeRecord::from).collect();
            let delta = db.engine.commit(nodes, edges, &changed_scopes)?;
            Ok(Response::Committed { ok: true, delta })
        }

        Request::Flush => {
            let db = session.require_writable()?;
            let start = Instant::now();
            let flush = db.engine.flush()?;
            if let Some(metrics) = &ctx.metrics {
                metrics.record_flush(start.elapsed().as_millis() as u64, flush.nodes_written, flush.edges_written);
            }
            record_background_compactions(ctx, db);
            Ok(Response::Flushed { ok: true, flush })
        }

        Request::Compact => {
            let db = session.require_writable()?;
            record_background_compactions(ctx, db);
            let compaction = db.engine.compact()?;
            if let Some(metrics) = &ctx.metrics {
                metrics.record_compaction(&compaction);
            }
            Ok(Response::Compacted { ok: true, compaction })
        }

        // ====================================================================
        // Reads
        // ====================================================================
        Request::GetNode { id } => {
            let engine = engine(session)?;
            let node = engine.get_node(string_id_to_u128(&id))?.map(WireNode::from);
            Ok(Response::Node { node })
        }

        Request::NodeExists { id } => Ok(Response::Bool {
            value: engine(session)?.node_exists(string_id_to_u128(&id))?,
        }),

        Request::FindByType { node_type } => {
            let nodes = engine(session)?.find_by_type(&node_type)?;
            Ok(nodes_response(session, nodes))
        }

        Request::FindByAttr { query } => {
            let nodes = engine(session)?.find_by_attr(&AttrQuery::from(query))?;
            Ok(nodes_response(session, nodes))
        }

        Request::Neighbors { id, edge_types } => {
            let ids = engine(session)?.neighbors(string_id_to_u128(&id), &edge_types)?;
            Ok(Response::Ids { ids: ids_to_strings(ids) })
        }

        Request::GetOutgoingEdges { id, edge_types } => {
            let edges = engine(session)?.get_outgoing_edges(string_id_to_u128(&id), edge_types.as_deref())?;
            Ok(Response::Edges {
                edges: edges.into_iter().map(WireEdge::from).collect(),
            })
        }

        Request::GetIncomingEdges { id, edge_types } => {
            let edges = engine(session)?.get_incoming_edges(string_id_to_u128(&id), edge_types.as_deref())?;
            Ok(Response::Edges {
                edges: edges.into_iter().map(WireEdge::from).collect(),
            })
        }

        Request::Bfs { start_ids, max_depth, edge_types } => {
            let start: Vec<u128> = start_ids.iter().map(|s| string_id_to_u128(s)).collect();
            let ids = engine(session)?.bfs(&start, max_depth as usize, &edge_types)?;
            Ok(Response::Ids { ids: ids_to_strings(ids) })
        }

        Request::Reachability { start_ids, max_depth, edge_types, backward } => {
            let start: Vec<u128> = start_ids.iter().map(|s| string_id_to_u128(s)).collect();
            let ids = reachability(engine(session)?, &start, max_depth as usize, &edge_types, backward)?;
            Ok(Response::Ids { ids: ids_to_strings(ids) })
        }

        Request::NodeCount => Ok(Response::Count {
            count: engine(session)?.node_count()?,
        }),

        Request::EdgeCount => Ok(Response::Count {
            count: engine(session)?.edge_count()?,
        }),

        Request::CountNodesByType { types } => Ok(Response::Counts {
            counts: engine(session)?.count_nodes_by_type(types.as_deref())?,
        }),

        Request::CountEdgesByType { edge_types } => Ok(Response::Counts {
            counts: engine(session)?.count_edges_by_type(edge_types.as_deref())?,
        }),
    }
}

/// Engine of the session's database, or `NoDatabaseSelected`.
fn engine(session: &ClientSession) -> Result<&dyn GraphStore> {
    Ok(session.require_db()?.engine.as_ref())
}

/// Protocol 3 clients get full records; older ones get ids.
fn nodes_response(session: &ClientSession, nodes: Vec<NodeRecord>) -> Response {
    if session.protocol_version() >= MAX_PROTOCOL_VERSION {
        Response::Nodes {
            nodes: nodes.into_iter().map(WireNode::from).collect(),
        }
    } else {
        Response::Ids {
            ids: ids_to_strings(nodes.into_iter().map(|n| n.id)),
        }
    }
}

fn record_background_compactions(ctx: &ServerContext, db: &Database) {
    for outcome in db.engine.drain_compaction_results() {
        match outcome {
            Ok(result) => {
                if let Some(metrics) = &ctx.metrics {
                    metrics.record_compaction(&result);
                }
            }
            Err(e) => {
                if let Some(metrics) = &ctx.metrics {
                    metrics.record_compaction_failure();
                }
                error!(database = %db.name, error = %e, "Background compaction failed");
            }
        }
    }
}

#[cfg(test)]
mod protocol_tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::database_manager::{DatabaseManager, DEFAULT_DATABASE};
    use crate::graph::compute_node_id;
    use crate::metrics::Metrics;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _dir: TempDir,
        ctx: Arc<ServerContext>,
    }

    /// Server with a "default" database and metrics enabled.
    fn setup() -> Harness {
        let dir = tempdir().unwrap();
        let manager = Arc::new(DatabaseManager::new(dir.path().to_path_buf(), EngineConfig::conservative()));
        manager.create_default_from_path(&dir.path().join("default.factdb")).unwrap();
        let (ctx, _shutdown) = ServerContext::new(manager, Some(Arc::new(Metrics::new())));
        Harness { _dir: dir, ctx }
    }

    fn call(ctx: &ServerContext, session: &mut ClientSession, request: Value) -> Value {
        let payload = rmp_serde::to_vec_named(&request).unwrap();
        let reply = process_frame(ctx, session, &payload);
        rmp_serde::from_slice(&reply.bytes).unwrap()
    }

    fn hello(ctx: &ServerContext, session: &mut ClientSession, version: u32) {
        let resp = call(ctx, session, json!({"cmd": "hello", "protocolVersion": version}));
        assert_eq!(resp["ok"], true);
    }

    fn node(key: &str, node_type: &str, file: &str) -> Value {
        json!({"semanticKey": key, "nodeType": node_type, "name": key, "file": file})
    }

    // ── Negotiation ──

    #[test]
    fn test_hello_command() {
        let h = setup();
        let mut session = ClientSession::new(1);
        let resp = call(&h.ctx, &mut session, json!({"cmd": "hello", "protocolVersion": 7, "clientId": "cli"}));
        assert_eq!(resp["protocolVersion"], 3);
        assert_eq!(resp["serverVersion"], env!("CARGO_PKG_VERSION"));
        assert!(resp["features"].as_array().unwrap().contains(&json!("multiDatabase")));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_hello_unsupported_version_leaves_session_connected() {
        let h = setup();
        let mut session = ClientSession::new(1);
        let resp = call(&h.ctx, &mut session, json!({"cmd": "hello", "protocolVersion": 1}));
        assert_eq!(resp["code"], "PROTOCOL_VERSION_UNSUPPORTED");
        assert_eq!(session.state(), SessionState::Connected);

        // Retry on the same connection
        hello(&h.ctx, &mut session, 2);
        assert_eq!(session.protocol_version(), 2);
    }

    #[test]
    fn test_request_id_echoed() {
        let h = setup();
        let mut session = ClientSession::new(1);
        let resp = call(&h.ctx, &mut session, json!({"cmd": "ping", "requestId": "abc"}));
        assert_eq!(resp["requestId"], "abc");
        assert_eq!(resp["pong"], true);

        let resp = call(&h.ctx, &mut session, json!({"cmd": "noSuchCommand", "requestId": "xyz"}));
        assert_eq!(resp["requestId"], "xyz");
        assert_eq!(resp["code"], "INVALID_REQUEST");
    }

    // ── Database management ──

    #[test]
    fn test_create_open_close_database() {
        let h = setup();
        let mut session = ClientSession::new(1);
        hello(&h.ctx, &mut session, 3);

        let resp = call(&h.ctx, &mut session, json!({"cmd": "createDatabase", "name": "app"}));
        assert_eq!(resp["databaseId"], "app");

        let resp = call(&h.ctx, &mut session, json!({"cmd": "openDatabase", "name": "app", "mode": "rw"}));
        assert_eq!(resp["mode"], "rw");
        assert_eq!(resp["nodeCount"], 0);

        let resp = call(&h.ctx, &mut session, json!({"cmd": "currentDatabase"}));
        assert_eq!(resp, json!({"database": "app", "mode": "rw"}));

        let resp = call(&h.ctx, &mut session, json!({"cmd": "closeDatabase"}));
        assert_eq!(resp["ok"], true);
        let resp = call(&h.ctx, &mut session, json!({"cmd": "currentDatabase"}));
        assert_eq!(resp, json!({"database": null, "mode": null}));

        let resp = call(&h.ctx, &mut session, json!({"cmd": "closeDatabase"}));
        assert_eq!(resp["code"], "NO_DATABASE_SELECTED");
    }

    #[test]
    fn test_open_missing_database_lists_existing() {
        let h = setup();
        let mut session = ClientSession::new(1);
        hello(&h.ctx, &mut session, 3);
        let resp = call(&h.ctx, &mut session, json!({"cmd": "openDatabase", "name": "ghost"}));
        assert_eq!(resp["code"], "DATABASE_NOT_FOUND");
        let message = resp["error"].as_str().unwrap();
        assert!(message.contains(DEFAULT_DATABASE));
        assert!(message.contains("createDatabase"));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_drop_and_list_databases() {
        let h = setup();
        let mut session = ClientSession::new(1);
        hello(&h.ctx, &mut session, 2);
        call(&h.ctx, &mut session, json!({"cmd": "createDatabase", "name": "tmp", "ephemeral": true}));
        call(&h.ctx, &mut session, json!({"cmd": "createDatabase", "name": "keep"}));

        let resp = call(&h.ctx, &mut session, json!({"cmd": "listDatabases"}));
        let names: Vec<&str> = resp["databases"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["default", "keep", "tmp"]);

        call(&h.ctx, &mut session, json!({"cmd": "openDatabase", "name": "keep"}));
        let resp = call(&h.ctx, &mut session, json!({"cmd": "dropDatabase", "name": "keep"}));
        assert_eq!(resp["code"], "DATABASE_IN_USE");
        call(&h.ctx, &mut session, json!({"cmd": "closeDatabase"}));
        let resp = call(&h.ctx, &mut session, json!({"cmd": "dropDatabase", "name": "keep"}));
        assert_eq!(resp["ok"], true);
        let resp = call(&h.ctx, &mut session, json!({"cmd": "dropDatabase", "name": "keep"}));
        assert_eq!(resp["code"], "DATABASE_NOT_FOUND");
    }

    #[test]
    fn test_mode_conflict_for_second_writer() {
        let h = setup();
        let mut first = ClientSession::new(1);
        let mut second = ClientSession::new(2);
        hello(&h.ctx, &mut first, 3);
        hello(&h.ctx, &mut second, 3);
        call(&h.ctx, &mut first, json!({"cmd": "createDatabase", "name": "db"}));
        call(&h.ctx, &mut first, json!({"cmd": "openDatabase", "name": "db", "mode": "rw"}));

        let resp = call(&h.ctx, &mut second, json!({"cmd": "openDatabase", "name": "db", "mode": "rw"}));
        assert_eq!(resp["code"], "MODE_CONFLICT");
        let resp = call(&h.ctx, &mut second, json!({"cmd": "openDatabase", "name": "db", "mode": "ro"}));
        assert_eq!(resp["mode"], "ro");

        let resp = call(&h.ctx, &mut second, json!({"cmd": "openDatabase", "name": "db", "mode": "write"}));
        assert_eq!(resp["code"], "INVALID_REQUEST");
    }

    // ── Preconditions ──

    #[test]
    fn test_data_ops_require_database() {
        let h = setup();
        let mut session = ClientSession::new(1);
        hello(&h.ctx, &mut session, 3);
        let requests = [
            json!({"cmd": "getNode", "id": "1"}),
            json!({"cmd": "findByType", "nodeType": "FUNCTION"}),
            json!({"cmd": "findByAttr", "query": {"file": "a.js"}}),
            json!({"cmd": "neighbors", "id": "1"}),
            json!({"cmd": "getOutgoingEdges", "id": "1"}),
            json!({"cmd": "getIncomingEdges", "id": "1"}),
            json!({"cmd": "bfs", "startIds": ["1"], "maxDepth": 2}),
            json!({"cmd": "reachability", "startIds": ["1"], "maxDepth": 2, "backward": true}),
            json!({"cmd": "commit", "nodes": []}),
            json!({"cmd": "flush"}),
            json!({"cmd": "compact"}),
            json!({"cmd": "nodeCount"}),
        ];
        for request in requests {
            let resp = call(&h.ctx, &mut session, request.clone());
            assert_eq!(resp["code"], "NO_DATABASE_SELECTED", "{}", request);
        }
    }

    #[test]
    fn test_read_only_blocks_writes() {
        let h = setup();
        let mut session = ClientSession::new(1);
        hello(&h.ctx, &mut session, 3);
        call(&h.ctx, &mut session, json!({"cmd": "openDatabase", "name": "default", "mode": "ro"}));

        for cmd in ["flush", "compact"] {
            let resp = call(&h.ctx, &mut session, json!({"cmd": cmd}));
            assert_eq!(resp["code"], "READ_ONLY_MODE");
        }
        let resp = call(&h.ctx, &mut session, json!({"cmd": "commit", "nodes": [node("k", "T", "f")]}));
        assert_eq!(resp["code"], "READ_ONLY_MODE");

        let resp = call(&h.ctx, &mut session, json!({"cmd": "nodeCount"}));
        assert_eq!(resp["count"], 0);
    }

    #[test]
    fn test_legacy_client_auto_opens_default() {
        let h = setup();
        let mut session = ClientSession::new(1);
        let resp = call(&h.ctx, &mut session, json!({"cmd": "commit", "nodes": [node("a.js->f", "FUNCTION", "a.js")]}));
        assert_eq!(resp["ok"], true);
        assert_eq!(session.protocol_version(), 1);
        assert_eq!(session.current_db_name(), Some(DEFAULT_DATABASE));

        // Legacy clients get ids from find operations
        let resp = call(&h.ctx, &mut session, json!({"cmd": "findByType", "nodeType": "FUNCTION"}));
        assert_eq!(resp["ids"], json!([compute_node_id("a.js->f").to_string()]));
    }

    // ── Data operations ──

    #[test]
    fn test_commit_flush_and_query() {
        let h = setup();
        let mut session = ClientSession::new(1);
        hello(&h.ctx, &mut session, 3);
        call(&h.ctx, &mut session, json!({"cmd": "createDatabase", "name": "g"}));
        call(&h.ctx, &mut session, json!({"cmd": "openDatabase", "name": "g"}));

        let resp = call(
            &h.ctx,
            &mut session,
            json!({
                "cmd": "commit",
                "nodes": [
                    node("a.js->f", "FUNCTION", "a.js"),
                    node("a.js->g", "FUNCTION", "a.js"),
                    node("b.js->C", "CLASS", "b.js"),
                ],
                "edges": [
                    {"src": "a.js->f", "dst": "a.js->g", "edgeType": "CALLS"},
                    {"src": "a.js->g", "dst": "b.js->C", "edgeType": "USES"},
                ],
                "changedScopes": ["a.js", "b.js"],
            }),
        );
        assert_eq!(resp["delta"]["nodesAdded"], 3);
        assert_eq!(resp["delta"]["edgesAdded"], 2);

        let resp = call(&h.ctx, &mut session, json!({"cmd": "flush"}));
        assert_eq!(resp["flush"]["nodesWritten"], 3);

        let resp = call(&h.ctx, &mut session, json!({"cmd": "getNode", "id": "a.js->f"}));
        assert_eq!(resp["node"]["semanticKey"], "a.js->f");
        assert_eq!(resp["node"]["id"], compute_node_id("a.js->f").to_string());

        let resp = call(&h.ctx, &mut session, json!({"cmd": "findByType", "nodeType": "FUNCTION"}));
        assert_eq!(resp["nodes"].as_array().unwrap().len(), 2);

        let resp = call(&h.ctx, &mut session, json!({"cmd": "bfs", "startIds": ["a.js->f"], "maxDepth": 5}));
        assert_eq!(resp["ids"].as_array().unwrap().len(), 3);

        let resp = call(
            &h.ctx,
            &mut session,
            json!({"cmd": "reachability", "startIds": ["b.js->C"], "maxDepth": 1, "backward": true}),
        );
        assert_eq!(
            resp["ids"],
            json!([compute_node_id("b.js->C").to_string(), compute_node_id("a.js->g").to_string()])
        );

        let resp = call(&h.ctx, &mut session, json!({"cmd": "getOutgoingEdges", "id": "a.js->f", "edgeTypes": ["CALLS"]}));
        assert_eq!(resp["edges"][0]["edgeType"], "CALLS");

        let resp = call(&h.ctx, &mut session, json!({"cmd": "countNodesByType"}));
        assert_eq!(resp["counts"], json!({"FUNCTION": 2, "CLASS": 1}));

        let resp = call(&h.ctx, &mut session, json!({"cmd": "nodeExists", "id": "b.js->C"}));
        assert_eq!(resp["value"], true);

        let resp = call(&h.ctx, &mut session, json!({"cmd": "compact"}));
        assert_eq!(resp["ok"], true);
        assert!(resp["compaction"]["shardsCompacted"].is_array());
    }

    #[test]
    fn test_get_stats_with_and_without_database() {
        let h = setup();
        let mut session = ClientSession::new(1);
        hello(&h.ctx, &mut session, 3);
        let resp = call(&h.ctx, &mut session, json!({"cmd": "getStats"}));
        assert!(resp.get("storage").is_none());
        assert!(resp["metrics"]["queryCount"].as_u64().unwrap() >= 1);

        call(&h.ctx, &mut session, json!({"cmd": "openDatabase", "name": "default"}));
        let resp = call(&h.ctx, &mut session, json!({"cmd": "getStats"}));
        assert_eq!(resp["database"], "default");
        assert_eq!(resp["nodeCount"], 0);
        assert_eq!(resp["storage"]["engine"], "v2");
    }

    #[test]
    fn test_shutdown_flag() {
        let h = setup();
        let mut session = ClientSession::new(1);
        let payload = rmp_serde::to_vec_named(&json!({"cmd": "shutdown"})).unwrap();
        let reply = process_frame(&h.ctx, &mut session, &payload);
        assert!(reply.shutdown);
        let resp: Value = rmp_serde::from_slice(&reply.bytes).unwrap();
        assert_eq!(resp["ok"], true);
    }
}
