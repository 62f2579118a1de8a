//! Integration test: single-file / LSM engine behavioral equivalence.
//!
//! Runs the same sequence of commits against GraphEngine and
//! GraphEngineV2 through the GraphStore trait and compares every read.
//! The LSM engine is flushed and compacted between steps so its answers
//! come from a mix of write buffer, L0 and L1.

use std::collections::HashMap;

use factdb::graph::{reachability, GraphEngine, GraphEngineV2};
use factdb::{AttrQuery, EdgeRecord, EngineConfig, GraphStore, NodeRecord};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn node(file: &str, name: &str, node_type: &str) -> NodeRecord {
    NodeRecord::new(format!("{}->{}", file, name), node_type, name, file)
}

fn edge(src: &NodeRecord, dst: &NodeRecord, edge_type: &str) -> EdgeRecord {
    EdgeRecord::new(src.id, dst.id, edge_type)
}

fn create_engines() -> (TempDir, GraphEngine, GraphEngineV2) {
    let dir = TempDir::new().unwrap();
    let v1 = GraphEngine::create(&dir.path().join("v1.factdb")).unwrap();
    let v2 = GraphEngineV2::create(&dir.path().join("v2.factdb"), EngineConfig::conservative().with_shard_count(4)).unwrap();
    (dir, v1, v2)
}

fn sorted_ids(nodes: Vec<NodeRecord>) -> Vec<u128> {
    let mut ids: Vec<u128> = nodes.into_iter().map(|n| n.id).collect();
    ids.sort_unstable();
    ids
}

fn sorted_keys(edges: Vec<EdgeRecord>) -> Vec<(u128, u128, String)> {
    let mut keys: Vec<_> = edges.iter().map(EdgeRecord::key).collect();
    keys.sort();
    keys
}

fn sorted(mut ids: Vec<u128>) -> Vec<u128> {
    ids.sort_unstable();
    ids
}

/// Small module graph: two files, one calling into the other.
struct Fixture {
    main: NodeRecord,
    run: NodeRecord,
    helper: NodeRecord,
    util: NodeRecord,
    format: NodeRecord,
    route: NodeRecord,
}

impl Fixture {
    fn new() -> Self {
        Self {
            main: node("src/main.js", "main", "MODULE"),
            run: node("src/main.js", "run", "FUNCTION").with_metadata(r#"{"async":true,"line":3}"#),
            helper: node("src/main.js", "helper", "FUNCTION"),
            util: node("src/util.js", "util", "MODULE"),
            format: node("src/util.js", "format", "FUNCTION").with_metadata(r#"{"async":false}"#),
            route: node("src/util.js", "GET /users", "http:route"),
        }
    }

    fn main_nodes(&self) -> Vec<NodeRecord> {
        vec![self.main.clone(), self.run.clone(), self.helper.clone()]
    }

    fn main_edges(&self) -> Vec<EdgeRecord> {
        vec![
            edge(&self.main, &self.run, "CONTAINS"),
            edge(&self.main, &self.helper, "CONTAINS"),
            edge(&self.run, &self.helper, "CALLS"),
            edge(&self.helper, &self.format, "CALLS"),
            edge(&self.main, &self.util, "IMPORTS_FROM"),
        ]
    }

    fn util_nodes(&self) -> Vec<NodeRecord> {
        vec![self.util.clone(), self.format.clone(), self.route.clone()]
    }

    fn util_edges(&self) -> Vec<EdgeRecord> {
        vec![
            edge(&self.util, &self.format, "CONTAINS"),
            edge(&self.util, &self.route, "CONTAINS"),
        ]
    }
}

fn load(store: &dyn GraphStore, fx: &Fixture, flush_between: bool) {
    store.commit(fx.util_nodes(), fx.util_edges(), &[]).unwrap();
    if flush_between {
        store.flush().unwrap();
    }
    store.commit(fx.main_nodes(), fx.main_edges(), &[]).unwrap();
}

fn assert_same_reads(v1: &dyn GraphStore, v2: &dyn GraphStore, fx: &Fixture) {
    assert_eq!(v1.node_count().unwrap(), v2.node_count().unwrap(), "node_count");
    assert_eq!(v1.edge_count().unwrap(), v2.edge_count().unwrap(), "edge_count");

    let all = [&fx.main, &fx.run, &fx.helper, &fx.util, &fx.format, &fx.route];
    for n in all {
        let a = v1.get_node(n.id).unwrap();
        let b = v2.get_node(n.id).unwrap();
        assert_eq!(a.is_some(), b.is_some(), "presence of {}", n.semantic_key);
        if let (Some(a), Some(b)) = (a, b) {
            assert_eq!(a.semantic_key, b.semantic_key);
            assert_eq!(a.node_type, b.node_type);
            assert_eq!(a.name, b.name);
            assert_eq!(a.file, b.file);
            assert_eq!(a.metadata, b.metadata);
            assert_eq!(a.version, b.version, "version of {}", n.semantic_key);
        }

        assert_eq!(
            sorted_keys(v1.get_outgoing_edges(n.id, None).unwrap()),
            sorted_keys(v2.get_outgoing_edges(n.id, None).unwrap()),
            "outgoing of {}",
            n.semantic_key
        );
        assert_eq!(
            sorted_keys(v1.get_incoming_edges(n.id, None).unwrap()),
            sorted_keys(v2.get_incoming_edges(n.id, None).unwrap()),
            "incoming of {}",
            n.semantic_key
        );
    }

    for t in ["FUNCTION", "MODULE", "http:*", "CLASS"] {
        assert_eq!(
            sorted_ids(v1.find_by_type(t).unwrap()),
            sorted_ids(v2.find_by_type(t).unwrap()),
            "find_by_type {}",
            t
        );
    }

    let queries = [
        AttrQuery::new().file("src/main.js"),
        AttrQuery::new().node_type("FUNCTION").metadata_filter("async", "true"),
        AttrQuery::new().name("format"),
    ];
    for q in &queries {
        assert_eq!(sorted_ids(v1.find_by_attr(q).unwrap()), sorted_ids(v2.find_by_attr(q).unwrap()), "{:?}", q);
    }

    let calls = vec!["CALLS".to_string()];
    assert_eq!(
        sorted(v1.bfs(&[fx.main.id], 5, &[]).unwrap()),
        sorted(v2.bfs(&[fx.main.id], 5, &[]).unwrap()),
        "bfs"
    );
    assert_eq!(
        sorted(reachability(v1, &[fx.format.id], 5, &calls, true).unwrap()),
        sorted(reachability(v2, &[fx.format.id], 5, &calls, true).unwrap()),
        "backward reachability"
    );

    assert_eq!(v1.count_nodes_by_type(None).unwrap(), v2.count_nodes_by_type(None).unwrap());
    assert_eq!(v1.count_edges_by_type(None).unwrap(), v2.count_edges_by_type(None).unwrap());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn initial_load_equivalent() {
    let (_dir, v1, v2) = create_engines();
    let fx = Fixture::new();
    load(&v1, &fx, false);
    load(&v2, &fx, true);

    assert_eq!(v1.node_count().unwrap(), 6);
    assert_eq!(v1.edge_count().unwrap(), 7);
    assert_same_reads(&v1, &v2, &fx);
}

#[test]
fn commit_deltas_equivalent() {
    let (_dir, v1, v2) = create_engines();
    let fx = Fixture::new();
    load(&v1, &fx, false);
    load(&v2, &fx, true);
    v2.flush().unwrap();

    // Re-analysis of src/main.js: helper disappears, run is rewritten
    let run = fx.run.clone().with_metadata(r#"{"async":false}"#);
    let nodes = vec![fx.main.clone(), run];
    let edges = vec![edge(&fx.main, &fx.run, "CONTAINS"), edge(&fx.run, &fx.format, "CALLS")];
    let scopes = vec!["src/main.js".to_string()];

    let d1 = v1.commit(nodes.clone(), edges.clone(), &scopes).unwrap();
    let d2 = v2.commit(nodes, edges, &scopes).unwrap();

    assert_eq!(d1.version, d2.version);
    assert_eq!(d1.nodes_added, d2.nodes_added);
    assert_eq!(d1.nodes_removed, d2.nodes_removed);
    assert_eq!(d1.nodes_modified, d2.nodes_modified);
    assert_eq!(d1.edges_added, d2.edges_added);
    assert_eq!(d1.edges_removed, d2.edges_removed);
    assert_eq!(d1.nodes_removed, 1);
    assert_eq!(d1.nodes_modified, 2);

    assert!(v1.get_node(fx.helper.id).unwrap().is_none());
    assert_same_reads(&v1, &v2, &fx);
}

#[test]
fn equivalent_after_flush_and_compaction() {
    let (_dir, v1, v2) = create_engines();
    let fx = Fixture::new();
    load(&v1, &fx, false);
    load(&v2, &fx, true);
    v2.flush().unwrap();

    let scopes = vec!["src/util.js".to_string()];
    v1.commit(vec![fx.util.clone(), fx.format.clone()], fx.util_edges()[..1].to_vec(), &scopes).unwrap();
    v2.commit(vec![fx.util.clone(), fx.format.clone()], fx.util_edges()[..1].to_vec(), &scopes).unwrap();
    v2.flush().unwrap();
    assert_same_reads(&v1, &v2, &fx);

    v1.compact().unwrap();
    v2.compact().unwrap();
    assert!(v2.get_node(fx.route.id).unwrap().is_none());
    assert_same_reads(&v1, &v2, &fx);
}

#[test]
fn type_filters_equivalent() {
    let (_dir, v1, v2) = create_engines();
    let fx = Fixture::new();
    load(&v1, &fx, false);
    load(&v2, &fx, true);

    let filters: [Option<Vec<String>>; 3] = [
        None,
        Some(vec!["CALLS".to_string()]),
        Some(vec!["CONTAINS".to_string(), "IMPORTS_FROM".to_string()]),
    ];
    for filter in &filters {
        let f = filter.as_deref();
        for n in [&fx.main, &fx.run, &fx.helper] {
            assert_eq!(
                sorted_keys(v1.get_outgoing_edges(n.id, f).unwrap()),
                sorted_keys(v2.get_outgoing_edges(n.id, f).unwrap())
            );
        }
        assert_eq!(v1.count_edges_by_type(f).unwrap(), v2.count_edges_by_type(f).unwrap());
    }

    let types = vec!["FUNCTION".to_string(), "http:*".to_string()];
    let counts: HashMap<String, usize> = v2.count_nodes_by_type(Some(&types)).unwrap();
    assert_eq!(counts, v1.count_nodes_by_type(Some(&types)).unwrap());
    assert_eq!(counts.get("FUNCTION"), Some(&3));
}

#[test]
fn neighbors_equivalent() {
    let (_dir, v1, v2) = create_engines();
    let fx = Fixture::new();
    load(&v1, &fx, false);
    load(&v2, &fx, true);

    for n in [&fx.main, &fx.run, &fx.util] {
        assert_eq!(
            sorted(v1.neighbors(n.id, &[]).unwrap()),
            sorted(v2.neighbors(n.id, &[]).unwrap())
        );
    }
    assert_eq!(sorted(v1.neighbors(fx.main.id, &[]).unwrap()).len(), 3);
}
