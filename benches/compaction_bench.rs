//! Compaction throughput benchmark.
//!
//! Measures L0->L1 compaction with varying numbers of L0 segments, and
//! with a share of the graph tombstoned by scope replacement.
//!
//! Run: cargo bench --bench compaction_bench

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use factdb::graph::GraphEngineV2;
use factdb::storage_v2::CompactionResult;
use factdb::{EdgeRecord, EngineConfig, GraphStore, NodeRecord};
use tempfile::TempDir;

const FILES: usize = 100;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn file_of(idx: usize) -> String {
    format!("src/file_{}.js", idx % FILES)
}

fn make_nodes(count: usize, offset: usize) -> Vec<NodeRecord> {
    (0..count)
        .map(|i| {
            let idx = offset + i;
            let file = file_of(idx);
            NodeRecord::new(format!("{}->func_{}", file, idx), "FUNCTION", format!("func_{}", idx), file)
        })
        .collect()
}

/// `count` CALLS edges chaining consecutive nodes of `nodes`.
fn make_edges(nodes: &[NodeRecord], count: usize) -> Vec<EdgeRecord> {
    (0..count)
        .map(|i| {
            let src = &nodes[i % nodes.len()];
            let dst = &nodes[(i + 1 + i / nodes.len()) % nodes.len()];
            EdgeRecord::new(src.id, dst.id, "CALLS")
        })
        .collect()
}

fn engine_in(dir: &TempDir) -> GraphEngineV2 {
    let mut config = EngineConfig::conservative();
    // Compaction only when the benchmark asks for it
    config.compaction.segment_threshold = usize::MAX;
    GraphEngineV2::create(&dir.path().join("bench.factdb"), config).unwrap()
}

/// Engine with `segment_count` flushes, each carrying an equal share of
/// `total_nodes` nodes. Edges (3x node count) go into the first batch.
fn create_graph_with_l0_segments(total_nodes: usize, segment_count: usize) -> (TempDir, GraphEngineV2) {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let nodes_per_segment = total_nodes / segment_count;

    for seg in 0..segment_count {
        let offset = seg * nodes_per_segment;
        let batch_size = if seg == segment_count - 1 {
            total_nodes - offset
        } else {
            nodes_per_segment
        };
        let nodes = make_nodes(batch_size, offset);
        let edges = if seg == 0 { make_edges(&nodes, total_nodes * 3) } else { Vec::new() };
        engine.commit(nodes, edges, &[]).unwrap();
        engine.flush().unwrap();
    }

    (dir, engine)
}

/// Engine whose second L0 generation tombstones `removed_files` of the
/// files written by the first.
fn create_graph_with_tombstones(total_nodes: usize, removed_files: usize) -> (TempDir, GraphEngineV2) {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);

    let nodes = make_nodes(total_nodes, 0);
    let edges = make_edges(&nodes, total_nodes * 3);
    engine.commit(nodes, edges, &[]).unwrap();
    engine.flush().unwrap();

    let scopes: Vec<String> = (0..removed_files).map(file_of).collect();
    engine.commit(Vec::new(), Vec::new(), &scopes).unwrap();
    engine.flush().unwrap();

    (dir, engine)
}

fn print_stats(label: &str, result: &CompactionResult) {
    eprintln!();
    eprintln!("=== Compaction Stats ({}) ===", label);
    eprintln!("Shards compacted: {}", result.shards_compacted.len());
    eprintln!("Segments merged: {}", result.segments_merged);
    eprintln!("Nodes merged: {}", result.nodes_merged);
    eprintln!("Edges merged: {}", result.edges_merged);
    eprintln!("Tombstones removed: {}", result.tombstones_removed);
    eprintln!("Duration: {}ms", result.duration_ms);
    if result.duration_ms > 0 {
        let total_records = (result.nodes_merged + result.edges_merged) as f64;
        let seconds = result.duration_ms as f64 / 1000.0;
        eprintln!("Throughput: {:.0} records/sec", total_records / seconds);
    }
    if result.nodes_merged + result.tombstones_removed > 0 {
        eprintln!(
            "Tombstone ratio: {:.2}",
            result.tombstones_removed as f64 / (result.nodes_merged + result.tombstones_removed) as f64
        );
    }
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_compact_segments(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact");

    for segments in [4, 8, 12] {
        group.bench_with_input(BenchmarkId::new("segments", segments), &segments, |b, &segments| {
            b.iter_batched(
                || create_graph_with_l0_segments(10_000, segments),
                |(_dir, engine)| black_box(engine.compact().unwrap()),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_compact_with_tombstones(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact_tombstones");

    for removed in [20, 50] {
        group.bench_with_input(BenchmarkId::new("files_removed", removed), &removed, |b, &removed| {
            b.iter_batched(
                || create_graph_with_tombstones(10_000, removed),
                |(_dir, engine)| black_box(engine.compact().unwrap()),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// One untimed run of each scenario, printed for humans.
fn print_compaction_stats(_c: &mut Criterion) {
    let (_dir, engine) = create_graph_with_l0_segments(10_000, 8);
    print_stats("8 L0 segments, 10K nodes", &engine.compact().unwrap());

    let (_dir2, engine2) = create_graph_with_tombstones(10_000, 20);
    print_stats("10K nodes, 20 of 100 files removed", &engine2.compact().unwrap());
}

criterion_group!(
    compaction,
    bench_compact_segments,
    bench_compact_with_tombstones,
    print_compaction_stats,
);
criterion_main!(compaction);

// ---------------------------------------------------------------------------
// Validation tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_result_non_zero() {
        let (_dir, engine) = create_graph_with_l0_segments(1_000, 4);
        let result = engine.compact().unwrap();
        assert_eq!(result.nodes_merged, 1_000);
        assert!(!result.shards_compacted.is_empty());
        assert_eq!(engine.node_count().unwrap(), 1_000);
    }

    #[test]
    fn test_compact_tombstones_removed() {
        let (_dir, engine) = create_graph_with_tombstones(1_000, 20);
        let result = engine.compact().unwrap();
        assert_eq!(result.nodes_merged, 800);
        assert!(result.tombstones_removed >= 200);
        assert_eq!(engine.node_count().unwrap(), 800);
    }
}
