//! Graph traversal

use std::collections::{HashSet, VecDeque};

use crate::error::Result;

/// Breadth-first traversal from `start` up to `max_depth` hops.
///
/// Returns every visited id once, in visit order; start ids are at depth 0.
/// The visited set makes cycles harmless.
pub fn bfs<F>(start: &[u128], max_depth: usize, mut neighbors: F) -> Result<Vec<u128>>
where
    F: FnMut(u128) -> Result<Vec<u128>>,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    let mut result = Vec::new();

    for &id in start {
        if visited.insert(id) {
            queue.push_back((id, 0usize));
        }
    }

    while let Some((id, depth)) = queue.pop_front() {
        result.push(id);
        if depth >= max_depth {
            continue;
        }
        for next in neighbors(id)? {
            if visited.insert(next) {
                queue.push_back((next, depth + 1));
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn adjacency(edges: &[(u128, u128)]) -> HashMap<u128, Vec<u128>> {
        let mut adj: HashMap<u128, Vec<u128>> = HashMap::new();
        for &(a, b) in edges {
            adj.entry(a).or_default().push(b);
        }
        adj
    }

    fn run(adj: &HashMap<u128, Vec<u128>>, start: &[u128], depth: usize) -> Vec<u128> {
        bfs(start, depth, |id| Ok(adj.get(&id).cloned().unwrap_or_default())).unwrap()
    }

    #[test]
    fn test_bfs_depth_limit() {
        let adj = adjacency(&[(1, 2), (2, 3), (3, 4)]);
        assert_eq!(run(&adj, &[1], 0), vec![1]);
        assert_eq!(run(&adj, &[1], 2), vec![1, 2, 3]);
        assert_eq!(run(&adj, &[1], 10), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_bfs_cycle_terminates() {
        let adj = adjacency(&[(1, 2), (2, 3), (3, 1), (3, 3)]);
        assert_eq!(run(&adj, &[1], 100), vec![1, 2, 3]);
    }

    #[test]
    fn test_bfs_duplicate_starts() {
        let adj = adjacency(&[(1, 2)]);
        assert_eq!(run(&adj, &[1, 1, 2], 5), vec![1, 2]);
    }

    #[test]
    fn test_bfs_propagates_errors() {
        let err = bfs(&[1], 3, |_| Err(crate::error::GraphError::NoDatabaseSelected));
        assert!(err.is_err());
    }

    /// Reference: nodes whose shortest distance from a start is <= depth.
    fn reachable_within(adj: &HashMap<u128, Vec<u128>>, start: &[u128], depth: usize) -> HashSet<u128> {
        let mut dist: HashMap<u128, usize> = start.iter().map(|&s| (s, 0)).collect();
        let mut frontier: Vec<u128> = start.to_vec();
        for d in 1..=depth {
            let mut next = Vec::new();
            for id in frontier {
                for &n in adj.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
                    if !dist.contains_key(&n) {
                        dist.insert(n, d);
                        next.push(n);
                    }
                }
            }
            frontier = next;
        }
        dist.into_keys().collect()
    }

    proptest! {
        #[test]
        fn prop_bfs_visits_reachable_set_once(
            edges in prop::collection::vec((0u128..12, 0u128..12), 0..40),
            start in prop::collection::vec(0u128..12, 1..3),
            depth in 0usize..6,
        ) {
            let adj = adjacency(&edges);
            let visited = run(&adj, &start, depth);
            let unique: HashSet<u128> = visited.iter().copied().collect();
            prop_assert_eq!(unique.len(), visited.len());
            prop_assert_eq!(unique, reachable_within(&adj, &start, depth));
        }
    }
}
