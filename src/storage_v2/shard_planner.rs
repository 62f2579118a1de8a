//! Deterministic shard assignment by id range.
//!
//! The u128 id space is split into `shard_count` contiguous ranges using
//! the top 64 bits of the id. Ids are BLAKE3 output, so ranges receive
//! near-equal load, and each shard owns one `[lo, hi]` interval that
//! zone-map key ranges can be checked against. Edges live in the shard
//! of their `src`.

use std::borrow::Borrow;

use crate::storage::{EdgeRecord, NodeRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlanner {
    shard_count: u16,
}

impl ShardPlanner {
    /// # Panics
    ///
    /// Panics if `shard_count` is 0.
    pub fn new(shard_count: u16) -> Self {
        assert!(shard_count > 0, "shard_count must be > 0");
        Self { shard_count }
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    /// Shard owning `id`: `floor(top64(id) * shard_count / 2^64)`.
    #[inline]
    pub fn shard_for_id(&self, id: u128) -> u16 {
        let top = id >> 64;
        ((top * self.shard_count as u128) >> 64) as u16
    }

    /// Inclusive id range owned by `shard`.
    pub fn range(&self, shard: u16) -> (u128, u128) {
        let count = self.shard_count as u128;
        let first_top = |s: u128| ((s << 64) + count - 1) / count;
        let lo_top = first_top(shard as u128);
        let hi_top = first_top(shard as u128 + 1) - 1;
        (lo_top << 64, (hi_top << 64) | u64::MAX as u128)
    }

    /// Group nodes by owning shard. Index `i` of the result is shard `i`.
    /// Works on owned records or references.
    pub fn plan_nodes<R: Borrow<NodeRecord>>(&self, nodes: impl IntoIterator<Item = R>) -> Vec<Vec<R>> {
        let mut out: Vec<Vec<R>> = (0..self.shard_count).map(|_| Vec::new()).collect();
        for n in nodes {
            let shard = self.shard_for_id(n.borrow().id);
            out[shard as usize].push(n);
        }
        out
    }

    /// Group edges by the shard of their src.
    pub fn plan_edges<R: Borrow<EdgeRecord>>(&self, edges: impl IntoIterator<Item = R>) -> Vec<Vec<R>> {
        let mut out: Vec<Vec<R>> = (0..self.shard_count).map(|_| Vec::new()).collect();
        for e in edges {
            let shard = self.shard_for_id(e.borrow().src);
            out[shard as usize].push(e);
        }
        out
    }
}
