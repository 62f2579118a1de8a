//! Background compaction worker.
//!
//! One dedicated thread per database. Flushes nudge it with `request()`;
//! it then compacts every shard whose L0 count has reached the threshold.
//! Outcomes come back over a result channel (`drain_results()`); failures
//! never reach the writer whose flush triggered the pass.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage_v2::compaction::CompactionResult;
use crate::storage_v2::multi_shard::MultiShardStore;

enum Request {
    Compact,
    /// Replied to once every earlier request has been handled
    Barrier(Sender<()>),
    Shutdown,
}

pub struct CompactionWorker {
    handle: Option<JoinHandle<()>>,
    requests: Sender<Request>,
    results: Receiver<Result<CompactionResult>>,
}

impl CompactionWorker {
    /// Start the worker thread for `store`.
    pub fn start(store: Arc<MultiShardStore>, name: &str) -> std::io::Result<Self> {
        let (requests, inbox) = unbounded();
        let (result_tx, results) = unbounded();

        let label = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("factdb-compaction-{}", name))
            .spawn(move || worker_loop(store, label, inbox, result_tx))?;

        info!(database = name, "Started background compaction worker");
        Ok(Self {
            handle: Some(handle),
            requests,
            results,
        })
    }

    /// Ask for a compaction pass. Never blocks.
    pub fn request(&self) {
        if self.requests.send(Request::Compact).is_err() {
            warn!("Compaction worker is gone, request dropped");
        }
    }

    /// Block until every request sent before this call has been handled.
    pub fn wait_idle(&self) {
        let (tx, rx) = unbounded();
        if self.requests.send(Request::Barrier(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Outcomes of passes that did work or failed, since the last call.
    pub fn drain_results(&self) -> Vec<Result<CompactionResult>> {
        self.results.try_iter().collect()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Finish the pass in progress, then stop the thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.requests.send(Request::Shutdown);
            if let Err(e) = handle.join() {
                warn!("Compaction worker panicked: {:?}", e);
            }
            debug!("Compaction worker stopped");
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    store: Arc<MultiShardStore>,
    name: String,
    inbox: Receiver<Request>,
    results: Sender<Result<CompactionResult>>,
) {
    while let Ok(request) = inbox.recv() {
        match request {
            Request::Compact => {
                // Collapse a burst of nudges into one pass.
                let mut barriers = Vec::new();
                let mut stop = false;
                for queued in inbox.try_iter() {
                    match queued {
                        Request::Compact => {}
                        Request::Barrier(reply) => barriers.push(reply),
                        Request::Shutdown => stop = true,
                    }
                }

                match store.compact_due() {
                    Ok(result) if result.is_noop() => {}
                    Ok(result) => {
                        let _ = results.send(Ok(result));
                    }
                    Err(e) => {
                        warn!(database = %name, error = %e, "Background compaction failed");
                        let _ = results.send(Err(e));
                    }
                }

                for reply in barriers {
                    let _ = reply.send(());
                }
                if stop {
                    break;
                }
            }
            Request::Barrier(reply) => {
                let _ = reply.send(());
            }
            Request::Shutdown => break,
        }
    }
    debug!(database = %name, "Compaction worker loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::GraphError;
    use crate::storage::NodeRecord;

    fn store(threshold: usize) -> Arc<MultiShardStore> {
        let mut config = EngineConfig::conservative().with_shard_count(1);
        config.compaction.segment_threshold = threshold;
        Arc::new(MultiShardStore::ephemeral(config).unwrap())
    }

    fn flush_one(store: &MultiShardStore, key: &str) {
        store
            .commit(vec![NodeRecord::new(key, "T", key, "f.js")], vec![], &[])
            .unwrap();
        store.flush().unwrap();
    }

    #[test]
    fn test_worker_start_stop() {
        let mut worker = CompactionWorker::start(store(2), "t").unwrap();
        assert!(worker.is_running());
        worker.shutdown();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_worker_compacts_due_shards() {
        let store = store(2);
        let worker = CompactionWorker::start(Arc::clone(&store), "t").unwrap();
        flush_one(&store, "a");
        flush_one(&store, "b");
        worker.request();
        worker.wait_idle();

        assert_eq!(store.snapshot().shards()[0].l0_segment_count(), 0);
        assert_eq!(store.node_count().unwrap(), 2);
        let done = worker.drain_results();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].as_ref().unwrap().shards_compacted, vec![0]);
        assert!(worker.drain_results().is_empty());
    }

    #[test]
    fn test_worker_ignores_shards_below_threshold() {
        let store = store(3);
        let worker = CompactionWorker::start(Arc::clone(&store), "t").unwrap();
        flush_one(&store, "a");
        worker.request();
        worker.request();
        worker.wait_idle();
        assert_eq!(store.snapshot().shards()[0].l0_segment_count(), 1);
        assert!(worker.drain_results().is_empty());
    }

    #[test]
    fn test_worker_reports_failures() {
        let store = store(1);
        let worker = CompactionWorker::start(Arc::clone(&store), "t").unwrap();
        let _ = store.note_error(GraphError::Manifest("broken".into()));
        worker.request();
        worker.wait_idle();
        let results = worker.drain_results();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(GraphError::DatabaseUnusable(_))));
    }
}
