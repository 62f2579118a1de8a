//! Protocol server: wire types, request dispatch and the two transports.
//!
//! - `transport`: Unix stream socket, 4-byte big-endian length + MessagePack
//! - `websocket`: one MessagePack payload per binary WebSocket message
//!
//! Both feed frames through `handler::process_frame`, so a session behaves
//! the same whatever carries it.

pub mod handler;
pub mod protocol;
pub mod transport;
pub mod websocket;

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::database_manager::DatabaseManager;
use crate::metrics::Metrics;
use crate::session::SessionRegistry;

pub use handler::{handle_request, process_frame, Reply};
pub use protocol::{Request, Response, WireEdge, WireNode};

/// State shared by every connection of one server.
pub struct ServerContext {
    pub manager: Arc<DatabaseManager>,
    pub sessions: SessionRegistry,
    /// None unless metrics collection is enabled
    pub metrics: Option<Arc<Metrics>>,
    shutdown: Sender<()>,
}

impl ServerContext {
    /// The receiver fires once a client sends `shutdown` (or a signal
    /// handler calls `request_shutdown`).
    pub fn new(manager: Arc<DatabaseManager>, metrics: Option<Arc<Metrics>>) -> (Arc<Self>, Receiver<()>) {
        let (shutdown, requested) = bounded(1);
        let ctx = Arc::new(Self {
            manager,
            sessions: SessionRegistry::new(),
            metrics,
            shutdown,
        });
        (ctx, requested)
    }

    pub fn request_shutdown(&self) {
        // A full channel means a shutdown is already pending.
        let _ = self.shutdown.try_send(());
    }

    pub fn shutdown_sender(&self) -> Sender<()> {
        self.shutdown.clone()
    }
}
