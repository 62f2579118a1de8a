//! factdb-server: serves graph databases over a Unix socket
//! (4-byte big-endian length + MessagePack) and, optionally, WebSocket.
//!
//! Usage:
//!   factdb-server ./default.factdb --socket /tmp/factdb.sock [--data-dir DIR] [--ws-addr 127.0.0.1:7474] [--metrics]

use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use factdb::config::ServerConfig;
use factdb::database_manager::{DatabaseManager, DEFAULT_DATABASE};
use factdb::metrics::Metrics;
use factdb::server::{transport, websocket, ServerContext};

fn main() {
    let config = ServerConfig::parse();
    init_logging();

    if let Err(e) = run(config) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("FACTDB_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(config: ServerConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting factdb-server");

    let engine_config = config
        .engine_config()
        .with_context(|| format!("Failed to load engine config {:?}", config.config))?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let manager = Arc::new(DatabaseManager::new(data_dir.clone(), engine_config));
    manager
        .create_default_from_path(&config.db_path)
        .with_context(|| format!("Failed to open default database {}", config.db_path.display()))?;
    info!(data_dir = %data_dir.display(), "Multi-database directory");

    if let Ok(db) = manager.get_database(DEFAULT_DATABASE) {
        match (db.node_count(), db.edge_count()) {
            (Ok(nodes), Ok(edges)) => info!(nodes, edges, "Default database opened"),
            (Err(e), _) | (_, Err(e)) => warn!(error = %e, "Default database opened but cannot be read"),
        }
    }

    let metrics = if config.metrics {
        info!("Metrics collection enabled");
        Some(Arc::new(Metrics::new()))
    } else {
        None
    };

    let (ctx, shutdown) = ServerContext::new(Arc::clone(&manager), metrics);

    // Stale socket from a previous run
    let _ = std::fs::remove_file(&config.socket);
    let listener = UnixListener::bind(&config.socket)
        .with_context(|| format!("Failed to bind socket {}", config.socket.display()))?;
    info!(socket = %config.socket.display(), "Listening");

    let unix_ctx = Arc::clone(&ctx);
    thread::Builder::new()
        .name("factdb-accept".to_string())
        .spawn(move || transport::serve_unix(listener, unix_ctx))
        .context("Failed to spawn accept thread")?;

    // Kept alive until shutdown; dropping it stops the WebSocket tasks.
    let _runtime = match &config.ws_addr {
        Some(addr) => Some(start_websocket(addr, Arc::clone(&ctx))?),
        None => None,
    };

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    let signal_tx = ctx.shutdown_sender();
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received signal");
            let _ = signal_tx.try_send(());
        }
    });

    // Wait for a signal or a client `shutdown`
    let _ = shutdown.recv();
    shutdown_gracefully(&manager, &config.socket);
    Ok(())
}

fn start_websocket(addr: &str, ctx: Arc<ServerContext>) -> Result<tokio::runtime::Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("factdb-ws")
        .build()
        .context("Failed to build async runtime")?;
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind(addr))
        .with_context(|| format!("Failed to bind WebSocket address {}", addr))?;
    runtime.spawn(websocket::serve(listener, ctx));
    Ok(runtime)
}

fn shutdown_gracefully(manager: &DatabaseManager, socket: &Path) {
    info!("Shutting down, flushing databases");
    for (name, result) in manager.flush_all() {
        match result {
            Ok(stats) => info!(database = %name, nodes = stats.nodes_written, edges = stats.edges_written, "Flushed"),
            Err(e) => error!(database = %name, error = %e, "Flush failed"),
        }
    }
    let _ = std::fs::remove_file(socket);
    info!("Exiting");
}
