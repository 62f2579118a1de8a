//! WebSocket transport
//!
//! Same protocol as the stream socket without the length prefix: every
//! binary message carries one MessagePack request, answered by one binary
//! message. Dispatch runs on the blocking pool since store calls block.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::handler::process_frame;
use super::protocol::{encode_response, Response};
use super::ServerContext;
use crate::error::GraphError;

/// Accept WebSocket connections forever.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "WebSocket transport listening");
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(handle_connection(stream, peer, ctx));
            }
            Err(e) => warn!(error = %e, "WebSocket accept error"),
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut sender, mut receiver) = ws.split();
    let (client_id, session) = ctx.sessions.create();
    debug!(client = client_id, %peer, "WebSocket client connected");

    while let Some(message) = receiver.next().await {
        let payload = match message {
            Ok(Message::Binary(payload)) => payload,
            Ok(Message::Text(_)) => {
                let err = GraphError::InvalidRequest("text frames are not supported, send MessagePack as binary".into());
                match encode_response(None, Response::error(&err)) {
                    Ok(bytes) => {
                        if sender.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode error response"),
                }
                continue;
            }
            Ok(Message::Ping(data)) => {
                if sender.send(Message::Pong(data)).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(client = client_id, error = %e, "WebSocket read error");
                break;
            }
        };

        let task_ctx = Arc::clone(&ctx);
        let task_session = Arc::clone(&session);
        let reply = tokio::task::spawn_blocking(move || {
            let mut session = task_session.lock().unwrap_or_else(PoisonError::into_inner);
            process_frame(&task_ctx, &mut session, &payload)
        })
        .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!(client = client_id, error = %e, "Request task failed");
                break;
            }
        };

        if sender.send(Message::Binary(reply.bytes)).await.is_err() {
            break;
        }
        if reply.shutdown {
            info!(client = client_id, "Shutdown requested by WebSocket client");
            ctx.request_shutdown();
            break;
        }
    }

    let manager = Arc::clone(&ctx.manager);
    let ctx_for_cleanup = Arc::clone(&ctx);
    // Closing a database may flush or drop an engine; keep that off the reactor.
    let _ = tokio::task::spawn_blocking(move || ctx_for_cleanup.sessions.destroy(client_id, &manager)).await;
    debug!(client = client_id, "WebSocket client disconnected");
}
