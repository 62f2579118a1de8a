//! Framed stream transport
//!
//! ```text
//! Request:  [4-byte length BE] [MessagePack payload]
//! Response: [4-byte length BE] [MessagePack payload]
//! ```
//!
//! One thread per connection. Network I/O never happens while a store
//! lock is held: a frame is read completely before dispatch, and the
//! reply is written after dispatch returns.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixListener;
use std::sync::{Arc, PoisonError};
use std::thread;

use tracing::{debug, info, warn};

use super::handler::process_frame;
use super::ServerContext;

/// Largest accepted frame payload
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Read one frame. `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(stream: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes (limit {})", len, MAX_FRAME_BYTES),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(stream: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()
}

/// Serve one connection until the peer disconnects or asks for shutdown.
/// The session is registered for the lifetime of the connection.
pub fn handle_client<S: Read + Write>(mut stream: S, ctx: &ServerContext) {
    let (client_id, session) = ctx.sessions.create();
    debug!(client = client_id, "Client connected");

    loop {
        let payload = match read_frame(&mut stream) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(client = client_id, "Client disconnected");
                break;
            }
            Err(e) => {
                warn!(client = client_id, error = %e, "Read error, closing connection");
                break;
            }
        };

        let reply = {
            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
            process_frame(ctx, &mut session, &payload)
        };

        if let Err(e) = write_frame(&mut stream, &reply.bytes) {
            warn!(client = client_id, error = %e, "Write error, closing connection");
            break;
        }

        if reply.shutdown {
            info!(client = client_id, "Shutdown requested by client");
            ctx.request_shutdown();
            break;
        }
    }

    ctx.sessions.destroy(client_id, &ctx.manager);
}

/// Accept connections forever, one thread each.
pub fn serve_unix(listener: UnixListener, ctx: Arc<ServerContext>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let ctx = Arc::clone(&ctx);
                let spawned = thread::Builder::new()
                    .name("factdb-client".to_string())
                    .spawn(move || handle_client(stream, &ctx));
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to spawn client thread");
                }
            }
            Err(e) => warn!(error = %e, "Accept error"),
        }
    }
}
