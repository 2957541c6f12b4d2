//! Websocket front for the in-memory backend

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::MemoryBackend;
use crate::transport::{bridge_websocket, Transport};

/// Pause after a failed accept (out of file descriptors, aborted handshake)
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Accept websocket clients on `listener` until `shutdown` fires
///
/// Each client is one physical connection carrying any number of channels.
/// A failed accept is logged and the loop keeps going.
pub async fn serve_websocket(
    backend: MemoryBackend,
    listener: TcpListener,
    buffer: usize,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on ws://{}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY) => continue,
                }
            }
        };

        let backend = backend.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("Websocket handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            info!("Client {} connected", peer);

            let (socket_end, server_end) = Transport::pair(buffer);
            let served = backend.serve(server_end);
            let end = bridge_websocket(ws, socket_end, shutdown).await;
            served.await.ok();
            debug!("Client {} gone ({:?})", peer, end);
        });
    }

    info!("Server stopped accepting connections");
    Ok(())
}
