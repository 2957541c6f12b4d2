//! Persistent websocket link
//!
//! Keeps a multiplexer attached to a websocket server, reconnecting with
//! exponential backoff. Every reconnect attaches a fresh link; channels
//! closed by the previous link loss are reopened by their owners.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Multiplexer;
use crate::transport::{bridge_websocket, BridgeEnd, Transport};

/// Configuration for a persistent websocket link
#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    /// WebSocket URL
    pub url: String,
    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// Frames buffered per direction
    pub write_buffer: usize,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            write_buffer: 256,
        }
    }
}

/// Handle to stop the link task
pub struct WebsocketHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl WebsocketHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the socket and stop reconnecting
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.task.await.ok();
    }
}

/// Spawn the link task for `mux`
pub fn spawn_websocket(config: WebsocketConfig, mux: Multiplexer) -> WebsocketHandle {
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(link_loop(config, mux, shutdown.clone()));
    WebsocketHandle { shutdown, task }
}

/// Main link loop with reconnection
async fn link_loop(config: WebsocketConfig, mux: Multiplexer, shutdown: CancellationToken) {
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        debug!("Connecting to {}", config.url);

        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connect_async(config.url.as_str()) => result,
        };

        match connected {
            Ok((ws, _)) => {
                info!("Connected to {}", config.url);
                let (ours, theirs) = Transport::pair(config.write_buffer);
                mux.attach(ours);

                let end = bridge_websocket(ws, theirs, shutdown.clone()).await;
                mux.detach();

                match end {
                    BridgeEnd::Shutdown => break,
                    BridgeEnd::Local => {
                        debug!("Link to {} dropped locally", config.url);
                    }
                    BridgeEnd::Remote => {
                        info!("Disconnected from {}", config.url);
                    }
                }
                // Connection was up, reset backoff
                reconnect_delay = config.initial_reconnect_delay;
            }
            Err(e) => {
                warn!(
                    "Connection to {} failed: {} (retrying in {:?})",
                    config.url, e, reconnect_delay
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {
                reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
            }
            _ = shutdown.cancelled() => break,
        }
    }

    mux.detach();
    debug!("Link task for {} stopped", config.url);
}
