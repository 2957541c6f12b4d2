//! Physical connections
//!
//! A [`Transport`] is one end of a duplex stream of encoded frames. The
//! multiplexer (client side) and the backend (server side) only ever see
//! transports; [`bridge_websocket`] turns a websocket into one.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One end of a physical connection
#[derive(Debug)]
pub struct Transport {
    /// Encoded frames to send to the peer
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Encoded frames received from the peer
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

impl Transport {
    /// Two connected in-memory ends, each direction buffering `buffer` frames
    pub fn pair(buffer: usize) -> (Transport, Transport) {
        let buffer = buffer.max(1);
        let (a_tx, b_rx) = mpsc::channel(buffer);
        let (b_tx, a_rx) = mpsc::channel(buffer);
        (
            Transport {
                outbound: a_tx,
                inbound: a_rx,
            },
            Transport {
                outbound: b_tx,
                inbound: b_rx,
            },
        )
    }
}

/// Why a bridged websocket stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The remote side closed or the socket failed
    Remote,
    /// The local transport was dropped
    Local,
    /// Shutdown was requested
    Shutdown,
}

/// Pump frames between a websocket and a transport until either side ends
pub async fn bridge_websocket<S>(
    ws: WebSocketStream<S>,
    mut transport: Transport,
    shutdown: CancellationToken,
) -> BridgeEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();

    let end = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break BridgeEnd::Shutdown,

            outgoing = transport.inbound.recv() => {
                match outgoing {
                    Some(bytes) => {
                        if let Err(e) = write.send(Message::Binary(bytes)).await {
                            warn!("Websocket write failed: {}", e);
                            break BridgeEnd::Remote;
                        }
                    }
                    None => break BridgeEnd::Local,
                }
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        if transport.outbound.send(bytes).await.is_err() {
                            break BridgeEnd::Local;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await.ok();
                    }
                    Some(Ok(Message::Close(_))) | None => break BridgeEnd::Remote,
                    Some(Err(e)) => {
                        debug!("Websocket read failed: {}", e);
                        break BridgeEnd::Remote;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    write.close().await.ok();
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_crossed() {
        let (mut a, mut b) = Transport::pair(4);

        a.outbound.send(vec![1, 2]).await.unwrap();
        b.outbound.send(vec![3]).await.unwrap();

        assert_eq!(b.inbound.recv().await, Some(vec![1, 2]));
        assert_eq!(a.inbound.recv().await, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_pair_end_is_observed() {
        let (a, mut b) = Transport::pair(1);
        drop(a);
        assert_eq!(b.inbound.recv().await, None);
    }
}
