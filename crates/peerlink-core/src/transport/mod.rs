//! WebSocket plumbing shared by chat and clipboard sync.
//!
//! A connection to a peer may have been accepted by our listener or dialed by
//! us; both are written through the same [`WsWriter`]. The [`LinkTable`] keys
//! live connections by peer address and keeps at most one inbound and one
//! outbound leg per peer.

mod links;

pub use links::{Direction, Insertion, LinkId, LinkTable, Removal};

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::connection::normalize_peer_ip;
use crate::error::{Error, Result};

/// Write half of a WebSocket accepted by a local listener.
pub type AcceptedSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Write half of a WebSocket dialed by this node.
pub type DialedSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of a WebSocket dialed by this node.
pub type DialedStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Writer shared between a connection's owner and its read loop.
pub type SharedWriter = Arc<Mutex<WsWriter>>;

/// Write side of a peer connection, whichever side opened it.
pub enum WsWriter {
    /// Connection accepted by our listener
    Accepted(AcceptedSink),
    /// Connection we dialed
    Dialed(DialedSink),
}

impl WsWriter {
    /// Wrap in the shared handle used by the link table.
    pub fn shared(self) -> SharedWriter {
        Arc::new(Mutex::new(self))
    }

    /// Send a raw frame.
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        match self {
            Self::Accepted(sink) => sink.send(msg).await?,
            Self::Dialed(sink) => sink.send(msg).await?,
        }
        Ok(())
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.send(Message::text(text)).await
    }

    /// Close with a normal close frame. Errors are ignored since the peer
    /// may already be gone.
    pub async fn close(&mut self) {
        let _ = self.send(Message::Close(None)).await;
    }

    /// Close with an application close code.
    pub async fn close_with_code(&mut self, code: u16, reason: &'static str) {
        let _ = self.send(close_message(code, reason)).await;
    }
}

/// Close frame carrying `code` and `reason`.
pub fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: Utf8Bytes::from_static(reason),
    }))
}

/// Dial `ws://addr`.
pub async fn dial(addr: SocketAddr) -> Result<(DialedSink, DialedStream)> {
    let url = format!("ws://{addr}");
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| Error::PeerUnreachable {
            peer: addr.to_string(),
            reason: e.to_string(),
        })?;
    Ok(ws_stream.split())
}

/// Accept WebSocket connections on `listener` until `shutdown` fires.
///
/// Each peer address is normalized against `local_ip`, and each connection
/// completes its handshake and runs `handler` on its own task.
pub(crate) fn spawn_acceptor<F, Fut>(
    subsystem: &'static str,
    listener: TcpListener,
    local_ip: IpAddr,
    mut shutdown: broadcast::Receiver<()>,
    handler: F,
) where
    F: Fn(WebSocketStream<TcpStream>, IpAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let peer = normalize_peer_ip(remote.ip(), local_ip);
                        tracing::debug!("New {} connection from {}", subsystem, peer);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            match tokio_tungstenite::accept_async(stream).await {
                                Ok(ws) => (*handler)(ws, peer).await,
                                Err(e) => {
                                    tracing::warn!("WebSocket handshake with {} failed: {}", peer, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept {} connection: {}", subsystem, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::debug!("{} listener stopped", subsystem);
                    break;
                }
            }
        }
    });
}

/// Wait for the next text frame on a connection.
///
/// Ping and pong are answered by the WebSocket layer; binary frames are not
/// part of the text protocols and are skipped. Returns `None` once the peer
/// closes or the connection fails.
pub async fn next_text<S>(reader: &mut S, peer: IpAddr) -> Option<String>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) => {
                tracing::debug!("Connection closed by {}", peer);
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                if !is_disconnect(&e) {
                    tracing::warn!("WebSocket error from {}: {}", peer, e);
                }
                return None;
            }
        }
    }
    None
}

/// Whether an error is just the peer going away.
pub fn is_disconnect(e: &WsError) -> bool {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof
        ),
        WsError::Protocol(_) => true,
        _ => false,
    }
}
