//! Peer-to-peer chat.
//!
//! Every node both listens for chat connections and dials them. A peer may
//! therefore be reachable over two legs at once (one it opened, one we
//! opened); the [`LinkTable`] keeps them under a single entry and messages go
//! out over our own leg when there is one.
//!
//! ## Protocol
//!
//! - Port: 7879
//! - One JSON text frame per message: `{"content", "from_ip", "timestamp"}`
//! - Timestamps are Unix milliseconds
//!
//! ## Sessions
//!
//! A node chats with one peer at a time. The session peer is set by
//! [`ChatManager::connect`], or by auto-accept when a peer connects while no
//! session is active, and cleared by an explicit disconnect. Whenever the
//! session peer connects to us and we hold no leg of our own, we dial back
//! after a short delay, which is how a dropped session heals itself.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::config::Config;
use crate::connection::bind_reusable_listener;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::transport::{
    self, next_text, spawn_acceptor, Direction, LinkId, LinkTable, WsWriter,
};

/// A chat message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message text
    pub content: String,
    /// Address of the sender, as the sender sees itself
    pub from_ip: String,
    /// Unix time in milliseconds
    pub timestamp: u64,
}

impl ChatMessage {
    /// Stamp a new message from `from_ip`.
    pub fn new(content: impl Into<String>, from_ip: IpAddr) -> Self {
        Self {
            content: content.into(),
            from_ip: from_ip.to_string(),
            timestamp: unix_millis(),
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Settings for a [`ChatManager`].
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Address the chat listener binds
    pub bind_addr: SocketAddr,
    /// Port dialed on peers
    pub peer_port: u16,
    /// This node's LAN address
    pub local_ip: IpAddr,
    /// Delay before dialing back a peer that connected to us
    pub reconnect_delay: Duration,
    /// Start a session with an unsolicited peer when none is active
    pub auto_accept: bool,
}

impl ChatOptions {
    /// Options from configuration.
    pub fn from_config(config: &Config, local_ip: IpAddr) -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.network.chat_port),
            peer_port: config.network.chat_port,
            local_ip,
            reconnect_delay: config.chat.reconnect_delay,
            auto_accept: config.chat.auto_accept,
        }
    }
}

struct ChatInner {
    options: ChatOptions,
    links: LinkTable,
    session: Mutex<Option<IpAddr>>,
    server: Mutex<Option<(SocketAddr, broadcast::Sender<()>)>>,
    events: EventBus,
}

/// Owns every chat connection of this node.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ChatManager {
    inner: Arc<ChatInner>,
}

impl std::fmt::Debug for ChatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatManager")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl ChatManager {
    /// Create a manager. Nothing is bound until [`Self::start_server`].
    pub fn new(options: ChatOptions, events: EventBus) -> Self {
        Self {
            inner: Arc::new(ChatInner {
                options,
                links: LinkTable::new(),
                session: Mutex::new(None),
                server: Mutex::new(None),
                events,
            }),
        }
    }

    /// Start accepting chat connections. Returns the bound address; calling
    /// it again while running returns the same address.
    pub async fn start_server(&self) -> Result<SocketAddr> {
        let mut server = self.inner.server.lock().await;
        if let Some((addr, _)) = server.as_ref() {
            return Ok(*addr);
        }

        let listener = match bind_reusable_listener("chat", self.inner.options.bind_addr) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Chat server unavailable: {}", e);
                self.inner.events.emit(Event::ChatServerError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inner = Arc::clone(&self.inner);
        spawn_acceptor(
            "chat",
            listener,
            self.inner.options.local_ip,
            shutdown_rx,
            move |ws, peer| Arc::clone(&inner).accept(ws, peer),
        );

        tracing::info!("Chat server listening on {}", addr);
        *server = Some((addr, shutdown_tx));
        Ok(addr)
    }

    /// Stop accepting connections. Live connections stay up.
    pub async fn stop_server(&self) {
        if let Some((addr, shutdown_tx)) = self.inner.server.lock().await.take() {
            let _ = shutdown_tx.send(());
            tracing::info!("Chat server on {} stopped", addr);
        }
    }

    /// Start a session with `peer`, dialing it unless we already hold a leg.
    pub async fn connect(&self, peer: IpAddr) -> Result<()> {
        *self.inner.session.lock().await = Some(peer);
        if self.inner.links.has(peer, Direction::Outbound).await {
            return Ok(());
        }
        self.inner.dial(peer).await
    }

    /// Send `content` to `peer`.
    pub async fn send(&self, peer: IpAddr, content: &str) -> Result<ChatMessage> {
        let writer = self
            .inner
            .links
            .writer(peer)
            .await
            .ok_or(Error::NotConnected(peer))?;

        let message = ChatMessage::new(content, self.inner.options.local_ip);
        let text = serde_json::to_string(&message)?;
        let sent = writer.lock().await.send_text(text).await;

        if let Err(e) = sent {
            tracing::warn!("Chat write to {} failed: {}", peer, e);
            let removal = self.inner.links.remove_writer(peer, &writer).await;
            if removal.removed && removal.peer_gone {
                self.inner.events.emit(Event::ChatDisconnected { peer });
            }
            return Err(Error::ConnectionLost {
                peer: peer.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(message)
    }

    /// Close every leg to `peer` and end the session with it.
    pub async fn disconnect(&self, peer: IpAddr) {
        {
            let mut session = self.inner.session.lock().await;
            if *session == Some(peer) {
                *session = None;
            }
        }
        let writers = self.inner.links.take(peer).await;
        if writers.is_empty() {
            return;
        }
        for writer in writers {
            writer.lock().await.close().await;
        }
        tracing::info!("Chat with {} closed", peer);
        self.inner.events.emit(Event::ChatDisconnected { peer });
    }

    /// Close every chat connection.
    pub async fn disconnect_all(&self) {
        *self.inner.session.lock().await = None;
        for (peer, writers) in self.inner.links.drain().await {
            for writer in writers {
                writer.lock().await.close().await;
            }
            self.inner.events.emit(Event::ChatDisconnected { peer });
        }
    }

    /// Peer of the current session.
    pub async fn session_peer(&self) -> Option<IpAddr> {
        *self.inner.session.lock().await
    }

    /// Whether any leg to `peer` is live.
    pub async fn is_connected(&self, peer: IpAddr) -> bool {
        self.inner.links.contains(peer).await
    }

    /// Whether this node holds a leg it dialed itself to `peer`.
    pub async fn has_outbound(&self, peer: IpAddr) -> bool {
        self.inner.links.has(peer, Direction::Outbound).await
    }

    /// Every connected peer.
    pub async fn peers(&self) -> Vec<IpAddr> {
        self.inner.links.peers().await
    }
}

impl ChatInner {
    async fn dial(self: &Arc<Self>, peer: IpAddr) -> Result<()> {
        let addr = SocketAddr::new(peer, self.options.peer_port);
        let (sink, stream) = transport::dial(addr).await?;
        self.register(peer, Direction::Outbound, WsWriter::Dialed(sink), stream)
            .await;
        Ok(())
    }

    async fn accept(self: Arc<Self>, ws: WebSocketStream<TcpStream>, peer: IpAddr) {
        let (sink, stream) = ws.split();
        self.register(peer, Direction::Inbound, WsWriter::Accepted(sink), stream)
            .await;

        if self.should_dial_back(peer).await {
            let inner = Arc::clone(&self);
            tokio::spawn(async move { inner.dial_back(peer).await });
        }
    }

    /// Decide, under the session lock, whether an inbound leg from `peer`
    /// should be answered with one of our own.
    async fn should_dial_back(&self, peer: IpAddr) -> bool {
        if !self.options.auto_accept {
            return false;
        }
        let mut session = self.session.lock().await;
        match *session {
            None => {
                tracing::info!("Accepting chat from {}", peer);
                *session = Some(peer);
            }
            Some(current) if current == peer => {}
            Some(_) => return false,
        }
        !self.links.has(peer, Direction::Outbound).await
    }

    async fn dial_back(self: Arc<Self>, peer: IpAddr) {
        tokio::time::sleep(self.options.reconnect_delay).await;
        if *self.session.lock().await != Some(peer)
            || self.links.has(peer, Direction::Outbound).await
        {
            return;
        }
        match self.dial(peer).await {
            Ok(()) => tracing::debug!("Chat leg to {} re-established", peer),
            Err(e) => tracing::warn!("Could not dial back {}: {}", peer, e),
        }
    }

    async fn register<S>(
        self: &Arc<Self>,
        peer: IpAddr,
        direction: Direction,
        writer: WsWriter,
        reader: S,
    ) where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send + 'static,
    {
        let insertion = self.links.insert(peer, direction, writer.shared()).await;
        if let Some(old) = insertion.replaced {
            old.lock().await.close().await;
        }
        if insertion.new_peer {
            tracing::info!("Chat connected to {}", peer);
            self.events.emit(Event::ChatConnected { peer });
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.read_loop(peer, insertion.id, reader).await });
    }

    async fn read_loop<S>(self: Arc<Self>, peer: IpAddr, id: LinkId, mut reader: S)
    where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        while let Some(text) = next_text(&mut reader, peer).await {
            match serde_json::from_str::<ChatMessage>(&text) {
                Ok(message) => self.events.emit(Event::ChatMessageReceived(message)),
                Err(e) => tracing::warn!("Dropping malformed chat message from {}: {}", peer, e),
            }
        }

        let removal = self.links.remove(peer, id).await;
        if removal.removed && removal.peer_gone {
            tracing::info!("Chat with {} disconnected", peer);
            self.events.emit(Event::ChatDisconnected { peer });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let message: ChatMessage =
            serde_json::from_str(r#"{"content":"hi","from_ip":"10.0.0.2","timestamp":1700000000000}"#)
                .unwrap();
        assert_eq!(message.content, "hi");
        assert_eq!(message.from_ip, "10.0.0.2");
        assert_eq!(message.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_new_message_is_stamped() {
        let message = ChatMessage::new("hello", "192.168.1.4".parse().unwrap());
        assert_eq!(message.from_ip, "192.168.1.4");
        assert!(message.timestamp > 1_600_000_000_000);
    }

    #[test]
    fn test_options_from_config() {
        let options = ChatOptions::from_config(&Config::default(), Ipv4Addr::LOCALHOST.into());
        assert_eq!(options.bind_addr.port(), 7879);
        assert_eq!(options.peer_port, 7879);
        assert_eq!(options.reconnect_delay, Duration::from_millis(300));
        assert!(options.auto_accept);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let manager = ChatManager::new(
            ChatOptions::from_config(&Config::default(), Ipv4Addr::LOCALHOST.into()),
            EventBus::default(),
        );
        let peer: IpAddr = "10.0.0.9".parse().unwrap();
        let err = manager.send(peer, "hello").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected(ip) if ip == peer));
    }
}
