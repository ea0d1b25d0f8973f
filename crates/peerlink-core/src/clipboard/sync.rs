//! Multi-peer clipboard sync manager.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::{
    content_hash, ClipboardAccess, ClipboardHistory, ClipboardMessage, HistoryDirection,
    HistoryEntry,
};
use crate::config::Config;
use crate::connection::bind_reusable_listener;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::state::SharedState;
use crate::transport::{
    self, next_text, spawn_acceptor, Direction, LinkId, LinkTable, SharedWriter, WsWriter,
};

/// Settings for a [`ClipboardSyncManager`].
#[derive(Debug, Clone)]
pub struct ClipboardOptions {
    /// Address the clipboard listener binds
    pub bind_addr: SocketAddr,
    /// Port dialed on peers
    pub peer_port: u16,
    /// This node's LAN address
    pub local_ip: IpAddr,
    /// How often the local clipboard is read
    pub poll_interval: Duration,
    /// Number of history entries kept
    pub history_limit: usize,
}

impl ClipboardOptions {
    /// Options from configuration.
    pub fn from_config(config: &Config, local_ip: IpAddr) -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.network.clipboard_port),
            peer_port: config.network.clipboard_port,
            local_ip,
            poll_interval: config.clipboard.poll_interval,
            history_limit: config.clipboard.history_limit,
        }
    }
}

struct SyncInner {
    options: ClipboardOptions,
    links: LinkTable,
    clipboard: Arc<std::sync::Mutex<Box<dyn ClipboardAccess>>>,
    history: std::sync::Mutex<ClipboardHistory>,
    state: Arc<SharedState>,
    events: EventBus,
    server: Mutex<Option<(SocketAddr, broadcast::Sender<()>)>>,
    poller: Mutex<Option<broadcast::Sender<()>>>,
}

/// Keeps the clipboard in step with every connected peer.
///
/// Cloning is cheap; clones share the same connections and poll loop.
#[derive(Clone)]
pub struct ClipboardSyncManager {
    inner: Arc<SyncInner>,
}

impl std::fmt::Debug for ClipboardSyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipboardSyncManager")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl ClipboardSyncManager {
    /// Create a manager over `clipboard`. Nothing runs until a server or the
    /// poll loop is started.
    pub fn new(
        options: ClipboardOptions,
        clipboard: Box<dyn ClipboardAccess>,
        state: Arc<SharedState>,
        events: EventBus,
    ) -> Self {
        let history = ClipboardHistory::new(options.history_limit);
        Self {
            inner: Arc::new(SyncInner {
                options,
                links: LinkTable::new(),
                clipboard: Arc::new(std::sync::Mutex::new(clipboard)),
                history: std::sync::Mutex::new(history),
                state,
                events,
                server: Mutex::new(None),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Start accepting clipboard connections. Returns the bound address.
    pub async fn start_server(&self) -> Result<SocketAddr> {
        let mut server = self.inner.server.lock().await;
        if let Some((addr, _)) = server.as_ref() {
            return Ok(*addr);
        }

        let listener = match bind_reusable_listener("clipboard", self.inner.options.bind_addr) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Clipboard server unavailable: {}", e);
                self.inner.events.emit(Event::ClipboardServerError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inner = Arc::clone(&self.inner);
        spawn_acceptor(
            "clipboard",
            listener,
            self.inner.options.local_ip,
            shutdown_rx,
            move |ws, peer| Arc::clone(&inner).accept(ws, peer),
        );

        tracing::info!("Clipboard server listening on {}", addr);
        *server = Some((addr, shutdown_tx));
        Ok(addr)
    }

    /// Stop accepting connections. Live connections stay up.
    pub async fn stop_server(&self) {
        if let Some((addr, shutdown_tx)) = self.inner.server.lock().await.take() {
            let _ = shutdown_tx.send(());
            tracing::info!("Clipboard server on {} stopped", addr);
        }
    }

    /// Connect to `peer` unless a connection already exists.
    pub async fn connect(&self, peer: IpAddr) -> Result<()> {
        if self.inner.links.contains(peer).await {
            return Ok(());
        }
        let addr = SocketAddr::new(peer, self.inner.options.peer_port);
        let (sink, stream) = transport::dial(addr).await?;
        self.inner
            .register(peer, Direction::Outbound, WsWriter::Dialed(sink), stream)
            .await;
        Ok(())
    }

    /// Close every connection to `peer`.
    pub async fn disconnect(&self, peer: IpAddr) {
        let writers = self.inner.links.take(peer).await;
        if writers.is_empty() {
            return;
        }
        for writer in writers {
            writer.lock().await.close().await;
        }
        tracing::info!("Clipboard sync with {} closed", peer);
        self.inner.events.emit(Event::ClipboardDisconnected { peer });
    }

    /// Close every clipboard connection.
    pub async fn disconnect_all(&self) {
        for (peer, writers) in self.inner.links.drain().await {
            for writer in writers {
                writer.lock().await.close().await;
            }
            self.inner.events.emit(Event::ClipboardDisconnected { peer });
        }
    }

    /// Start watching the local clipboard. Does nothing if already running.
    pub async fn start_polling(&self) {
        let mut poller = self.inner.poller.lock().await;
        if poller.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.options.poll_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::debug!("Clipboard polling stopped");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {
                        if let Err(e) = inner.poll_once().await {
                            tracing::debug!("Clipboard poll failed: {}", e);
                        }
                    }
                }
            }
        });

        tracing::info!("Clipboard polling every {:?}", interval);
        *poller = Some(stop_tx);
    }

    /// Stop watching the local clipboard.
    pub async fn stop_polling(&self) {
        if let Some(stop_tx) = self.inner.poller.lock().await.take() {
            let _ = stop_tx.send(());
        }
    }

    /// Whether the poll loop is running.
    pub async fn is_polling(&self) -> bool {
        self.inner.poller.lock().await.is_some()
    }

    /// Run one poll step: broadcast the local clipboard if it changed.
    ///
    /// Returns the broadcast message, or `None` when there was nothing new.
    pub async fn poll_once(&self) -> Result<Option<ClipboardMessage>> {
        self.inner.poll_once().await
    }

    /// Broadcast the local clipboard now, changed or not.
    pub async fn send_now(&self) -> Result<ClipboardMessage> {
        let text = self.inner.read_local().await?.ok_or(Error::ClipboardEmpty)?;
        self.inner.state.set_last_clipboard_hash(content_hash(&text));
        Ok(self.inner.broadcast(text).await)
    }

    /// Write `text` to the local clipboard without it being sent back out.
    pub async fn set_local(&self, text: &str) -> Result<()> {
        self.inner.state.set_last_clipboard_hash(content_hash(text));
        self.inner.write_local(text.to_owned()).await
    }

    /// Recent clipboard entries, newest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries()
    }

    /// Every connected peer.
    pub async fn peers(&self) -> Vec<IpAddr> {
        self.inner.links.peers().await
    }
}

impl SyncInner {
    /// Run `op` against the clipboard on the blocking pool; system clipboard
    /// calls can block on the display server.
    async fn with_clipboard<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn ClipboardAccess>) -> Result<T> + Send + 'static,
    {
        let clipboard = Arc::clone(&self.clipboard);
        tokio::task::spawn_blocking(move || {
            let mut guard = clipboard.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut guard)
        })
        .await
        .map_err(|e| Error::Internal(format!("clipboard task failed: {e}")))?
    }

    async fn read_local(&self) -> Result<Option<String>> {
        let text = self.with_clipboard(|clipboard| clipboard.read_text()).await?;
        Ok(text.filter(|t| !t.is_empty()))
    }

    async fn write_local(&self, text: String) -> Result<()> {
        self.with_clipboard(move |clipboard| clipboard.write_text(&text))
            .await
    }

    fn record(&self, direction: HistoryDirection, message: ClipboardMessage) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(direction, message);
    }

    async fn poll_once(&self) -> Result<Option<ClipboardMessage>> {
        let Some(text) = self.read_local().await? else {
            return Ok(None);
        };
        let hash = content_hash(&text);
        if hash == self.state.last_clipboard_hash() {
            return Ok(None);
        }
        self.state.set_last_clipboard_hash(hash);
        tracing::debug!("Local clipboard changed ({} bytes)", text.len());
        Ok(Some(self.broadcast(text).await))
    }

    /// Send `text` to every peer and record it.
    async fn broadcast(&self, text: String) -> ClipboardMessage {
        let message = ClipboardMessage::new(text, self.options.local_ip);
        let mut delivered = 0;

        match serde_json::to_string(&message) {
            Ok(json) => {
                let sends = self
                    .links
                    .writers()
                    .await
                    .into_iter()
                    .map(|(peer, writer)| Self::send_to(peer, writer, json.clone()));
                for (peer, writer, sent) in join_all(sends).await {
                    match sent {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            tracing::warn!("Failed to send clipboard to {}: {}", peer, e);
                            let removal = self.links.remove_writer(peer, &writer).await;
                            if removal.removed && removal.peer_gone {
                                self.events.emit(Event::ClipboardDisconnected { peer });
                            }
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("Failed to encode clipboard message: {}", e),
        }

        self.record(HistoryDirection::Sent, message.clone());
        self.events.emit(Event::ClipboardSent {
            message: message.clone(),
            peers: delivered,
        });
        message
    }

    async fn send_to(
        peer: IpAddr,
        writer: SharedWriter,
        json: String,
    ) -> (IpAddr, SharedWriter, Result<()>) {
        let sent = writer.lock().await.send_text(json).await;
        (peer, writer, sent)
    }

    async fn apply_incoming(&self, message: ClipboardMessage) {
        self.state
            .set_last_clipboard_hash(content_hash(&message.content));
        if let Err(e) = self.write_local(message.content.clone()).await {
            tracing::warn!("Could not apply clipboard from {}: {}", message.from_ip, e);
        }
        tracing::debug!(
            "Applied clipboard from {} ({} bytes)",
            message.from_ip,
            message.content.len()
        );
        self.record(HistoryDirection::Received, message.clone());
        self.events.emit(Event::ClipboardReceived(message));
    }

    async fn accept(self: Arc<Self>, ws: WebSocketStream<TcpStream>, peer: IpAddr) {
        let (sink, stream) = ws.split();
        self.register(peer, Direction::Inbound, WsWriter::Accepted(sink), stream)
            .await;
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
            tracing::info!("Clipboard sync connected to {}", peer);
            self.events.emit(Event::ClipboardConnected { peer });
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.read_loop(peer, insertion.id, reader).await });
    }

    async fn read_loop<S>(self: Arc<Self>, peer: IpAddr, id: LinkId, mut reader: S)
    where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        while let Some(text) = next_text(&mut reader, peer).await {
            match serde_json::from_str::<ClipboardMessage>(&text) {
                Ok(message) => self.apply_incoming(message).await,
                Err(e) => tracing::warn!("Dropping malformed clipboard message from {}: {}", peer, e),
            }
        }

        let removal = self.links.remove(peer, id).await;
        if removal.removed && removal.peer_gone {
            tracing::info!("Clipboard sync with {} disconnected", peer);
            self.events.emit(Event::ClipboardDisconnected { peer });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;

    fn manager(clipboard: &MemoryClipboard) -> (ClipboardSyncManager, Arc<SharedState>, EventBus) {
        let state = SharedState::new(".");
        let events = EventBus::default();
        let manager = ClipboardSyncManager::new(
            ClipboardOptions::from_config(&Config::default(), Ipv4Addr::LOCALHOST.into()),
            Box::new(clipboard.clone()),
            Arc::clone(&state),
            events.clone(),
        );
        (manager, state, events)
    }

    #[tokio::test]
    async fn test_poll_broadcasts_only_changes() {
        let clipboard = MemoryClipboard::new();
        let (manager, state, _events) = manager(&clipboard);

        assert!(manager.poll_once().await.unwrap().is_none());

        clipboard.set("first");
        let sent = manager.poll_once().await.unwrap().expect("changed");
        assert_eq!(sent.content, "first");
        assert_eq!(state.last_clipboard_hash(), content_hash("first"));

        assert!(manager.poll_once().await.unwrap().is_none());
        assert_eq!(manager.history().len(), 1);
    }

    #[tokio::test]
    async fn test_applied_content_is_not_echoed() {
        let clipboard = MemoryClipboard::new();
        let (manager, _state, events) = manager(&clipboard);
        let mut rx = events.subscribe();

        manager
            .inner
            .apply_incoming(ClipboardMessage::new(
                "from a peer",
                "10.0.0.8".parse().unwrap(),
            ))
            .await;
        assert_eq!(clipboard.get().as_deref(), Some("from a peer"));
        assert!(matches!(rx.recv().await.unwrap(), Event::ClipboardReceived(_)));

        assert!(manager.poll_once().await.unwrap().is_none());
        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].direction, HistoryDirection::Received);
    }

    #[tokio::test]
    async fn test_send_now_requires_content() {
        let clipboard = MemoryClipboard::new();
        let (manager, _state, _events) = manager(&clipboard);
        assert!(matches!(manager.send_now().await, Err(Error::ClipboardEmpty)));

        clipboard.set("again");
        manager.send_now().await.unwrap();
        let message = manager.send_now().await.unwrap();
        assert_eq!(message.content, "again");
        assert_eq!(manager.history().len(), 2);
    }

    #[tokio::test]
    async fn test_set_local_suppresses_broadcast() {
        let clipboard = MemoryClipboard::new();
        let (manager, _state, _events) = manager(&clipboard);
        manager.set_local("typed by the user").await.unwrap();
        assert_eq!(clipboard.get().as_deref(), Some("typed by the user"));
        assert!(manager.poll_once().await.unwrap().is_none());
    }

    /// A WebSocket listener that forwards every text frame it receives.
    async fn text_sink_server() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let _ = tx.send(text.to_string());
                        }
                    }
                });
            }
        });
        (addr, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_peer_does_not_hold_up_others() {
        let clipboard = MemoryClipboard::new();
        let events = EventBus::default();
        let manager = ClipboardSyncManager::new(
            ClipboardOptions::from_config(&Config::default(), Ipv4Addr::LOCALHOST.into()),
            Box::new(clipboard.clone()),
            SharedState::new("."),
            events.clone(),
        );
        let mut rx = events.subscribe();

        let (addr, mut received) = text_sink_server().await;
        let (stalled_sink, _stalled_stream) = transport::dial(addr).await.unwrap();
        let (live_sink, _live_stream) = transport::dial(addr).await.unwrap();
        let stalled_peer: IpAddr = "10.0.0.8".parse().unwrap();
        let live_peer: IpAddr = "10.0.0.9".parse().unwrap();
        let stalled = WsWriter::Dialed(stalled_sink).shared();
        manager
            .inner
            .links
            .insert(stalled_peer, Direction::Outbound, Arc::clone(&stalled))
            .await;
        manager
            .inner
            .links
            .insert(live_peer, Direction::Outbound, WsWriter::Dialed(live_sink).shared())
            .await;

        // Another task is mid-send on the stalled peer.
        let busy = stalled.lock().await;
        clipboard.set("shared text");
        let poll = tokio::spawn({
            let manager = manager.clone();
            async move { manager.poll_once().await }
        });

        let text = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .expect("live peer served while the other is stalled")
            .unwrap();
        assert!(text.contains("shared text"));

        assert!(!poll.is_finished());
        drop(busy);

        let sent = tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .expect("poll finishes once the stalled send resumes")
            .unwrap()
            .unwrap();
        assert!(sent.is_some());
        assert!(received.recv().await.unwrap().contains("shared text"));

        let event = loop {
            let event = rx.recv().await.unwrap();
            if matches!(event, Event::ClipboardSent { .. }) {
                break event;
            }
        };
        assert!(matches!(event, Event::ClipboardSent { peers: 2, .. }));
    }
}
