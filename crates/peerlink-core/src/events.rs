//! Outbound notifications.
//!
//! Subsystems never call into a UI. They push [`Event`]s onto an [`EventBus`]
//! and any number of consumers subscribe to it.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::chat::ChatMessage;
use crate::clipboard::ClipboardMessage;
use crate::discovery::Device;
use crate::transfer::TransferProgress;

/// Default number of events buffered per subscriber.
const EVENT_CAPACITY: usize = 1024;

/// Notification pushed by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Event {
    /// The visible device set changed
    DevicesChanged {
        /// Snapshot of every live device, sorted by address
        devices: Vec<Device>,
    },
    /// Discovery could not start
    DiscoveryError {
        /// Human-readable cause
        message: String,
    },
    /// A peer started sending a file to this node
    FileReceivingStarted {
        /// File name (or relative path for folder items)
        name: String,
        /// Declared size, if the sender sent one
        size: Option<u64>,
        /// Position in the sender's queue (0-based, as sent)
        index: Option<u32>,
        /// Length of the sender's queue
        total: Option<u32>,
        /// Sender address
        from: IpAddr,
    },
    /// A file was received completely
    FileReceived {
        /// File name
        name: String,
        /// Bytes written
        size: u64,
        /// Where the file was stored
        path: PathBuf,
    },
    /// An incoming file ended early; the partial output was deleted
    FileReceiveCancelled {
        /// File name
        name: String,
        /// Bytes received before the stream ended
        bytes_received: u64,
        /// Declared size, if known
        expected: Option<u64>,
    },
    /// An incoming file could not be stored
    FileReceiveFailed {
        /// File name
        name: String,
        /// Human-readable cause
        reason: String,
    },
    /// This node started sending a file
    FileSending {
        /// File name
        name: String,
        /// File size
        size: u64,
        /// Position in the queue (0-based, as sent)
        index: u32,
        /// Length of the queue
        total: u32,
        /// Receiver address
        to: IpAddr,
    },
    /// The receiver accepted the whole file
    FileSent {
        /// File name
        name: String,
        /// File size
        size: u64,
        /// Receiver address
        to: IpAddr,
    },
    /// Progress of a transfer in either direction
    TransferProgress(TransferProgress),
    /// The transfer listener failed
    TransferServerError {
        /// Human-readable cause
        message: String,
    },
    /// A chat leg was established
    ChatConnected {
        /// Peer address
        peer: IpAddr,
    },
    /// A chat leg closed
    ChatDisconnected {
        /// Peer address
        peer: IpAddr,
    },
    /// A chat message arrived
    ChatMessageReceived(ChatMessage),
    /// The chat listener failed
    ChatServerError {
        /// Human-readable cause
        message: String,
    },
    /// A clipboard peer connected
    ClipboardConnected {
        /// Peer address
        peer: IpAddr,
    },
    /// A clipboard peer disconnected
    ClipboardDisconnected {
        /// Peer address
        peer: IpAddr,
    },
    /// Clipboard content arrived and was applied
    ClipboardReceived(ClipboardMessage),
    /// Local clipboard content was broadcast
    ClipboardSent {
        /// The broadcast message
        message: ClipboardMessage,
        /// Number of peers that accepted it
        peers: usize,
    },
    /// The clipboard listener failed
    ClipboardServerError {
        /// Human-readable cause
        message: String,
    },
}

impl Event {
    /// Stable notification name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DevicesChanged { .. } => "devices-changed",
            Self::DiscoveryError { .. } => "discovery-error",
            Self::FileReceivingStarted { .. } => "file-receiving-started",
            Self::FileReceived { .. } => "file-received",
            Self::FileReceiveCancelled { .. } => "file-receive-cancelled",
            Self::FileReceiveFailed { .. } => "file-receive-failed",
            Self::FileSending { .. } => "file-sending",
            Self::FileSent { .. } => "file-sent",
            Self::TransferProgress(_) => "transfer-progress",
            Self::TransferServerError { .. } => "transfer-server-error",
            Self::ChatConnected { .. } => "chat-connected",
            Self::ChatDisconnected { .. } => "chat-disconnected",
            Self::ChatMessageReceived(_) => "chat-message-received",
            Self::ChatServerError { .. } => "chat-server-error",
            Self::ClipboardConnected { .. } => "clipboard-connected",
            Self::ClipboardDisconnected { .. } => "clipboard-disconnected",
            Self::ClipboardReceived(_) => "clipboard-received",
            Self::ClipboardSent { .. } => "clipboard-sent",
            Self::ClipboardServerError { .. } => "clipboard-server-error",
        }
    }
}

/// Fan-out channel for [`Event`]s.
///
/// Cloning the bus is cheap; every clone publishes to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Events published with no subscriber are dropped.
    pub fn emit(&self, event: Event) {
        tracing::trace!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(Event::ChatConnected {
            peer: "10.0.0.5".parse().unwrap(),
        });

        assert_eq!(a.recv().await.unwrap().name(), "chat-connected");
        assert_eq!(b.recv().await.unwrap().name(), "chat-connected");
    }

    #[test]
    fn test_emit_without_subscribers_is_dropped() {
        let bus = EventBus::new(4);
        bus.emit(Event::DiscoveryError {
            message: "nope".to_string(),
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::FileReceived {
            name: "a.bin".to_string(),
            size: 3,
            path: PathBuf::from("/tmp/a.bin"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "file-received");
        assert_eq!(json["payload"]["name"], "a.bin");
        assert_eq!(json["payload"]["size"], 3);
    }
}
