//! Clipboard synchronization for PeerLink.
//!
//! Text copied on one node shows up on every connected node. Unlike chat,
//! a node keeps clipboard connections to any number of peers at once.
//!
//! ## Protocol
//!
//! - Port: 7880
//! - One JSON text frame per clipboard change:
//!   `{"content", "from_ip", "timestamp", "hash"}`
//!
//! ## Echo suppression
//!
//! The local clipboard is polled. A change is broadcast only when its digest
//! differs from the last digest this node sent or applied. Content received
//! from a peer has its digest recorded before it is written to the local
//! clipboard, so the next poll sees nothing new and does not send it back.

mod access;
mod sync;

pub use access::{create_clipboard, ClipboardAccess, MemoryClipboard, NativeClipboard};
pub use sync::{ClipboardOptions, ClipboardSyncManager};

use std::collections::VecDeque;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::chat::unix_millis;

/// Clipboard content as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardMessage {
    /// Clipboard text
    pub content: String,
    /// Address of the sender, as the sender sees itself
    pub from_ip: String,
    /// Unix time in milliseconds
    pub timestamp: u64,
    /// Sender's digest of `content`
    pub hash: String,
}

impl ClipboardMessage {
    /// Stamp and hash new content from `from_ip`.
    pub fn new(content: impl Into<String>, from_ip: IpAddr) -> Self {
        let content = content.into();
        let hash = format_hash(content_hash(&content));
        Self {
            content,
            from_ip: from_ip.to_string(),
            timestamp: unix_millis(),
            hash,
        }
    }
}

/// xxHash64 of clipboard text.
pub fn content_hash(text: &str) -> u64 {
    xxh64(text.as_bytes(), 0)
}

/// Hex form of a digest, as sent on the wire.
pub fn format_hash(hash: u64) -> String {
    format!("{hash:016x}")
}

/// Whether an entry was sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryDirection {
    /// Broadcast from this node
    Sent,
    /// Applied from a peer
    Received,
}

/// One clipboard history entry.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Which way the content went
    pub direction: HistoryDirection,
    /// The content
    pub message: ClipboardMessage,
}

/// Most recent clipboard entries, newest first.
#[derive(Debug, Clone)]
pub struct ClipboardHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl ClipboardHistory {
    /// Empty history holding at most `limit` entries.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    /// Record an entry, evicting the oldest beyond the limit.
    pub fn push(&mut self, direction: HistoryDirection, message: ClipboardMessage) {
        self.entries.push_front(HistoryEntry { direction, message });
        self.entries.truncate(self.limit);
    }

    /// Entries, newest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.0.0.7".parse().unwrap()
    }

    #[test]
    fn test_message_hash_matches_content() {
        let message = ClipboardMessage::new("hello", ip());
        assert_eq!(message.hash, format_hash(content_hash("hello")));
        assert_eq!(message.hash.len(), 16);
        assert_ne!(message.hash, ClipboardMessage::new("hello!", ip()).hash);
    }

    #[test]
    fn test_message_accepts_foreign_hash() {
        let message: ClipboardMessage = serde_json::from_str(
            r#"{"content":"x","from_ip":"10.0.0.3","timestamp":1,"hash":"abc"}"#,
        )
        .unwrap();
        assert_eq!(message.hash, "abc");
    }

    #[test]
    fn test_history_is_bounded_newest_first() {
        let mut history = ClipboardHistory::new(3);
        for i in 0..5 {
            history.push(HistoryDirection::Sent, ClipboardMessage::new(format!("{i}"), ip()));
        }
        let entries = history.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message.content, "4");
        assert_eq!(entries[2].message.content, "2");

        history.clear();
        assert!(history.is_empty());
    }
}
