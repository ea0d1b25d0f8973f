//! # PeerLink Core Library
//!
//! `peerlink-core` is a peer-to-peer communication engine for local networks.
//! Every node runs the same code: it advertises itself, watches for other
//! nodes, and both accepts and initiates connections for each protocol.
//!
//! ## Features
//!
//! - **Discovery**: UDP multicast heartbeats with staleness expiry
//! - **File transfer**: Chunked WebSocket streaming with progress, backpressure
//!   and cooperative cancellation in both directions
//! - **Chat**: Dual acceptor/connector connections with automatic reconnect
//! - **Clipboard sync**: Multi-peer broadcast with hash-based echo suppression
//!
//! Peers are trusted by virtue of being on the same LAN; traffic is neither
//! encrypted nor authenticated.
//!
//! ## Modules
//!
//! - [`chat`] - Chat connection manager
//! - [`clipboard`] - Clipboard access, history and multi-peer sync
//! - [`config`] - Configuration management
//! - [`connection`] - Local address detection and listener setup
//! - [`discovery`] - Multicast heartbeats and the peer registry
//! - [`events`] - Outbound notifications
//! - [`mod@file`] - Storage collaborator and path handling
//! - [`node`] - Wires every subsystem into a running node
//! - [`state`] - Process-wide shared handles
//! - [`transfer`] - File transfer protocol, sessions and queue
//! - [`transport`] - WebSocket writer and per-peer link table
//!
//! ## Example
//!
//! ```rust,ignore
//! use peerlink_core::{config::Config, node::Node};
//!
//! let node = Node::start(Config::load()?).await?;
//! let mut events = node.events().subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod chat;
pub mod clipboard;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod file;
pub mod node;
pub mod state;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default discovery port (UDP)
pub const DEFAULT_DISCOVERY_PORT: u16 = 37821;

/// Default multicast group for discovery heartbeats
pub const DEFAULT_MULTICAST_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(239, 255, 77, 88);

/// Default file transfer port (WebSocket over TCP)
pub const DEFAULT_TRANSFER_PORT: u16 = 7878;

/// Default chat port (WebSocket over TCP)
pub const DEFAULT_CHAT_PORT: u16 = 7879;

/// Default clipboard sync port (WebSocket over TCP)
pub const DEFAULT_CLIPBOARD_PORT: u16 = 7880;

/// Heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_SECS: u64 = 3;

/// A device not heard from for longer than this is dropped
pub const DEFAULT_STALE_AFTER_SECS: u64 = 30;

/// Default chunk size for file transfers (256 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Bytes buffered in the transport before the sender pauses (4 MB)
pub const DEFAULT_HIGH_WATER_MARK: u64 = 4 * 1024 * 1024;

/// Upper bound on the distance between two progress reports (100 KB)
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100 * 1024;

/// WebSocket close code a receiver uses to signal cancellation
pub const CANCEL_CLOSE_CODE: u16 = 4001;

/// Delay before re-establishing an outbound chat leg (milliseconds)
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 300;

/// Clipboard poll interval (milliseconds)
pub const DEFAULT_CLIPBOARD_POLL_MS: u64 = 500;

/// Number of clipboard entries kept in history
pub const DEFAULT_CLIPBOARD_HISTORY: usize = 50;

/// Prefix tag of every discovery datagram
pub const DISCOVERY_TAG: &str = "FILETRANSFER";
