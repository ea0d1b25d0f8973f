//! Error types for PeerLink.
//!
//! This module provides a unified error type for all PeerLink operations,
//! with specific error variants for different failure modes.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// A specialized `Result` type for PeerLink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for PeerLink.
#[derive(Error, Debug)]
pub enum Error {
    /// A listening or multicast socket could not be set up (E001)
    #[error("{subsystem} failed to bind {addr}: {reason}")]
    BindFailed {
        /// Which subsystem owns the socket
        subsystem: &'static str,
        /// Address that was requested
        addr: String,
        /// Underlying cause
        reason: String,
    },

    /// The peer refused or could not be reached (E002)
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable {
        /// Target address
        peer: String,
        /// Underlying cause
        reason: String,
    },

    /// Connection dropped while a session was in progress (E003)
    #[error("connection to {peer} lost: {reason}")]
    ConnectionLost {
        /// Remote address
        peer: String,
        /// Underlying cause
        reason: String,
    },

    /// Invalid protocol message (E004)
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Transfer cancelled by this node
    #[error("transfer of '{file}' cancelled")]
    CancelledByLocal {
        /// File being transferred
        file: String,
    },

    /// Transfer cancelled by the remote node
    #[error("transfer of '{file}' cancelled by receiver")]
    CancelledByRemote {
        /// File being transferred
        file: String,
    },

    /// Destination could not be opened or written (E005)
    #[error("storage error on '{file}': {reason}")]
    StorageError {
        /// File being written
        file: String,
        /// Underlying cause
        reason: String,
    },

    /// Unknown storage handle
    #[error("invalid storage handle: {0}")]
    InvalidHandle(u64),

    /// No live connection to the peer (E006)
    #[error("not connected to {0}")]
    NotConnected(IpAddr),

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid user input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Could not determine the LAN address of this machine
    #[error("no network connection detected")]
    NoNetwork,

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Clipboard access failed
    #[error("clipboard error: {0}")]
    ClipboardError(String),

    /// Clipboard is empty
    #[error("clipboard is empty")]
    ClipboardEmpty,

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::BindFailed { .. } => Some("E001"),
            Self::PeerUnreachable { .. } => Some("E002"),
            Self::ConnectionLost { .. } => Some("E003"),
            Self::ProtocolError(_) => Some("E004"),
            Self::StorageError { .. } => Some("E005"),
            Self::NotConnected(_) => Some("E006"),
            Self::CancelledByLocal { .. } => Some("E007"),
            Self::CancelledByRemote { .. } => Some("E008"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PeerUnreachable { .. }
                | Self::ConnectionLost { .. }
                | Self::NotConnected(_)
        )
    }

    /// Returns whether this error represents a deliberate cancellation
    /// rather than a failure.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::CancelledByLocal { .. } | Self::CancelledByRemote { .. }
        )
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::BindFailed { .. } => Some(
                "Another program may be using the port.\n\
                 Stop it or choose different ports in the [network] config section.",
            ),
            Self::PeerUnreachable { .. } => Some(
                "Make sure the peer is running and on the same network.\n\
                 Firewalls must allow TCP ports 7878-7880 and UDP port 37821.",
            ),
            Self::NoNetwork => Some("Connect to a local network or set network.local_ip."),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}
