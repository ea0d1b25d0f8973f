//! File transfer engine for PeerLink.
//!
//! This module moves files between nodes:
//!
//! - [`TransferServer`] accepts connections and writes incoming files
//! - [`TransferCoordinator`] sends a queue of files, strictly one at a time
//!
//! ## Transfer Protocol
//!
//! - Transport: WebSocket over TCP, port 7878
//! - One connection per file: metadata text frame, binary body, normal close
//! - Chunk size: 256 KB
//! - Progress: every 100 KB or 10% of the file, whichever is smaller
//! - Receiver cancellation: close code 4001
//!
//! Cancellation is cooperative on both sides. The sender checks its flag
//! before each file, in every chunk and while waiting for the transport to
//! drain; the receiver checks its flag for every binary frame.

pub mod protocol;

mod coordinator;
mod receiver;
mod sender;
mod session;

pub use coordinator::{QueueItem, QueueSnapshot, TransferCoordinator, TransferQueue};
pub use protocol::{FileMeta, ProgressThrottle};
pub use receiver::TransferServer;
pub use session::{TransferSession, TransferState};

use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;

/// Which way bytes are moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// This node is sending
    Send,
    /// This node is receiving
    Receive,
}

/// Progress report for one file.
#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    /// Direction of the transfer
    pub direction: TransferDirection,
    /// The other node
    pub peer: IpAddr,
    /// File name
    pub file_name: String,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// File size
    pub total_bytes: u64,
    /// `bytes_transferred` as a percentage of `total_bytes`
    pub percentage: f64,
}

impl TransferProgress {
    pub(crate) fn new(
        direction: TransferDirection,
        peer: IpAddr,
        file_name: &str,
        bytes_transferred: u64,
        total_bytes: u64,
    ) -> Self {
        Self {
            direction,
            peer,
            file_name: file_name.to_string(),
            bytes_transferred,
            total_bytes,
            percentage: protocol::percentage(bytes_transferred, total_bytes),
        }
    }
}

/// Tunables for both sides of a transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Port peers listen on
    pub port: u16,
    /// Bytes per binary frame
    pub chunk_size: usize,
    /// Buffered bytes above which the sender pauses
    pub high_water_mark: u64,
    /// How often a paused sender re-checks the buffer
    pub drain_poll_interval: Duration,
    /// Upper bound on bytes between progress reports
    pub progress_interval: u64,
    /// How long to wait for the peer's close frame
    pub close_grace: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl TransferOptions {
    /// Options from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            port: config.network.transfer_port,
            chunk_size: config.transfer.chunk_size,
            high_water_mark: config.transfer.high_water_mark,
            drain_poll_interval: config.transfer.drain_poll_interval,
            progress_interval: config.transfer.progress_interval,
            close_grace: config.transfer.close_grace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = TransferOptions::default();
        assert_eq!(options.port, 7878);
        assert_eq!(options.chunk_size, 256 * 1024);
        assert_eq!(options.progress_interval, 100 * 1024);
        assert!(options.high_water_mark >= options.chunk_size as u64);
    }

    #[test]
    fn test_progress_percentage() {
        let progress = TransferProgress::new(
            TransferDirection::Receive,
            "10.0.0.2".parse().unwrap(),
            "a.bin",
            512,
            2048,
        );
        assert!((progress.percentage - 25.0).abs() < f64::EPSILON);
    }
}
