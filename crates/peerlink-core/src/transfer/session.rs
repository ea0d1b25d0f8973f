//! One file's lifecycle in one direction.

use serde::Serialize;

/// State of a transfer.
///
/// `Pending → InProgress → {Completed, Failed, Cancelled}`. Terminal states
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Queued, not started
    Pending,
    /// Bytes are moving
    InProgress,
    /// Every byte arrived
    Completed,
    /// Connection or storage failure
    Failed,
    /// Stopped by either side
    Cancelled,
}

impl TransferState {
    /// Whether no further transition is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress | Self::Cancelled)
                | (
                    Self::InProgress,
                    Self::Completed | Self::Failed | Self::Cancelled
                )
        )
    }
}

/// A single file moving across a connection.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSession {
    /// File name (or relative path for folder items)
    pub file_name: String,
    /// Size in bytes, when known
    pub total_bytes: Option<u64>,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// Position in the queue (1-based)
    pub sequence_index: u32,
    /// Length of the queue
    pub sequence_total: u32,
    state: TransferState,
}

impl TransferSession {
    /// Create a pending session.
    pub fn new(
        file_name: impl Into<String>,
        total_bytes: Option<u64>,
        sequence_index: u32,
        sequence_total: u32,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            total_bytes,
            bytes_transferred: 0,
            sequence_index,
            sequence_total,
            state: TransferState::Pending,
        }
    }

    /// Current state.
    pub const fn state(&self) -> TransferState {
        self.state
    }

    /// Move to `next`. Returns `false` and leaves the state alone when the
    /// transition is not allowed.
    pub fn transition(&mut self, next: TransferState) -> bool {
        if self.state.can_become(next) {
            self.state = next;
            true
        } else {
            tracing::debug!(
                "Ignoring transition {:?} -> {:?} for {}",
                self.state,
                next,
                self.file_name
            );
            false
        }
    }

    /// Count bytes moved.
    pub fn record(&mut self, bytes: u64) {
        if self.state == TransferState::InProgress {
            self.bytes_transferred += bytes;
        }
    }

    /// Whether every declared byte has moved. Unknown sizes never count
    /// as complete on their own.
    pub fn is_complete(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| self.bytes_transferred >= total)
    }
}
