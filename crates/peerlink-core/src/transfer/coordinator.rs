//! Serial send queue.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};

use super::sender::{self, SendContext};
use super::{TransferOptions, TransferSession, TransferState};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::file::{OutgoingFile, Storage};
use crate::state::SharedState;

/// Ordered sessions for one batch of files.
///
/// At most one session is in progress at a time, and a session only starts
/// once every session before it has reached a terminal state.
#[derive(Debug, Clone, Default)]
pub struct TransferQueue {
    sessions: Vec<TransferSession>,
    active: Option<usize>,
}

impl TransferQueue {
    /// Queue `files` as pending sessions, numbered from 1.
    pub fn new(files: &[OutgoingFile]) -> Self {
        let total = u32::try_from(files.len()).unwrap_or(u32::MAX);
        let sessions = files
            .iter()
            .zip(1..)
            .map(|(file, index)| {
                TransferSession::new(file.display_name(), Some(file.size), index, total)
            })
            .collect();
        Self {
            sessions,
            active: None,
        }
    }

    /// Start the next pending session. Returns its position, or `None` when
    /// one is still running or nothing is left.
    pub fn start_next(&mut self) -> Option<usize> {
        if self.active.is_some() {
            return None;
        }
        let next = self
            .sessions
            .iter()
            .position(|s| s.state() == TransferState::Pending)?;
        if self.sessions[..next].iter().any(|s| !s.state().is_terminal()) {
            return None;
        }
        self.sessions[next].transition(TransferState::InProgress);
        self.active = Some(next);
        Some(next)
    }

    /// Finish the running session with `state` and `bytes` moved.
    pub fn finish(&mut self, state: TransferState, bytes: u64) {
        if let Some(index) = self.active.take() {
            let session = &mut self.sessions[index];
            session.record(bytes);
            session.transition(state);
        }
    }

    /// Whether a later session may still start.
    pub fn can_continue(&self) -> bool {
        !self
            .sessions
            .iter()
            .any(|s| matches!(s.state(), TransferState::Failed | TransferState::Cancelled))
    }

    /// All sessions in queue order.
    pub fn sessions(&self) -> &[TransferSession] {
        &self.sessions
    }

    /// Serializable view of the queue.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            items: self
                .sessions
                .iter()
                .map(|s| QueueItem {
                    file_name: s.file_name.clone(),
                    state: s.state(),
                    bytes_transferred: s.bytes_transferred,
                    total_bytes: s.total_bytes,
                })
                .collect(),
            active: self.active,
        }
    }

    fn into_sessions(self) -> Vec<TransferSession> {
        self.sessions
    }
}

/// One entry of a [`QueueSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    /// File name
    pub file_name: String,
    /// Current state
    pub state: TransferState,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// File size
    pub total_bytes: Option<u64>,
}

/// Point-in-time view of the send queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Every queued file in order
    pub items: Vec<QueueItem>,
    /// Position of the running file
    pub active: Option<usize>,
}

/// Sends batches of files to peers, one file at a time.
///
/// Only one batch runs at once; a second call waits for the first to finish.
pub struct TransferCoordinator {
    options: TransferOptions,
    state: Arc<SharedState>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    send_lock: Mutex<()>,
    queue_tx: watch::Sender<QueueSnapshot>,
}

impl std::fmt::Debug for TransferCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCoordinator")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TransferCoordinator {
    /// Create a coordinator.
    pub fn new(
        options: TransferOptions,
        state: Arc<SharedState>,
        storage: Arc<dyn Storage>,
        events: EventBus,
    ) -> Self {
        let (queue_tx, _) = watch::channel(QueueSnapshot::default());
        Self {
            options,
            state,
            storage,
            events,
            send_lock: Mutex::new(()),
            queue_tx,
        }
    }

    /// Port peers are dialed on.
    pub fn port(&self) -> u16 {
        self.options.port
    }

    /// Watch the queue as it moves.
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.queue_tx.subscribe()
    }

    /// Ask the running batch to stop.
    pub fn cancel(&self) {
        self.state.cancel_sending();
    }

    /// Send `files` to `peer` in order and return every session.
    ///
    /// Sending stops at the first cancelled or failed file and its error is
    /// returned; later files stay pending, as [`Self::subscribe`] shows.
    pub async fn send_files(
        &self,
        peer: SocketAddr,
        files: Vec<OutgoingFile>,
    ) -> Result<Vec<TransferSession>> {
        if files.is_empty() {
            return Err(Error::InvalidInput("no files to send".to_string()));
        }

        let _guard = self.send_lock.lock().await;
        self.state.reset_send_cancel();

        let mut queue = TransferQueue::new(&files);
        let total = u32::try_from(files.len()).unwrap_or(u32::MAX);
        let ctx = SendContext {
            state: &self.state,
            storage: self.storage.as_ref(),
            events: &self.events,
            options: &self.options,
        };

        tracing::info!("Sending {} file(s) to {}", files.len(), peer);
        self.publish(&queue);

        let mut failure = None;
        for (position, file) in files.iter().enumerate() {
            if self.state.send_cancelled() {
                tracing::info!("Send queue to {} cancelled", peer);
                failure = Some(Error::CancelledByLocal {
                    file: file.display_name().to_string(),
                });
                break;
            }
            let Some(started) = queue.start_next() else {
                break;
            };
            debug_assert_eq!(started, position);
            self.publish(&queue);

            let index = u32::try_from(position).unwrap_or(u32::MAX);
            match sender::send_file(peer, file, index, total, &ctx).await {
                Ok(sent) => queue.finish(TransferState::Completed, sent),
                Err(e) => {
                    let state = if e.is_cancellation() {
                        TransferState::Cancelled
                    } else {
                        tracing::warn!("Sending {} to {} failed: {}", file.display_name(), peer, e);
                        TransferState::Failed
                    };
                    queue.finish(state, 0);
                    self.publish(&queue);
                    failure = Some(e);
                    break;
                }
            }
            self.publish(&queue);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(queue.into_sessions()),
        }
    }

    fn publish(&self, queue: &TransferQueue) {
        self.queue_tx.send_replace(queue.snapshot());
    }
}
