//! Process-wide shared state.
//!
//! One [`SharedState`] is created per node and handed to every subsystem that
//! needs it. Flags are atomics; the save directory sits behind a lock so it can
//! be swapped while the transfer listener keeps running.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

/// Shared flags and settings that outlive any single connection.
#[derive(Debug)]
pub struct SharedState {
    save_dir: RwLock<PathBuf>,
    cancel_sending: AtomicBool,
    cancel_receiving: AtomicBool,
    last_clipboard_hash: AtomicU64,
}

impl SharedState {
    /// Create state rooted at the given save directory.
    pub fn new(save_dir: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self {
            save_dir: RwLock::new(save_dir.as_ref().to_path_buf()),
            cancel_sending: AtomicBool::new(false),
            cancel_receiving: AtomicBool::new(false),
            last_clipboard_hash: AtomicU64::new(0),
        })
    }

    /// Current save directory.
    pub async fn save_dir(&self) -> PathBuf {
        self.save_dir.read().await.clone()
    }

    /// Change where subsequent incoming files are written.
    ///
    /// Transfers already in progress keep their original destination.
    pub async fn set_save_dir(&self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref().to_path_buf();
        tracing::info!("Save directory set to {}", dir.display());
        *self.save_dir.write().await = dir;
    }

    /// Ask the active send queue to stop.
    pub fn cancel_sending(&self) {
        self.cancel_sending.store(true, Ordering::SeqCst);
    }

    /// Ask the active incoming transfer to stop.
    pub fn cancel_receiving(&self) {
        self.cancel_receiving.store(true, Ordering::SeqCst);
    }

    pub(crate) fn send_cancelled(&self) -> bool {
        self.cancel_sending.load(Ordering::SeqCst)
    }

    pub(crate) fn receive_cancelled(&self) -> bool {
        self.cancel_receiving.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_send_cancel(&self) {
        self.cancel_sending.store(false, Ordering::SeqCst);
    }

    pub(crate) fn reset_receive_cancel(&self) {
        self.cancel_receiving.store(false, Ordering::SeqCst);
    }

    /// Digest of the clipboard content most recently sent or applied.
    pub fn last_clipboard_hash(&self) -> u64 {
        self.last_clipboard_hash.load(Ordering::SeqCst)
    }

    pub(crate) fn set_last_clipboard_hash(&self, hash: u64) {
        self.last_clipboard_hash.store(hash, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_dir_hot_swap() {
        let state = SharedState::new("/tmp/a");
        assert_eq!(state.save_dir().await, PathBuf::from("/tmp/a"));

        state.set_save_dir("/tmp/b").await;
        assert_eq!(state.save_dir().await, PathBuf::from("/tmp/b"));
    }

    #[test]
    fn test_cancel_flags_are_independent() {
        let state = SharedState::new(".");
        state.cancel_sending();
        assert!(state.send_cancelled());
        assert!(!state.receive_cancelled());

        state.reset_send_cancel();
        assert!(!state.send_cancelled());

        state.cancel_receiving();
        assert!(state.receive_cancelled());
        state.reset_receive_cancel();
        assert!(!state.receive_cancelled());
    }
}
