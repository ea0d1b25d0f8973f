//! Common test utilities for PeerLink integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink_core::events::{Event, EventBus};
use peerlink_core::file::{FsStorage, OpenedStream, Storage, StorageHandle};
use peerlink_core::state::SharedState;
use peerlink_core::transfer::{TransferCoordinator, TransferOptions, TransferServer};
use peerlink_core::Result;
use tokio::sync::broadcast;

/// Base port for tests, incremented for each test to avoid conflicts.
static TEST_PORT_COUNTER: AtomicU16 = AtomicU16::new(52600);

/// How long a test waits for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Get `count` consecutive ports unique to this test.
pub fn get_test_ports(count: u16) -> Vec<u16> {
    let base = TEST_PORT_COUNTER.fetch_add(count, Ordering::SeqCst);
    (base..base + count).collect()
}

/// The address every test node runs on.
pub fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Wait for the first event matching `pred`, skipping everything else.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect events until `pred` matches, returning everything seen.
pub async fn collect_until<F>(rx: &mut broadcast::Receiver<Event>, mut pred: F) -> Vec<Event>
where
    F: FnMut(&Event) -> bool,
{
    let mut seen = Vec::new();
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            if let Ok(event) = rx.recv().await {
                let done = pred(&event);
                seen.push(event);
                if done {
                    return;
                }
            }
        }
    })
    .await
    .expect("timed out collecting events");
    seen
}

/// Poll `check` until it returns true.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Storage that pauses before every write, so a receiver falls behind.
pub struct SlowStorage {
    inner: FsStorage,
    delay: Duration,
}

impl SlowStorage {
    /// Filesystem storage delaying each write by `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: FsStorage::new(),
            delay,
        }
    }
}

#[async_trait]
impl Storage for SlowStorage {
    async fn open_write_stream(&self, dir: &Path, name: &Path) -> Result<OpenedStream> {
        self.inner.open_write_stream(dir, name).await
    }

    async fn write(&self, handle: StorageHandle, data: &[u8]) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.write(handle, data).await
    }

    async fn close(&self, handle: StorageHandle) -> Result<()> {
        self.inner.close(handle).await
    }

    async fn delete(&self, handle: StorageHandle) -> Result<()> {
        self.inner.delete(handle).await
    }

    async fn open_read_stream(&self, source: &Path) -> Result<StorageHandle> {
        self.inner.open_read_stream(source).await
    }

    async fn read_chunk(&self, handle: StorageHandle, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.inner.read_chunk(handle, offset, size).await
    }
}

/// Sender storage that pulls the cancel switch as soon as the read starting
/// at `cancel_at` returns.
pub struct CancellingStorage {
    inner: FsStorage,
    state: Arc<SharedState>,
    cancel_at: u64,
}

impl CancellingStorage {
    /// Cancel sends on `state` once the chunk at `cancel_at` is read.
    pub fn new(state: Arc<SharedState>, cancel_at: u64) -> Self {
        Self {
            inner: FsStorage::new(),
            state,
            cancel_at,
        }
    }
}

#[async_trait]
impl Storage for CancellingStorage {
    async fn open_write_stream(&self, dir: &Path, name: &Path) -> Result<OpenedStream> {
        self.inner.open_write_stream(dir, name).await
    }

    async fn write(&self, handle: StorageHandle, data: &[u8]) -> Result<()> {
        self.inner.write(handle, data).await
    }

    async fn close(&self, handle: StorageHandle) -> Result<()> {
        self.inner.close(handle).await
    }

    async fn delete(&self, handle: StorageHandle) -> Result<()> {
        self.inner.delete(handle).await
    }

    async fn open_read_stream(&self, source: &Path) -> Result<StorageHandle> {
        self.inner.open_read_stream(source).await
    }

    async fn read_chunk(&self, handle: StorageHandle, offset: u64, size: usize) -> Result<Vec<u8>> {
        let chunk = self.inner.read_chunk(handle, offset, size).await?;
        if offset == self.cancel_at {
            self.state.cancel_sending();
        }
        Ok(chunk)
    }
}

/// A receiving side listening on loopback.
pub struct Receiver {
    pub server: TransferServer,
    pub state: Arc<SharedState>,
    pub events: EventBus,
    pub save_dir: tempfile::TempDir,
}

impl Receiver {
    /// Address senders dial.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(loopback(), self.server.local_addr().port())
    }
}

/// Start a transfer server on an ephemeral port.
pub async fn start_receiver(storage: Arc<dyn Storage>) -> Receiver {
    let save_dir = create_temp_dir();
    let state = SharedState::new(save_dir.path());
    let events = EventBus::default();
    let server = TransferServer::start(
        SocketAddr::new(loopback(), 0),
        TransferOptions::default(),
        Arc::clone(&state),
        storage,
        events.clone(),
        loopback(),
    )
    .await
    .expect("Failed to start transfer server");
    Receiver {
        server,
        state,
        events,
        save_dir,
    }
}

/// A sending side.
pub struct Sender {
    pub coordinator: Arc<TransferCoordinator>,
    pub state: Arc<SharedState>,
    pub events: EventBus,
}

/// Create a coordinator sending through plain filesystem storage.
pub fn new_sender() -> Sender {
    new_sender_with(TransferOptions::default(), |_| Arc::new(FsStorage::new()))
}

/// Create a coordinator with custom options and a storage built around its
/// shared state.
pub fn new_sender_with<F>(options: TransferOptions, storage: F) -> Sender
where
    F: FnOnce(Arc<SharedState>) -> Arc<dyn Storage>,
{
    let state = SharedState::new(std::env::temp_dir());
    let events = EventBus::default();
    let coordinator = Arc::new(TransferCoordinator::new(
        options,
        Arc::clone(&state),
        storage(Arc::clone(&state)),
        events.clone(),
    ));
    Sender {
        coordinator,
        state,
        events,
    }
}
