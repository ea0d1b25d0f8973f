//! Storage collaborator.
//!
//! The transfer engine reads and writes files only through [`Storage`], by
//! logical handle. [`FsStorage`] is the direct filesystem implementation;
//! platforms with scoped storage provide their own.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::sanitize_path;
use crate::error::{Error, Result};

/// Logical handle to an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageHandle(pub u64);

/// A freshly opened write stream.
#[derive(Debug, Clone)]
pub struct OpenedStream {
    /// Handle for subsequent calls
    pub handle: StorageHandle,
    /// Where the data ends up
    pub location: PathBuf,
}

/// Byte-stream access to files regardless of how they are stored.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create (or truncate) `name` inside `dir`. `name` may contain
    /// sub-directories, which are created as needed.
    async fn open_write_stream(&self, dir: &Path, name: &Path) -> Result<OpenedStream>;

    /// Append bytes to a write stream.
    async fn write(&self, handle: StorageHandle, data: &[u8]) -> Result<()>;

    /// Flush and release a stream.
    async fn close(&self, handle: StorageHandle) -> Result<()>;

    /// Release a write stream and remove what was written.
    async fn delete(&self, handle: StorageHandle) -> Result<()>;

    /// Open a source for reading.
    async fn open_read_stream(&self, source: &Path) -> Result<StorageHandle>;

    /// Read up to `size` bytes at `offset`. An empty result means end of file.
    async fn read_chunk(&self, handle: StorageHandle, offset: u64, size: usize)
        -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

/// An open file. The map lock only guards lookups; I/O on the file goes
/// through its own lock, so a slow disk stalls only its own stream.
struct OpenFile {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    mode: Mode,
}

/// [`Storage`] backed directly by the filesystem.
#[derive(Default)]
pub struct FsStorage {
    handles: Mutex<HashMap<StorageHandle, OpenFile>>,
    next_handle: AtomicU64,
}

impl FsStorage {
    /// Create a storage with no open streams.
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> StorageHandle {
        StorageHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Number of streams currently open.
    pub async fn open_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    async fn register(&self, file: File, path: PathBuf, mode: Mode) -> StorageHandle {
        let handle = self.allocate();
        self.handles.lock().await.insert(
            handle,
            OpenFile {
                file: Arc::new(Mutex::new(file)),
                path,
                mode,
            },
        );
        handle
    }

    /// The file behind `handle`, if it is open in `mode`.
    async fn lookup(
        &self,
        handle: StorageHandle,
        mode: Mode,
    ) -> Result<(Arc<Mutex<File>>, PathBuf)> {
        let handles = self.handles.lock().await;
        match handles.get(&handle) {
            Some(open) if open.mode == mode => {
                Ok((Arc::clone(&open.file), open.path.clone()))
            }
            _ => Err(Error::InvalidHandle(handle.0)),
        }
    }

    async fn take(&self, handle: StorageHandle) -> Result<OpenFile> {
        self.handles
            .lock()
            .await
            .remove(&handle)
            .ok_or(Error::InvalidHandle(handle.0))
    }
}

fn storage_err(path: &Path, e: &std::io::Error) -> Error {
    Error::StorageError {
        file: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn open_write_stream(&self, dir: &Path, name: &Path) -> Result<OpenedStream> {
        let path = sanitize_path(dir, name)
            .ok_or_else(|| Error::InvalidPath(name.display().to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err(parent, &e))?;
        }
        let file = File::create(&path)
            .await
            .map_err(|e| storage_err(&path, &e))?;

        let handle = self.register(file, path.clone(), Mode::Write).await;
        Ok(OpenedStream {
            handle,
            location: path,
        })
    }

    async fn write(&self, handle: StorageHandle, data: &[u8]) -> Result<()> {
        let (file, path) = self.lookup(handle, Mode::Write).await?;
        let mut file = file.lock().await;
        file.write_all(data)
            .await
            .map_err(|e| storage_err(&path, &e))
    }

    async fn close(&self, handle: StorageHandle) -> Result<()> {
        let open = self.take(handle).await?;
        if open.mode == Mode::Write {
            let mut file = open.file.lock().await;
            file.flush().await.map_err(|e| storage_err(&open.path, &e))?;
        }
        Ok(())
    }

    async fn delete(&self, handle: StorageHandle) -> Result<()> {
        let OpenFile { file, path, .. } = self.take(handle).await?;
        // Waits out a write still in flight before the file goes.
        drop(file.lock().await);
        drop(file);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(&path, &e)),
        }
    }

    async fn open_read_stream(&self, source: &Path) -> Result<StorageHandle> {
        let file = File::open(source)
            .await
            .map_err(|e| storage_err(source, &e))?;
        Ok(self.register(file, source.to_path_buf(), Mode::Read).await)
    }

    async fn read_chunk(
        &self,
        handle: StorageHandle,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>> {
        let (file, path) = self.lookup(handle, Mode::Read).await?;
        let mut file = file.lock().await;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| storage_err(&path, &e))?;

        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| storage_err(&path, &e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new();

        let opened = storage
            .open_write_stream(dir.path(), Path::new("nested/out.bin"))
            .await
            .unwrap();
        storage.write(opened.handle, b"hello ").await.unwrap();
        storage.write(opened.handle, b"world").await.unwrap();
        storage.close(opened.handle).await.unwrap();

        assert_eq!(opened.location, dir.path().join("nested").join("out.bin"));
        assert_eq!(std::fs::read(&opened.location).unwrap(), b"hello world");

        let reader = storage.open_read_stream(&opened.location).await.unwrap();
        assert_eq!(storage.read_chunk(reader, 6, 100).await.unwrap(), b"world");
        assert!(storage.read_chunk(reader, 11, 100).await.unwrap().is_empty());
        storage.close(reader).await.unwrap();
        assert_eq!(storage.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_partial_output() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new();

        let opened = storage
            .open_write_stream(dir.path(), Path::new("partial.bin"))
            .await
            .unwrap();
        storage.write(opened.handle, &[1, 2, 3]).await.unwrap();
        storage.delete(opened.handle).await.unwrap();

        assert!(!opened.location.exists());
        assert!(matches!(
            storage.write(opened.handle, &[4]).await,
            Err(Error::InvalidHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_handles_are_unique() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new();

        let a = storage
            .open_write_stream(dir.path(), Path::new("a"))
            .await
            .unwrap();
        let b = storage
            .open_write_stream(dir.path(), Path::new("b"))
            .await
            .unwrap();
        assert_ne!(a.handle, b.handle);
    }

    #[tokio::test]
    async fn test_busy_stream_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new();

        let busy = storage
            .open_write_stream(dir.path(), Path::new("busy.bin"))
            .await
            .unwrap();
        let other = storage
            .open_write_stream(dir.path(), Path::new("other.bin"))
            .await
            .unwrap();

        // Stands in for a write stuck on a slow disk.
        let (file, _) = storage.lookup(busy.handle, Mode::Write).await.unwrap();
        let stuck = file.lock().await;

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            storage.write(other.handle, b"independent"),
        )
        .await
        .expect("write on another stream must not wait")
        .unwrap();
        storage.close(other.handle).await.unwrap();
        assert_eq!(std::fs::read(&other.location).unwrap(), b"independent");

        drop(stuck);
        storage.write(busy.handle, b"late").await.unwrap();
        storage.close(busy.handle).await.unwrap();
        assert_eq!(std::fs::read(&busy.location).unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_mode_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new();
        let opened = storage
            .open_write_stream(dir.path(), Path::new("w.bin"))
            .await
            .unwrap();
        assert!(matches!(
            storage.read_chunk(opened.handle, 0, 8).await,
            Err(Error::InvalidHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_escaping_name_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::new();
        let result = storage
            .open_write_stream(dir.path(), Path::new("../escape"))
            .await;
        assert!(matches!(result, Err(Error::InvalidPath(_))));
    }
}
