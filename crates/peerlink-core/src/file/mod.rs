//! File handling for PeerLink.
//!
//! This module holds the storage collaborator used by the transfer protocol
//! and the path rules that keep a peer from writing outside the save
//! directory.

mod storage;

pub use storage::{FsStorage, OpenedStream, Storage, StorageHandle};

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// A file queued for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    /// Where the bytes come from, interpreted by the storage collaborator
    pub source: PathBuf,
    /// File name announced to the receiver
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Path inside a sent folder, e.g. `photos/2024/a.jpg`
    pub relative_path: Option<String>,
}

impl OutgoingFile {
    /// Describe a single file on disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| Error::InvalidPath(format!("{}: {e}", path.display())))?;
        if !metadata.is_file() {
            return Err(Error::InvalidPath(format!(
                "{} is not a file",
                path.display()
            )));
        }
        Ok(Self {
            source: path.to_path_buf(),
            name: file_name_of(path),
            size: metadata.len(),
            relative_path: None,
        })
    }

    /// Name the receiver stores this file under.
    pub fn display_name(&self) -> &str {
        self.relative_path.as_deref().unwrap_or(&self.name)
    }
}

/// Expand files and folders into a send list.
///
/// Files are sent as-is. Each folder becomes its files in path order, each
/// carrying a relative path rooted at the folder's own name so the receiver
/// can rebuild the tree.
pub fn collect_outgoing(paths: &[PathBuf]) -> Result<Vec<OutgoingFile>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_file() {
            files.push(OutgoingFile::from_path(path)?);
        } else if path.is_dir() {
            collect_folder(path, &mut files)?;
        } else {
            return Err(Error::InvalidPath(format!(
                "{} does not exist",
                path.display()
            )));
        }
    }

    Ok(files)
}

fn collect_folder(root: &Path, files: &mut Vec<OutgoingFile>) -> Result<()> {
    let root_name = file_name_of(root);
    let walker = walkdir::WalkDir::new(root).sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| Error::InvalidPath(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(inner) = entry.path().strip_prefix(root) else {
            continue;
        };
        let mut relative = root_name.clone();
        for component in inner.components() {
            relative.push('/');
            relative.push_str(&component.as_os_str().to_string_lossy());
        }

        let metadata = entry
            .metadata()
            .map_err(|e| Error::InvalidPath(e.to_string()))?;
        files.push(OutgoingFile {
            source: entry.path().to_path_buf(),
            name: file_name_of(entry.path()),
            size: metadata.len(),
            relative_path: Some(relative),
        });
    }

    Ok(())
}

fn file_name_of(path: &Path) -> String {
    path.file_name().map_or_else(
        || "unnamed".to_string(),
        |n| n.to_string_lossy().to_string(),
    )
}

/// Turn a peer-supplied relative path into a safe one.
///
/// Both `/` and `\` separate components. Empty and `.` components are
/// dropped; `..` or a NUL byte anywhere rejects the path.
pub fn sanitize_relative_path(raw: &str) -> Option<PathBuf> {
    if raw.contains('\0') {
        return None;
    }

    let mut path = PathBuf::new();
    for part in raw.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => return None,
            part => path.push(part),
        }
    }

    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Reduce a peer-supplied name to a single safe file name.
pub fn sanitize_file_name(raw: &str) -> String {
    sanitize_relative_path(raw)
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Join `relative` onto `base`, refusing anything that escapes `base`.
pub fn sanitize_path(base: &Path, relative: &Path) -> Option<PathBuf> {
    for component in relative.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            return None;
        }
    }

    let full_path = base.join(relative);

    if full_path.starts_with(base) {
        Some(full_path)
    } else {
        None
    }
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
