//! Clipboard access.
//!
//! The sync manager only ever sees [`ClipboardAccess`]. [`NativeClipboard`]
//! talks to the desktop clipboard through `arboard`; [`MemoryClipboard`]
//! serves headless nodes and tests.

use std::sync::{Arc, Mutex, PoisonError};

use arboard::Clipboard;

use crate::error::{Error, Result};

/// Read and write the text clipboard.
pub trait ClipboardAccess: Send {
    /// Current text, or `None` when the clipboard holds no text.
    ///
    /// # Errors
    ///
    /// Returns an error if the clipboard cannot be read.
    fn read_text(&mut self) -> Result<Option<String>>;

    /// Replace the clipboard with `text`.
    ///
    /// # Errors
    ///
    /// Returns an error if the clipboard cannot be written.
    fn write_text(&mut self, text: &str) -> Result<()>;
}

/// Desktop clipboard.
pub struct NativeClipboard {
    clipboard: Clipboard,
}

impl NativeClipboard {
    /// Open the system clipboard.
    ///
    /// # Errors
    ///
    /// Returns an error if no clipboard is available, e.g. without a display.
    pub fn new() -> Result<Self> {
        let clipboard = Clipboard::new()
            .map_err(|e| Error::ClipboardError(format!("failed to access clipboard: {e}")))?;
        Ok(Self { clipboard })
    }
}

impl ClipboardAccess for NativeClipboard {
    fn read_text(&mut self) -> Result<Option<String>> {
        match self.clipboard.get_text() {
            Ok(text) if !text.is_empty() => Ok(Some(text)),
            Ok(_) | Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(Error::ClipboardError(format!("failed to read text: {e}"))),
        }
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        self.clipboard
            .set_text(text.to_string())
            .map_err(|e| Error::ClipboardError(format!("failed to set text: {e}")))
    }
}

/// In-process clipboard.
///
/// Clones share the same content, so a test can keep one handle while the
/// sync manager owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryClipboard {
    content: Arc<Mutex<Option<String>>>,
}

impl MemoryClipboard {
    /// Empty clipboard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the content, as a local copy would.
    pub fn set(&self, text: impl Into<String>) {
        *self.content.lock().unwrap_or_else(PoisonError::into_inner) = Some(text.into());
    }

    /// Current content.
    pub fn get(&self) -> Option<String> {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ClipboardAccess for MemoryClipboard {
    fn read_text(&mut self) -> Result<Option<String>> {
        Ok(self.get().filter(|text| !text.is_empty()))
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        self.set(text);
        Ok(())
    }
}

/// Open the system clipboard, or an in-memory one when there is none.
pub fn create_clipboard() -> Box<dyn ClipboardAccess> {
    match NativeClipboard::new() {
        Ok(native) => Box::new(native),
        Err(e) => {
            tracing::warn!("{}; clipboard sync will use an in-memory clipboard", e);
            Box::new(MemoryClipboard::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_clipboard_shares_content() {
        let handle = MemoryClipboard::new();
        let mut access: Box<dyn ClipboardAccess> = Box::new(handle.clone());
        assert_eq!(access.read_text().unwrap(), None);

        handle.set("copied");
        assert_eq!(access.read_text().unwrap().as_deref(), Some("copied"));

        access.write_text("pasted").unwrap();
        assert_eq!(handle.get().as_deref(), Some("pasted"));
    }

    #[test]
    fn test_empty_text_reads_as_none() {
        let mut clipboard = MemoryClipboard::new();
        clipboard.set("");
        assert_eq!(clipboard.read_text().unwrap(), None);
    }
}
