//! Transfer wire format.
//!
//! One connection carries one file:
//!
//! 1. A text frame with [`FileMeta`] as JSON
//! 2. The file body as binary frames, in order
//! 3. A normal close from the sender
//!
//! A receiver that wants to stop closes with [`crate::CANCEL_CLOSE_CODE`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::file::{sanitize_file_name, sanitize_relative_path};

/// Metadata sent ahead of a file body.
///
/// Only `name` is required; older senders send nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// File name
    pub name: String,
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Position in the sender's queue (0-based)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Length of the sender's queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    /// Path inside a sent folder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
}

impl FileMeta {
    /// Parse the metadata frame.
    pub fn parse(text: &str) -> Result<Self> {
        let meta: Self = serde_json::from_str(text)
            .map_err(|e| Error::ProtocolError(format!("bad file metadata: {e}")))?;
        if meta.name.trim().is_empty() {
            return Err(Error::ProtocolError("file metadata without a name".to_string()));
        }
        Ok(meta)
    }

    /// JSON form of this metadata.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 1-based position for display; a missing index means the first file.
    pub fn position(&self) -> u32 {
        self.index.unwrap_or(0).saturating_add(1)
    }

    /// Where inside the save directory the file goes.
    ///
    /// A usable relative path wins; otherwise the bare file name.
    pub fn storage_name(&self) -> PathBuf {
        self.relative_path
            .as_deref()
            .and_then(sanitize_relative_path)
            .unwrap_or_else(|| PathBuf::from(sanitize_file_name(&self.name)))
    }

    /// Name shown in notifications.
    pub fn display_name(&self) -> String {
        self.relative_path
            .as_deref()
            .filter(|p| sanitize_relative_path(p).is_some())
            .map_or_else(|| self.name.clone(), str::to_string)
    }
}

/// Decides when a progress report is due.
///
/// Reports come every `min(max_interval, 10% of total)` bytes, at least one
/// byte apart, and always on the final byte. Without a known total there is
/// nothing to report against.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    total: Option<u64>,
    interval: u64,
    next_at: u64,
    finished: bool,
}

impl ProgressThrottle {
    /// Create a throttle for a file of `total` bytes.
    pub fn new(total: Option<u64>, max_interval: u64) -> Self {
        let interval = total.map_or(max_interval, |t| max_interval.min(t / 10)).max(1);
        Self {
            total,
            interval,
            next_at: interval,
            finished: false,
        }
    }

    /// Bytes between two reports.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Record the running byte count; returns whether to report now.
    pub fn update(&mut self, transferred: u64) -> bool {
        let Some(total) = self.total else {
            return false;
        };
        if self.finished {
            return false;
        }
        if transferred >= total {
            self.finished = true;
            return true;
        }
        if transferred >= self.next_at {
            self.next_at = transferred + self.interval;
            return true;
        }
        false
    }
}

/// Percentage of `total` covered by `transferred`, clamped to 100.
pub fn percentage(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    ((transferred as f64 / total as f64) * 100.0).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_metadata() {
        let meta = FileMeta::parse(
            r#"{"name":"a.jpg","size":2048,"index":2,"total":5,"relative_path":"album/a.jpg"}"#,
        )
        .unwrap();
        assert_eq!(meta.size, Some(2048));
        assert_eq!(meta.index, Some(2));
        assert_eq!(meta.position(), 3);
        assert_eq!(meta.total, Some(5));
        assert_eq!(meta.storage_name(), PathBuf::from("album").join("a.jpg"));
        assert_eq!(meta.display_name(), "album/a.jpg");
    }

    #[test]
    fn test_parse_legacy_metadata() {
        let meta = FileMeta::parse(r#"{"name":"notes.txt"}"#).unwrap();
        assert_eq!(meta.size, None);
        assert_eq!(meta.index, None);
        assert_eq!(meta.position(), 1);
        assert_eq!(meta.storage_name(), PathBuf::from("notes.txt"));

        let explicit = FileMeta::parse(r#"{"name":"notes.txt","size":0,"index":0,"total":1}"#).unwrap();
        assert_eq!(explicit.position(), meta.position());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            FileMeta::parse("not json"),
            Err(Error::ProtocolError(_))
        ));
        assert!(FileMeta::parse(r#"{"size":3}"#).is_err());
        assert!(FileMeta::parse(r#"{"name":"  "}"#).is_err());
    }

    #[test]
    fn test_traversal_falls_back_to_name() {
        let meta = FileMeta {
            name: "../../evil.sh".to_string(),
            size: Some(1),
            index: None,
            total: None,
            relative_path: Some("../outside/evil.sh".to_string()),
        };
        assert_eq!(meta.storage_name(), PathBuf::from("unnamed"));
        assert_eq!(meta.display_name(), "../../evil.sh");
    }

    #[test]
    fn test_encode_omits_missing_fields() {
        let meta = FileMeta {
            name: "a.bin".to_string(),
            size: Some(10),
            index: None,
            total: None,
            relative_path: None,
        };
        assert_eq!(meta.encode().unwrap(), r#"{"name":"a.bin","size":10}"#);
    }

    #[test]
    fn test_throttle_interval() {
        assert_eq!(ProgressThrottle::new(Some(10 * 1024 * 1024), 100 * 1024).interval(), 100 * 1024);
        assert_eq!(ProgressThrottle::new(Some(50_000), 100 * 1024).interval(), 5_000);
        assert_eq!(ProgressThrottle::new(Some(5), 100 * 1024).interval(), 1);
    }

    #[test]
    fn test_throttle_reports_final_byte_once() {
        let mut throttle = ProgressThrottle::new(Some(1000), 100 * 1024);
        assert!(!throttle.update(50));
        assert!(throttle.update(100));
        assert!(!throttle.update(150));
        assert!(throttle.update(230));
        assert!(throttle.update(1000));
        assert!(!throttle.update(1000));
    }

    #[test]
    fn test_throttle_silent_without_total() {
        let mut throttle = ProgressThrottle::new(None, 100);
        assert!(!throttle.update(1_000_000));
    }

    #[test]
    fn test_percentage() {
        assert!((percentage(50, 200) - 25.0).abs() < f64::EPSILON);
        assert!((percentage(300, 200) - 100.0).abs() < f64::EPSILON);
        assert!((percentage(0, 0) - 100.0).abs() < f64::EPSILON);
    }
}
