//! UI utilities for PeerLink CLI.

use std::time::Duration;

use chrono::{Local, TimeZone};
use peerlink_core::events::Event;
use peerlink_core::file::format_size;
use peerlink_core::transfer::{TransferDirection, TransferProgress};

const BAR_WIDTH: usize = 24;

/// Parse a duration string like "5m", "30s", or "1h".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(num_str) = s.strip_suffix('m') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num * 60))
    } else if let Some(num_str) = s.strip_suffix('s') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num))
    } else if let Some(num_str) = s.strip_suffix('h') {
        let num: u64 = num_str.parse().ok()?;
        Some(Duration::from_secs(num * 3600))
    } else {
        None
    }
}

/// Truncate a string to fit within a maximum width.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len - 1).collect();
        format!("{}…", truncated)
    }
}

/// Render a Unix-millisecond timestamp as local wall-clock time.
pub fn format_timestamp(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
        .map_or_else(|| "--:--:--".to_string(), |t| t.format("%H:%M:%S").to_string())
}

/// One-line progress bar for a transfer.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn progress_line(progress: &TransferProgress) -> String {
    let filled = ((progress.percentage / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);
    let arrow = match progress.direction {
        TransferDirection::Send => "→",
        TransferDirection::Receive => "←",
    };
    format!(
        "  {} {:24} [{}{}] {:5.1}%  {} / {}",
        arrow,
        truncate_string(&progress.file_name, 24),
        "█".repeat(filled),
        "░".repeat(BAR_WIDTH - filled),
        progress.percentage,
        format_size(progress.bytes_transferred),
        format_size(progress.total_bytes)
    )
}

/// Human-readable rendering of an engine event.
pub fn describe_event(event: &Event) -> String {
    match event {
        Event::DevicesChanged { devices } => {
            let names: Vec<String> = devices
                .iter()
                .map(|d| format!("{} ({})", d.hostname, d.ip))
                .collect();
            if names.is_empty() {
                "  No devices on the network".to_string()
            } else {
                format!("  Devices: {}", names.join(", "))
            }
        }
        Event::DiscoveryError { message } => format!("  Discovery error: {}", message),
        Event::FileReceivingStarted {
            name,
            size,
            index,
            total,
            from,
        } => {
            let position = match (index, total) {
                (Some(index), Some(total)) => {
                    format!("[{}/{}] ", index.saturating_add(1), total)
                }
                _ => String::new(),
            };
            match size {
                Some(size) => format!(
                    "  {}Receiving {} ({}) from {}",
                    position,
                    name,
                    format_size(*size),
                    from
                ),
                None => format!("  {}Receiving {} from {}", position, name, from),
            }
        }
        Event::FileReceived { name, size, path } => format!(
            "  Received {} ({}) -> {}",
            name,
            format_size(*size),
            path.display()
        ),
        Event::FileReceiveCancelled {
            name,
            bytes_received,
            ..
        } => format!(
            "  Transfer of {} cancelled after {}",
            name,
            format_size(*bytes_received)
        ),
        Event::FileReceiveFailed { name, reason } => {
            format!("  Could not receive {}: {}", name, reason)
        }
        Event::FileSending {
            name,
            size,
            index,
            total,
            to,
        } => format!(
            "  [{}/{}] Sending {} ({}) to {}",
            index.saturating_add(1),
            total,
            name,
            format_size(*size),
            to
        ),
        Event::FileSent { name, size, to } => {
            format!("  Sent {} ({}) to {}", name, format_size(*size), to)
        }
        Event::TransferProgress(progress) => progress_line(progress),
        Event::TransferServerError { message } => format!("  Transfer server error: {}", message),
        Event::ChatConnected { peer } => format!("  Chat connected: {}", peer),
        Event::ChatDisconnected { peer } => format!("  Chat disconnected: {}", peer),
        Event::ChatMessageReceived(message) => format!(
            "  [{}] {}: {}",
            format_timestamp(message.timestamp),
            message.from_ip,
            message.content
        ),
        Event::ChatServerError { message } => format!("  Chat server error: {}", message),
        Event::ClipboardConnected { peer } => format!("  Clipboard sync connected: {}", peer),
        Event::ClipboardDisconnected { peer } => {
            format!("  Clipboard sync disconnected: {}", peer)
        }
        Event::ClipboardReceived(message) => format!(
            "  Clipboard from {}: {}",
            message.from_ip,
            truncate_string(&message.content.replace('\n', " "), 48)
        ),
        Event::ClipboardSent { message, peers } => format!(
            "  Clipboard sent to {} peer(s): {}",
            peers,
            truncate_string(&message.content.replace('\n', " "), 48)
        ),
        Event::ClipboardServerError { message } => {
            format!("  Clipboard server error: {}", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("invalid"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("exactly10!", 10), "exactly10!");
        assert_eq!(truncate_string("this is too long", 10), "this is t…");
    }

    #[test]
    fn test_describe_chat_connected() {
        let event = Event::ChatConnected {
            peer: "10.0.0.4".parse().unwrap(),
        };
        assert_eq!(describe_event(&event), "  Chat connected: 10.0.0.4");
    }

    #[test]
    fn test_describe_shows_one_based_position() {
        let sending = Event::FileSending {
            name: "a.bin".to_string(),
            size: 10,
            index: 0,
            total: 2,
            to: "10.0.0.4".parse().unwrap(),
        };
        assert!(describe_event(&sending).starts_with("  [1/2] Sending a.bin"));

        let receiving = Event::FileReceivingStarted {
            name: "b.bin".to_string(),
            size: None,
            index: Some(1),
            total: Some(2),
            from: "10.0.0.4".parse().unwrap(),
        };
        assert_eq!(
            describe_event(&receiving),
            "  [2/2] Receiving b.bin from 10.0.0.4"
        );
    }

    #[test]
    fn test_format_timestamp_out_of_range() {
        assert_eq!(format_timestamp(u64::MAX), "--:--:--");
    }
}
