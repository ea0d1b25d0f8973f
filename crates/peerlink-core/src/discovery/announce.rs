//! Heartbeat datagram format.
//!
//! ```text
//! FILETRANSFER:<ip>:<hostname>:<instance id>
//! ```
//!
//! The address is everything up to the first `:` after the tag and the
//! instance id everything after the last one, so hostnames may themselves
//! contain colons.

use std::net::IpAddr;

use crate::DISCOVERY_TAG;

/// Parsed heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Address the sender is reachable at
    pub ip: IpAddr,
    /// Sender's display name
    pub hostname: String,
    /// Random id chosen by the sender at startup
    pub instance_id: u64,
}

impl Announcement {
    /// Create an announcement.
    pub fn new(ip: IpAddr, hostname: impl Into<String>, instance_id: u64) -> Self {
        Self {
            ip,
            hostname: hostname.into(),
            instance_id,
        }
    }

    /// Wire form of this announcement.
    pub fn encode(&self) -> String {
        format!(
            "{DISCOVERY_TAG}:{}:{}:{}",
            self.ip, self.hostname, self.instance_id
        )
    }

    /// Parse a datagram. Anything malformed yields `None`.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(datagram).ok()?.trim_end();
        let body = text.strip_prefix(DISCOVERY_TAG)?.strip_prefix(':')?;

        let (ip, rest) = body.split_once(':')?;
        let (hostname, instance_id) = rest.rsplit_once(':')?;

        Some(Self {
            ip: ip.parse().ok()?,
            hostname: hostname.to_string(),
            instance_id: instance_id.parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_format() {
        let ann = Announcement::new("192.168.1.7".parse().unwrap(), "laptop", 4242);
        assert_eq!(ann.encode(), "FILETRANSFER:192.168.1.7:laptop:4242");
    }

    #[test]
    fn test_parse_hostname_with_colons() {
        let ann = Announcement::parse(b"FILETRANSFER:10.0.0.9:desk:top:box:77").unwrap();
        assert_eq!(ann.ip.to_string(), "10.0.0.9");
        assert_eq!(ann.hostname, "desk:top:box");
        assert_eq!(ann.instance_id, 77);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Announcement::parse(b"").is_none());
        assert!(Announcement::parse(b"HELLO:10.0.0.9:host:1").is_none());
        assert!(Announcement::parse(b"FILETRANSFER:10.0.0.9:host").is_none());
        assert!(Announcement::parse(b"FILETRANSFER:not-an-ip:host:1").is_none());
        assert!(Announcement::parse(b"FILETRANSFER:10.0.0.9:host:abc").is_none());
        assert!(Announcement::parse(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn test_parse_tolerates_trailing_newline() {
        let ann = Announcement::parse(b"FILETRANSFER:10.0.0.9:host:5\n").unwrap();
        assert_eq!(ann.instance_id, 5);
    }
}
