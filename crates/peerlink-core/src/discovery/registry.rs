//! Known devices and their freshness.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Announcement;

/// A device seen on the network.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    /// Address the device announced
    pub ip: IpAddr,
    /// Display name
    pub hostname: String,
    /// The device's instance id
    pub instance_id: u64,
    /// Wall-clock time of the last heartbeat
    pub last_seen_at: DateTime<Utc>,
    /// Monotonic time of the last heartbeat
    #[serde(skip)]
    pub last_seen: Instant,
}

/// Devices keyed by address.
///
/// Heartbeats carrying this node's own instance id are ignored. Mutating
/// calls return whether the visible set changed, which is what callers use
/// to decide whether to notify.
#[derive(Debug)]
pub struct PeerRegistry {
    own_instance_id: u64,
    stale_after: Duration,
    devices: HashMap<IpAddr, Device>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new(own_instance_id: u64, stale_after: Duration) -> Self {
        Self {
            own_instance_id,
            stale_after,
            devices: HashMap::new(),
        }
    }

    /// Record a heartbeat received at `now`.
    ///
    /// Returns `true` when a device appeared or its identity changed. A plain
    /// refresh of `last_seen` is not a visible change.
    pub fn observe(&mut self, announcement: Announcement, now: Instant) -> bool {
        if announcement.instance_id == self.own_instance_id {
            return false;
        }

        let seen_at = Utc::now();
        match self.devices.get_mut(&announcement.ip) {
            Some(device) => {
                let changed = device.hostname != announcement.hostname
                    || device.instance_id != announcement.instance_id;
                device.hostname = announcement.hostname;
                device.instance_id = announcement.instance_id;
                device.last_seen = now;
                device.last_seen_at = seen_at;
                changed
            }
            None => {
                tracing::info!(
                    "Discovered {} ({})",
                    announcement.hostname,
                    announcement.ip
                );
                self.devices.insert(
                    announcement.ip,
                    Device {
                        ip: announcement.ip,
                        hostname: announcement.hostname,
                        instance_id: announcement.instance_id,
                        last_seen_at: seen_at,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Drop devices silent for longer than the staleness window.
    ///
    /// Returns `true` if anything was removed.
    pub fn sweep(&mut self, now: Instant) -> bool {
        let stale_after = self.stale_after;
        let before = self.devices.len();
        self.devices.retain(|_, device| {
            let keep = now.saturating_duration_since(device.last_seen) <= stale_after;
            if !keep {
                tracing::info!("{} ({}) went away", device.hostname, device.ip);
            }
            keep
        });
        self.devices.len() != before
    }

    /// Every device, sorted by address.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.ip);
        devices
    }

    /// Addresses of every device.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.devices.keys().copied().collect()
    }

    /// Look up a device by address.
    pub fn get(&self, ip: &IpAddr) -> Option<&Device> {
        self.devices.get(ip)
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is known.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
