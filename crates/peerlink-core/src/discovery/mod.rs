//! Network discovery for PeerLink.
//!
//! Every node advertises itself with a small heartbeat datagram sent to a
//! multicast group and listens on the same group for everyone else.
//!
//! ## Protocol
//!
//! - Port: 37821 (UDP)
//! - Group: 239.255.77.88
//! - Heartbeat interval: every 3 seconds
//! - Expiry: a device silent for more than 30 seconds is dropped
//!
//! ## Heartbeat
//!
//! ```text
//! FILETRANSFER:192.168.1.20:Marcus-Laptop:3141592653
//! ```
//!
//! The trailing number is an instance id chosen at startup. It is how a node
//! recognises (and ignores) its own heartbeats, including when several
//! instances share one address.
//!
//! Heartbeats are also sent straight to every known device, which keeps
//! discovery working on networks that forward multicast in one direction only.

mod announce;
mod registry;

pub use announce::Announcement;
pub use registry::{Device, PeerRegistry};

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};

/// Receive buffer size; fits any UDP payload.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Settings for a [`DiscoveryService`].
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// UDP port heartbeats are sent to and received on
    pub port: u16,
    /// Multicast group to join, or `None` for unicast-only operation
    pub multicast_group: Option<Ipv4Addr>,
    /// Multicast TTL
    pub multicast_ttl: u32,
    /// Address announced to peers
    pub local_ip: IpAddr,
    /// Name announced to peers
    pub hostname: String,
    /// Time between heartbeats
    pub heartbeat_interval: Duration,
    /// Silence after which a device is dropped
    pub stale_after: Duration,
    /// Time between registry sweeps
    pub sweep_interval: Duration,
    /// Also send heartbeats to every known device
    pub unicast_known_peers: bool,
}

impl DiscoveryOptions {
    /// Options from configuration.
    pub fn from_config(config: &Config, local_ip: IpAddr) -> Self {
        Self {
            port: config.network.discovery_port,
            multicast_group: Some(config.network.multicast_group),
            multicast_ttl: config.network.multicast_ttl,
            local_ip,
            hostname: config.general.device_name.clone(),
            heartbeat_interval: config.discovery.heartbeat_interval,
            stale_after: config.discovery.stale_after,
            sweep_interval: config.discovery.sweep_interval,
            unicast_known_peers: config.discovery.unicast_known_peers,
        }
    }
}

/// Advertises this node and tracks every other node on the network.
#[derive(Debug)]
pub struct DiscoveryService {
    /// Socket used for both sending and receiving
    socket: Arc<UdpSocket>,
    /// Devices seen so far
    registry: Arc<Mutex<PeerRegistry>>,
    /// Our own heartbeat
    announcement: Announcement,
    /// Settings
    options: DiscoveryOptions,
    /// Notification sink
    events: EventBus,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
    /// Whether the loops are running
    is_active: Arc<Mutex<bool>>,
}

impl DiscoveryService {
    /// Bind the discovery socket and join the multicast group.
    ///
    /// On failure a single `DiscoveryError` notification is emitted; the
    /// caller decides whether to try again later.
    pub async fn bind(options: DiscoveryOptions, events: EventBus) -> Result<Self> {
        let socket = match open_socket(&options) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!("Discovery unavailable: {}", e);
                events.emit(Event::DiscoveryError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let instance_id = rand::thread_rng().gen::<u64>();
        let announcement =
            Announcement::new(options.local_ip, options.hostname.clone(), instance_id);
        let registry = PeerRegistry::new(instance_id, options.stale_after);
        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::info!(
            "Discovery bound on port {} as {} ({})",
            socket.local_addr().map_or(options.port, |a| a.port()),
            options.hostname,
            options.local_ip
        );

        Ok(Self {
            socket: Arc::new(socket),
            registry: Arc::new(Mutex::new(registry)),
            announcement,
            options,
            events,
            shutdown_tx,
            is_active: Arc::new(Mutex::new(false)),
        })
    }

    /// This node's instance id.
    pub fn instance_id(&self) -> u64 {
        self.announcement.instance_id
    }

    /// Address the discovery socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Start the advertise, listen and sweep loops.
    pub async fn start(&self) -> Result<()> {
        let mut is_active = self.is_active.lock().await;
        if *is_active {
            return Ok(());
        }
        *is_active = true;
        drop(is_active);

        self.spawn_advertiser();
        self.spawn_listener();
        self.spawn_sweeper();
        Ok(())
    }

    /// Stop every loop.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        *self.is_active.lock().await = false;
    }

    /// Check if the loops are running.
    pub async fn is_running(&self) -> bool {
        *self.is_active.lock().await
    }

    /// Snapshot of known devices, sorted by address.
    pub async fn devices(&self) -> Vec<Device> {
        self.registry.lock().await.snapshot()
    }

    fn spawn_advertiser(&self) {
        let socket = Arc::clone(&self.socket);
        let registry = Arc::clone(&self.registry);
        let payload = self.announcement.encode();
        let options = self.options.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let group = options
                .multicast_group
                .map(|group| SocketAddr::V4(SocketAddrV4::new(group, options.port)));

            loop {
                if let Some(group) = group {
                    if let Err(e) = socket.send_to(payload.as_bytes(), group).await {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                    }
                }

                if options.unicast_known_peers {
                    let peers = registry.lock().await.addresses();
                    for ip in peers {
                        let target = SocketAddr::new(ip, options.port);
                        if let Err(e) = socket.send_to(payload.as_bytes(), target).await {
                            tracing::debug!("Failed to send heartbeat to {}: {}", target, e);
                        }
                    }
                }

                tokio::select! {
                    () = tokio::time::sleep(options.heartbeat_interval) => {}
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Advertiser received shutdown signal");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_listener(&self) {
        let socket = Arc::clone(&self.socket);
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let received = tokio::select! {
                    received = socket.recv_from(&mut buf) => received,
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Discovery listener received shutdown signal");
                        break;
                    }
                };

                let (len, source) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!("Error receiving heartbeat: {}", e);
                        continue;
                    }
                };

                if len == buf.len() {
                    tracing::trace!("Datagram from {} filled the receive buffer", source);
                }

                let Some(announcement) = Announcement::parse(&buf[..len]) else {
                    tracing::debug!("Ignoring malformed datagram from {}", source);
                    continue;
                };

                let mut registry = registry.lock().await;
                if registry.observe(announcement, Instant::now()) {
                    let devices = registry.snapshot();
                    drop(registry);
                    events.emit(Event::DevicesChanged { devices });
                }
            }
        });
    }

    fn spawn_sweeper(&self) {
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let sweep_interval = self.options.sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(sweep_interval) => {}
                    _ = shutdown_rx.recv() => break,
                }

                let mut registry = registry.lock().await;
                if registry.sweep(Instant::now()) {
                    let devices = registry.snapshot();
                    drop(registry);
                    events.emit(Event::DevicesChanged { devices });
                }
            }
        });
    }
}

fn open_socket(options: &DiscoveryOptions) -> Result<UdpSocket> {
    let bind_err = |e: std::io::Error| Error::BindFailed {
        subsystem: "discovery",
        addr: format!("0.0.0.0:{}", options.port),
        reason: e.to_string(),
    };

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_err)?;

    socket.set_reuse_address(true).map_err(bind_err)?;

    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(bind_err)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, options.port);
    socket.bind(&addr.into()).map_err(bind_err)?;

    if let Some(group) = options.multicast_group {
        let interface = match options.local_ip {
            IpAddr::V4(ip) if !ip.is_loopback() => ip,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        socket
            .join_multicast_v4(&group, &interface)
            .map_err(bind_err)?;
        if !interface.is_unspecified() {
            socket.set_multicast_if_v4(&interface).map_err(bind_err)?;
        }
        socket.set_multicast_loop_v4(true).map_err(bind_err)?;
        socket
            .set_multicast_ttl_v4(options.multicast_ttl)
            .map_err(bind_err)?;
    }

    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_err)
}
