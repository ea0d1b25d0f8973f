//! Connection utilities shared by every protocol.
//!
//! This module answers three questions each subsystem has: which LAN address
//! this node goes by, how a peer's address should be keyed, and how to bind a
//! listening socket that can be rebound immediately after a restart.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tokio::net::TcpListener;

use crate::error::{Error, Result};

/// Detect the LAN address of this machine.
///
/// Connects an unbound UDP socket towards a public address and reads back the
/// local address the OS picked for the route. No packet is sent.
pub fn detect_local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket
        .connect((Ipv4Addr::new(8, 8, 8, 8), 80))
        .map_err(|_| Error::NoNetwork)?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(Error::NoNetwork);
    }
    Ok(ip)
}

/// Resolve the address this node announces, preferring an explicit override.
///
/// Falls back to loopback when no route exists so a single machine can still
/// run every subsystem.
pub fn resolve_local_ip(configured: Option<IpAddr>) -> IpAddr {
    configured.unwrap_or_else(|| {
        detect_local_ip().unwrap_or_else(|e| {
            tracing::warn!("Could not detect LAN address, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        })
    })
}

/// Key a remote peer by address.
///
/// Loopback peers are the local node seen through the loopback interface, so
/// they are recorded under the node's own LAN address.
pub fn normalize_peer_ip(peer: IpAddr, local_ip: IpAddr) -> IpAddr {
    let peer = match peer {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(peer, IpAddr::V4),
        IpAddr::V4(_) => peer,
    };
    if peer.is_loopback() {
        local_ip
    } else {
        peer
    }
}

/// Bind a TCP listener with `SO_REUSEADDR` (and `SO_REUSEPORT` on Unix).
pub fn bind_reusable_listener(subsystem: &'static str, addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |e: std::io::Error| Error::BindFailed {
        subsystem,
        addr: addr.to_string(),
        reason: e.to_string(),
    };

    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(bind_err)?;

    socket.set_reuse_address(true).map_err(bind_err)?;

    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(bind_err)?;

    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(128).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

/// Parse a host address string into a `SocketAddr`.
///
/// Accepts formats:
/// - `IP` (e.g., `192.168.1.100`) - uses `default_port`
/// - `IP:PORT` (e.g., `192.168.1.100:9000`) - uses specified port
/// - `[IPv6]` (e.g., `[::1]`) - uses `default_port`
/// - `[IPv6]:PORT` (e.g., `[::1]:9000`) - uses specified port
///
/// # Examples
///
/// ```
/// use peerlink_core::connection::parse_host_address;
///
/// let addr = parse_host_address("192.168.1.100", 7878).unwrap();
/// assert_eq!(addr.port(), 7878);
///
/// let addr = parse_host_address("192.168.1.100:9000", 7878).unwrap();
/// assert_eq!(addr.port(), 9000);
/// ```
///
/// # Errors
///
/// Returns an error if the host string cannot be parsed.
pub fn parse_host_address(host: &str, default_port: u16) -> Result<SocketAddr> {
    let host = host.trim();
    let invalid = || {
        Error::InvalidInput(format!(
            "Invalid host format '{host}'. Use IP or IP:PORT (e.g., 192.168.1.100 or 192.168.1.100:{default_port})"
        ))
    };

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        let ip: IpAddr = inner.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    if let Some((ip_part, port_part)) = host.rsplit_once(':') {
        if !ip_part.contains(':') {
            let ip: IpAddr = ip_part.parse().map_err(|_| invalid())?;
            let port: u16 = port_part.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "Invalid port '{port_part}'. Port must be a number between 1 and 65535"
                ))
            })?;
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT: u16 = 7878;

    #[test]
    fn test_parse_host_ipv4_only() {
        let addr = parse_host_address("192.168.1.100", PORT).unwrap();
        assert_eq!(addr.ip().to_string(), "192.168.1.100");
        assert_eq!(addr.port(), PORT);
    }

    #[test]
    fn test_parse_host_ipv4_with_port() {
        let addr = parse_host_address("192.168.1.100:7900", PORT).unwrap();
        assert_eq!(addr.port(), 7900);
    }

    #[test]
    fn test_parse_host_ipv6_brackets() {
        let addr = parse_host_address("[::1]", PORT).unwrap();
        assert_eq!(addr.ip().to_string(), "::1");
        assert_eq!(addr.port(), PORT);
    }

    #[test]
    fn test_parse_host_ipv6_with_port() {
        let addr = parse_host_address("[2001:db8::1]:7900", PORT).unwrap();
        assert_eq!(addr.ip().to_string(), "2001:db8::1");
        assert_eq!(addr.port(), 7900);
    }

    #[test]
    fn test_parse_host_invalid() {
        assert!(parse_host_address("not-an-ip", PORT).is_err());
        assert!(parse_host_address("192.168.1.100:abc", PORT).is_err());
        assert!(parse_host_address("192.168.1.256", PORT).is_err());
    }

    #[test]
    fn test_parse_host_whitespace() {
        let addr = parse_host_address("  192.168.1.100  ", PORT).unwrap();
        assert_eq!(addr.ip().to_string(), "192.168.1.100");
    }

    #[test]
    fn test_normalize_loopback_to_local() {
        let local: IpAddr = "192.168.1.20".parse().unwrap();
        assert_eq!(normalize_peer_ip("127.0.0.1".parse().unwrap(), local), local);
        assert_eq!(normalize_peer_ip("::1".parse().unwrap(), local), local);
        assert_eq!(
            normalize_peer_ip("::ffff:127.0.0.1".parse().unwrap(), local),
            local
        );
    }

    #[test]
    fn test_normalize_keeps_remote_peers() {
        let local: IpAddr = "192.168.1.20".parse().unwrap();
        let peer: IpAddr = "192.168.1.31".parse().unwrap();
        assert_eq!(normalize_peer_ip(peer, local), peer);
        assert_eq!(
            normalize_peer_ip("::ffff:192.168.1.31".parse().unwrap(), local),
            peer
        );
    }

    #[test]
    fn test_resolve_local_ip_prefers_override() {
        let configured: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(resolve_local_ip(Some(configured)), configured);
    }

    #[tokio::test]
    async fn test_bind_reusable_listener_twice() {
        let first = bind_reusable_listener("test", "127.0.0.1:0".parse().unwrap())
            .expect("first bind");
        let addr = first.local_addr().expect("addr");
        drop(first);

        let second = bind_reusable_listener("test", addr).expect("rebind");
        assert_eq!(second.local_addr().expect("addr"), addr);
    }
}
