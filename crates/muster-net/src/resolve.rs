//! Address Resolver - finds this host's outward-routable IPv4 address.
//!
//! Resolution order:
//!
//! 1. **Route**: connect a UDP socket toward a well-known public address and
//!    read back the local endpoint the kernel picked. Connecting a datagram
//!    socket sends nothing.
//! 2. **Hostname**: resolve the host name, preferring a non-loopback address.
//! 3. **Loopback**: `127.0.0.1`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, warn};

use crate::address::PeerAddress;
use crate::error::Result;

/// Public address used only to select the outbound route.
pub const DEFAULT_ROUTE_TARGET: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Which step of the resolution produced the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    /// Local endpoint of a routed UDP socket.
    Route,
    /// Host name lookup.
    Hostname,
    /// Nothing else worked.
    Loopback,
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Route => write!(f, "route"),
            Self::Hostname => write!(f, "hostname"),
            Self::Loopback => write!(f, "loopback"),
        }
    }
}

/// Resolves the local routable address.
#[derive(Debug, Clone)]
pub struct AddressResolver {
    route_target: SocketAddr,
    hostname: Option<String>,
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self {
            route_target: DEFAULT_ROUTE_TARGET,
            hostname: None,
        }
    }
}

impl AddressResolver {
    /// Create a resolver with the default route target.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another address to select the outbound route.
    #[must_use]
    pub fn with_route_target(mut self, target: SocketAddr) -> Self {
        self.route_target = target;
        self
    }

    /// Use this host name instead of the system one for the fallback lookup.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Resolve the local IPv4 address and report where it came from.
    pub async fn resolve(&self) -> (Ipv4Addr, AddressSource) {
        match self.route_lookup().await {
            Ok(ip) => {
                debug!(%ip, target = %self.route_target, "Resolved local address from route");
                return (ip, AddressSource::Route);
            }
            Err(e) => debug!(error = %e, "Route lookup failed, trying hostname"),
        }

        if let Some(ip) = self.hostname_lookup().await {
            debug!(%ip, "Resolved local address from hostname");
            return (ip, AddressSource::Hostname);
        }

        warn!("Could not determine a routable address, falling back to loopback");
        (Ipv4Addr::LOCALHOST, AddressSource::Loopback)
    }

    /// The local routable address with the given port.
    pub async fn local_routable_address(&self, port: u16) -> PeerAddress {
        let (ip, _) = self.resolve().await;
        PeerAddress::new(ip, port)
    }

    async fn route_lookup(&self) -> std::io::Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(self.route_target).await?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("route lookup produced {other}"),
            )),
        }
    }

    async fn hostname_lookup(&self) -> Option<Ipv4Addr> {
        let hostname = self.hostname.clone().or_else(system_hostname)?;
        let addrs: Vec<Ipv4Addr> = tokio::net::lookup_host((hostname.as_str(), 0))
            .await
            .ok()?
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
                _ => None,
            })
            .collect();

        addrs
            .iter()
            .copied()
            .find(|ip| !ip.is_loopback())
            .or_else(|| addrs.first().copied())
    }
}

fn system_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string(Path::new("/etc/hostname")).ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// The local routable address using the default resolver.
pub async fn local_routable_address(port: u16) -> PeerAddress {
    AddressResolver::default().local_routable_address(port).await
}

/// Bind a TCP listener with `SO_REUSEADDR` set.
///
/// A controller restarted right after a crash must not fail on sockets still
/// in `TIME_WAIT`.
pub fn bind_listener(addr: &PeerAddress) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.socket_addr().into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    debug!(%addr, local = ?listener.local_addr().ok(), "TCP listener bound");
    Ok(listener)
}

/// Whether `port` can currently be bound on all interfaces.
pub fn port_available(port: u16) -> bool {
    std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_always_yields_ipv4_literal() {
        let (ip, source) = AddressResolver::new().resolve().await;
        assert!(!ip.is_unspecified());
        if source == AddressSource::Loopback {
            assert_eq!(ip, Ipv4Addr::LOCALHOST);
        }
    }

    #[tokio::test]
    async fn test_route_to_loopback_target() {
        let resolver = AddressResolver::new()
            .with_route_target(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9));
        let (ip, source) = resolver.resolve().await;
        assert_eq!(source, AddressSource::Route);
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn test_local_address_keeps_port() {
        let addr = local_routable_address(29500).await;
        assert_eq!(addr.port(), 29500);
        assert!(addr.is_connectable());
    }

    #[tokio::test]
    async fn test_bind_listener_and_port_check() {
        let listener = bind_listener(&PeerAddress::unspecified(0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port > 0);
        assert!(!port_available(port));
    }
}
