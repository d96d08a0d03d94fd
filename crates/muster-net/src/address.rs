//! IPv4 peer addresses.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A resolved `(IPv4, port)` pair.
///
/// Parsing accepts only literals. A bare hostname is rejected here and must be
/// turned into a literal with [`PeerAddress::resolve`] first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress {
    host: Ipv4Addr,
    port: u16,
}

impl PeerAddress {
    /// Create an address from its parts.
    #[must_use]
    pub const fn new(host: Ipv4Addr, port: u16) -> Self {
        Self { host, port }
    }

    /// Loopback address with the given port.
    #[must_use]
    pub const fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    /// Wildcard bind address with the given port.
    #[must_use]
    pub const fn unspecified(port: u16) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Parse an `a.b.c.d:port` literal.
    pub fn parse(input: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedAddress {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = input
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| malformed("expected host:port"))?;
        let host: Ipv4Addr = host
            .parse()
            .map_err(|_| malformed("host is not an IPv4 literal (resolve hostnames first)"))?;
        let port: u16 = port.parse().map_err(|_| malformed("port is not a number in 0..=65535"))?;

        Ok(Self { host, port })
    }

    /// Resolve a hostname (or literal) to the first IPv4 address it maps to.
    ///
    /// DNS failures are reported as [`Error::Resolution`], which is transient.
    pub async fn resolve(host: &str, port: u16) -> Result<Self> {
        if let Ok(literal) = host.parse::<Ipv4Addr>() {
            return Ok(Self::new(literal, port));
        }

        let candidates = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Resolution {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        candidates
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(Self::from(v4)),
                SocketAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| Error::Resolution {
                host: host.to_string(),
                reason: "no IPv4 address".to_string(),
            })
    }

    /// The IPv4 host.
    #[must_use]
    pub const fn host(&self) -> Ipv4Addr {
        self.host
    }

    /// The port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The same host with another port.
    #[must_use]
    pub const fn with_port(self, port: u16) -> Self {
        Self::new(self.host, port)
    }

    /// Whether this address can be the target of a connection attempt.
    #[must_use]
    pub fn is_connectable(&self) -> bool {
        self.port != 0 && !self.host.is_unspecified() && !self.host.is_broadcast()
    }

    /// Convert to a socket address.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PeerAddress> for String {
    fn from(value: PeerAddress) -> Self {
        value.to_string()
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(value: SocketAddrV4) -> Self {
        Self::new(*value.ip(), value.port())
    }
}

impl From<PeerAddress> for SocketAddr {
    fn from(value: PeerAddress) -> Self {
        value.socket_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_literal() {
        let addr = PeerAddress::parse("192.168.29.52:12355").unwrap();
        assert_eq!(addr.host(), Ipv4Addr::new(192, 168, 29, 52));
        assert_eq!(addr.port(), 12355);
        assert_eq!(addr.to_string(), "192.168.29.52:12355");
    }

    #[test]
    fn rejects_hostnames_and_garbage() {
        for input in ["localhost:29500", "mac-mini.local:29500", "10.0.0.1", "10.0.0.1:99999", ":80", ""] {
            assert!(
                matches!(PeerAddress::parse(input), Err(Error::MalformedAddress { .. })),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn connectable_excludes_wildcards() {
        assert!(PeerAddress::loopback(29500).is_connectable());
        assert!(!PeerAddress::loopback(0).is_connectable());
        assert!(!PeerAddress::unspecified(29500).is_connectable());
    }

    #[tokio::test]
    async fn resolve_accepts_literals_without_dns() {
        let addr = PeerAddress::resolve("10.1.2.3", 80).await.unwrap();
        assert_eq!(addr, PeerAddress::new(Ipv4Addr::new(10, 1, 2, 3), 80));
    }

    proptest! {
        #[test]
        fn display_parse_roundtrip(a: u8, b: u8, c: u8, d: u8, port: u16) {
            let addr = PeerAddress::new(Ipv4Addr::new(a, b, c, d), port);
            prop_assert_eq!(PeerAddress::parse(&addr.to_string()).unwrap(), addr);
        }
    }
}
