//! Muster Net - Addressing, Probing and Local Address Resolution
//!
//! The lowest layer of the Muster bootstrap stack. Everything here is about
//! answering two questions before any rendezvous is attempted:
//!
//! - **Where am I?** [`AddressResolver`] finds the IPv4 address other hosts can
//!   route to, falling back from a routing lookup to the host name and finally
//!   to loopback.
//! - **Can I reach you?** [`Prober`] polls a `(host, port)` at a fixed interval
//!   until it answers or the attempt budget runs out.
//!
//! # Addresses
//!
//! A [`PeerAddress`] is always an IPv4 literal plus a port. Hostnames are
//! resolved at the edge ([`PeerAddress::resolve`]) and never travel further
//! into the core.
//!
//! # Example
//!
//! ```rust,ignore
//! use muster_net::{PeerAddress, ProbeConfig, Prober};
//!
//! let controller: PeerAddress = "192.168.1.20:29500".parse()?;
//! let prober = Prober::new(ProbeConfig::default());
//! let result = prober.probe(&controller).await?;
//! if !result.reachable {
//!     eprintln!("controller not listening after {} attempts", result.attempts);
//! }
//! ```

pub mod address;
pub mod error;
pub mod probe;
pub mod resolve;

pub use address::PeerAddress;
pub use error::{Error, Result};
pub use probe::{probe, ProbeConfig, ProbeResult, Prober};
pub use resolve::{
    bind_listener, local_routable_address, port_available, AddressResolver, AddressSource,
    DEFAULT_ROUTE_TARGET,
};
