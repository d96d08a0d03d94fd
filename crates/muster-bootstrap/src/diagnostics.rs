//! Host diagnostics for `muster diagnose`.
//!
//! Answers the questions asked first when a group will not form: which
//! address this host advertises and why, whether the rendezvous port is free,
//! whether a store works at all on this host, and whether the controller
//! answers from here.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use muster_group::Backend;
use muster_net::{port_available, AddressResolver, AddressSource, PeerAddress, ProbeResult, Prober};
use muster_store::{StoreClient, StoreServer};
use tracing::debug;

/// Bound for the loopback store self-test.
const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of the loopback store round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfTest {
    Passed { elapsed: Duration },
    Failed { error: String },
}

/// What `muster diagnose` found on this host.
#[derive(Debug, Clone)]
pub struct HostReport {
    pub address: Ipv4Addr,
    pub address_source: AddressSource,
    pub port: u16,
    pub port_available: bool,
    pub store_self_test: SelfTest,
    /// Present when a controller address was given.
    pub controller_probe: Option<Result<ProbeResult, String>>,
    pub backends: Vec<Backend>,
}

impl HostReport {
    /// Whether nothing in the report points at a problem.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let controller_ok = match &self.controller_probe {
            None => true,
            Some(Ok(result)) => result.reachable,
            Some(Err(_)) => false,
        };
        self.address_source != AddressSource::Loopback
            && matches!(self.store_self_test, SelfTest::Passed { .. })
            && controller_ok
    }
}

/// Inspect this host.
///
/// `port` is the rendezvous port to check; `controller`, when given, is
/// probed with `prober`.
pub async fn run_diagnostics(
    resolver: &AddressResolver,
    port: u16,
    controller: Option<PeerAddress>,
    prober: &Prober,
) -> HostReport {
    let (address, address_source) = resolver.resolve().await;
    let port_available = port_available(port);
    let store_self_test = store_self_test().await;

    let controller_probe = match controller {
        Some(controller) => Some(prober.probe(&controller).await.map_err(|e| e.to_string())),
        None => None,
    };

    HostReport {
        address,
        address_source,
        port,
        port_available,
        store_self_test,
        controller_probe,
        backends: Backend::available().to_vec(),
    }
}

/// Host a one-member store on loopback and walk through a registration.
async fn store_self_test() -> SelfTest {
    let started = Instant::now();
    match tokio::time::timeout(SELF_TEST_TIMEOUT, self_test_round()).await {
        Ok(Ok(())) => SelfTest::Passed {
            elapsed: started.elapsed(),
        },
        Ok(Err(e)) => SelfTest::Failed { error: e.to_string() },
        Err(_) => SelfTest::Failed {
            error: format!("no answer within {SELF_TEST_TIMEOUT:?}"),
        },
    }
}

async fn self_test_round() -> muster_store::Result<()> {
    let server = StoreServer::spawn(PeerAddress::loopback(0), 1).await?;
    let mut client = StoreClient::connect(server.loopback_addr(), 1, &Prober::default()).await?;
    client.ping().await?;
    client.register(0, PeerAddress::loopback(0)).await?;
    let roster = client.roster(SELF_TEST_TIMEOUT).await?;
    client.disband(0).await?;
    server.wait_disbanded(SELF_TEST_TIMEOUT).await?;
    debug!(members = roster.len(), "Store self-test round trip complete");
    server.shutdown();
    Ok(())
}

impl fmt::Display for HostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Host diagnostics")?;
        writeln!(f, "  advertised address: {} (from {})", self.address, self.address_source)?;
        if self.address_source == AddressSource::Loopback {
            writeln!(f, "    warning: other hosts cannot reach a loopback address; pass --advertise")?;
        }
        writeln!(
            f,
            "  port {}: {}",
            self.port,
            if self.port_available { "available" } else { "in use" }
        )?;
        match &self.store_self_test {
            SelfTest::Passed { elapsed } => {
                writeln!(f, "  store self-test: passed in {:.1}ms", elapsed.as_secs_f64() * 1000.0)?;
            }
            SelfTest::Failed { error } => writeln!(f, "  store self-test: FAILED ({error})")?,
        }
        match &self.controller_probe {
            None => writeln!(f, "  controller: not checked")?,
            Some(Ok(result)) if result.reachable => writeln!(
                f,
                "  controller {}: reachable after {} attempt(s)",
                result.address, result.attempts
            )?,
            Some(Ok(result)) => writeln!(
                f,
                "  controller {}: UNREACHABLE after {} attempts ({:.1}s)",
                result.address,
                result.attempts,
                result.duration.as_secs_f64()
            )?,
            Some(Err(error)) => writeln!(f, "  controller: probe failed ({error})")?,
        }
        let names: Vec<_> = self.backends.iter().map(Backend::name).collect();
        writeln!(f, "  backends: {}", names.join(", "))
    }
}
