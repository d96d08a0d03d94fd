//! Connectivity Prober - bounded polling reachability checks.
//!
//! A probe is a sequence of TCP connection attempts against one address. Each
//! attempt occupies one polling slot: connect (bounded by the per-attempt
//! timeout), and on failure wait out the rest of the slot before the next one.
//! A never-reachable address therefore costs `max_attempts × interval`.
//!
//! Refused connections, unreachable hosts and attempt timeouts are ordinary
//! negative results. The only probe error is a target that cannot be connected
//! to at all (port 0, wildcard host).

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::address::PeerAddress;
use crate::error::{Error, Result};

/// Prober configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Length of one polling slot.
    /// Default: 1s.
    pub interval: Duration,

    /// Upper bound for a single connection attempt.
    /// Default: 1s.
    pub per_attempt_timeout: Duration,

    /// Number of attempts before giving up. Must be at least 1.
    /// Default: 30 (a 30s budget at the default interval).
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            per_attempt_timeout: Duration::from_secs(1),
            max_attempts: 30,
        }
    }
}

impl ProbeConfig {
    /// Derive the attempt count from a total budget at the current interval.
    ///
    /// Always yields at least one attempt.
    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        let slots = budget.as_nanos() / self.interval.as_nanos().max(1);
        self.max_attempts = u32::try_from(slots).unwrap_or(u32::MAX).max(1);
        self
    }

    /// Set the polling interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = timeout;
        self
    }

    /// Set the attempt count.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Total time a failing probe takes.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(Error::InvalidConfig("per_attempt_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// The probed address.
    pub address: PeerAddress,
    /// Whether any attempt connected.
    pub reachable: bool,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Wall time spent probing.
    pub duration: Duration,
}

/// Polls addresses until they accept a TCP connection.
#[derive(Debug, Clone, Default)]
pub struct Prober {
    config: ProbeConfig,
}

impl Prober {
    /// Create a prober.
    #[must_use]
    pub const fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// The prober's configuration.
    #[must_use]
    pub const fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe `address` until it answers or the attempt budget is spent.
    pub async fn probe(&self, address: &PeerAddress) -> Result<ProbeResult> {
        match self.connect(address).await {
            Ok((_stream, result)) => Ok(result),
            Err(Error::Unreachable {
                attempts, elapsed, ..
            }) => Ok(ProbeResult {
                address: *address,
                reachable: false,
                attempts,
                duration: elapsed,
            }),
            Err(e) => Err(e),
        }
    }

    /// Connect to `address`, retrying at the polling interval.
    ///
    /// Returns the live stream so callers do not race a second connect after a
    /// successful probe.
    pub async fn connect(&self, address: &PeerAddress) -> Result<(TcpStream, ProbeResult)> {
        self.config.validate()?;
        if !address.is_connectable() {
            return Err(Error::MalformedAddress {
                input: address.to_string(),
                reason: "not a connectable target".to_string(),
            });
        }

        let started = Instant::now();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.config.max_attempts {
            let slot_end = tokio::time::Instant::now() + self.config.interval;

            match try_connect(address, self.config.per_attempt_timeout).await {
                Ok(stream) => {
                    let result = ProbeResult {
                        address: *address,
                        reachable: true,
                        attempts: attempt,
                        duration: started.elapsed(),
                    };
                    debug!(
                        %address,
                        attempts = attempt,
                        elapsed = ?result.duration,
                        "Peer reachable"
                    );
                    return Ok((stream, result));
                }
                Err(e) => {
                    trace!(%address, attempt, error = %e, "Probe attempt failed");
                    last_error = e;
                }
            }

            tokio::time::sleep_until(slot_end).await;
        }

        let elapsed = started.elapsed();
        debug!(
            %address,
            attempts = self.config.max_attempts,
            ?elapsed,
            "Peer unreachable, probe budget exhausted"
        );

        Err(Error::Unreachable {
            address: address.to_string(),
            attempts: self.config.max_attempts,
            elapsed,
            last_error,
        })
    }
}

/// Probe with explicit parameters and the default 1s polling interval.
pub async fn probe(
    address: &PeerAddress,
    per_attempt_timeout: Duration,
    max_attempts: u32,
) -> Result<ProbeResult> {
    let config = ProbeConfig {
        per_attempt_timeout,
        max_attempts,
        ..ProbeConfig::default()
    };
    Prober::new(config).probe(address).await
}

async fn try_connect(address: &PeerAddress, timeout: Duration) -> std::result::Result<TcpStream, String> {
    match tokio::time::timeout(timeout, TcpStream::connect(address.socket_addr())).await {
        Ok(Ok(stream)) => {
            // Frames are small and latency bound.
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("connect timed out after {timeout:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// An address on loopback that nothing listens on.
    async fn dead_address() -> PeerAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        PeerAddress::loopback(port)
    }

    fn fast_config(max_attempts: u32) -> ProbeConfig {
        ProbeConfig::default()
            .with_interval(Duration::from_millis(100))
            .with_attempt_timeout(Duration::from_millis(100))
            .with_max_attempts(max_attempts)
    }

    #[tokio::test]
    async fn test_reachable_on_first_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = Prober::new(fast_config(5))
            .probe(&PeerAddress::loopback(port))
            .await
            .unwrap();

        assert!(result.reachable);
        assert_eq!(result.attempts, 1);
        assert!(result.duration < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unreachable_uses_exact_attempt_budget() {
        let address = dead_address().await;
        let started = Instant::now();

        let result = Prober::new(fast_config(4)).probe(&address).await.unwrap();
        let elapsed = started.elapsed();

        assert!(!result.reachable);
        assert_eq!(result.attempts, 4);
        assert!(elapsed >= Duration::from_millis(400), "finished early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "overran budget: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_late_listener_is_found() {
        let address = dead_address().await;
        let bind_to = address.socket_addr();

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let listener = TcpListener::bind(bind_to).await.unwrap();
            // Keep the listener open while the prober connects.
            let _ = listener.accept().await;
        });

        let (_stream, result) = Prober::new(fast_config(20)).connect(&address).await.unwrap();
        assert!(result.reachable);
        assert!(result.attempts > 1);
        late.abort();
    }

    #[tokio::test]
    async fn test_connect_reports_unreachable_error() {
        let address = dead_address().await;
        let err = Prober::new(fast_config(2)).connect(&address).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, Error::Unreachable { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_malformed_target_is_an_error() {
        let err = Prober::new(fast_config(2))
            .probe(&PeerAddress::unspecified(29500))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedAddress { .. }));
    }

    #[tokio::test]
    async fn test_zero_attempts_rejected() {
        let err = Prober::new(fast_config(0))
            .probe(&PeerAddress::loopback(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_budget_derivation() {
        let config = ProbeConfig::default().with_budget(Duration::from_secs(30));
        assert_eq!(config.max_attempts, 30);
        assert_eq!(config.budget(), Duration::from_secs(30));

        let tiny = ProbeConfig::default().with_budget(Duration::from_millis(10));
        assert_eq!(tiny.max_attempts, 1);
    }
}
