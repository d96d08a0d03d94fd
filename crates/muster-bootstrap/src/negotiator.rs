//! Transport Negotiator - tries rendezvous strategies in order.
//!
//! ```text
//! Idle ──► Attempting(0) ──► Attempting(1) ──► ... ──► Exhausted
//!              │                  │
//!              └──────────────────┴──► Joined
//! ```
//!
//! Each strategy gets exactly one attempt, bounded by the attempt timeout.
//! A failure is recorded and the next strategy is tried, except for
//! configuration errors, which end the negotiation at once: another strategy
//! would only hit the same conflict.

use std::fmt;
use std::time::Instant;

use muster_group::{ErrorKind, GroupSession};
use tracing::{debug, error, info, warn};

use crate::config::BootstrapConfig;
use crate::connector::Connector;
use crate::diagnosis::Diagnosis;
use crate::error::{Error, Result};
use crate::strategy::{AttemptRecord, StrategyKind};

/// Where a negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    /// Not started.
    Idle,
    /// Running the strategy at `index` in the plan.
    Attempting { index: usize, kind: StrategyKind },
    /// A strategy formed the group.
    Joined { kind: StrategyKind },
    /// Nothing worked, or a configuration error stopped the negotiation.
    Exhausted,
}

impl fmt::Display for NegotiatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Attempting { index, kind } => write!(f, "Attempting({index}: {kind})"),
            Self::Joined { kind } => write!(f, "Joined({kind})"),
            Self::Exhausted => write!(f, "Exhausted"),
        }
    }
}

/// Runs one negotiation. Build a new negotiator to try again.
#[derive(Debug)]
pub struct Negotiator<'a, C> {
    config: &'a BootstrapConfig,
    connector: C,
    state: NegotiatorState,
    history: Vec<AttemptRecord>,
}

impl<'a, C: Connector> Negotiator<'a, C> {
    /// Create a negotiator in the `Idle` state.
    pub fn new(config: &'a BootstrapConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            state: NegotiatorState::Idle,
            history: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> NegotiatorState {
        self.state
    }

    /// Failed attempts so far, in order.
    #[must_use]
    pub fn history(&self) -> &[AttemptRecord] {
        &self.history
    }

    /// Try each planned strategy until one forms the group.
    pub async fn negotiate(&mut self) -> Result<GroupSession> {
        if self.state != NegotiatorState::Idle {
            return Err(Error::AlreadyNegotiated);
        }

        let rank = self.config.rank();
        let world_size = self.config.world_size();

        let plan = match self.config.plan().and_then(|plan| {
            self.config.group_config().map(|group| (plan, group))
        }) {
            Ok(planned) => planned,
            Err(e) => {
                self.state = NegotiatorState::Exhausted;
                let diagnosis = Diagnosis::new(rank, world_size, Vec::new(), &e.to_string());
                error!(rank, error = %e, "Invalid bootstrap configuration");
                return Err(Error::Aborted(Box::new(diagnosis)));
            }
        };
        let (strategies, group) = plan;

        if strategies.is_empty() {
            self.state = NegotiatorState::Exhausted;
            let diagnosis = Diagnosis::new(rank, world_size, Vec::new(), "no rendezvous strategy is configured");
            return Err(Error::Exhausted(Box::new(diagnosis)));
        }

        info!(
            rank,
            world_size,
            plan = ?strategies.iter().map(|s| s.kind()).collect::<Vec<_>>(),
            "Starting transport negotiation"
        );

        let timeout = self.config.attempt_timeout;
        for (index, strategy) in strategies.into_iter().enumerate() {
            let kind = strategy.kind();
            self.state = NegotiatorState::Attempting { index, kind };
            debug!(rank, index, %strategy, ?timeout, "Attempting strategy");

            let started = Instant::now();
            let attempt = tokio::time::timeout(timeout, self.connector.connect(&strategy, &group)).await;
            let result = attempt.unwrap_or(Err(Error::AttemptTimeout { kind, after: timeout }));

            match result {
                Ok(session) => {
                    self.state = NegotiatorState::Joined { kind };
                    info!(
                        rank,
                        world_size,
                        %kind,
                        elapsed = ?started.elapsed(),
                        failed_attempts = self.history.len(),
                        "Group joined"
                    );
                    return Ok(session);
                }
                Err(e) => {
                    let record = AttemptRecord {
                        kind,
                        error: e.to_string(),
                        error_kind: e.kind(),
                        elapsed: started.elapsed(),
                    };
                    warn!(rank, %kind, error_kind = %record.error_kind, error = %e, "Strategy failed");
                    self.history.push(record);

                    if e.kind() == ErrorKind::Config {
                        self.state = NegotiatorState::Exhausted;
                        let diagnosis = Diagnosis::new(rank, world_size, self.history.clone(), "");
                        error!(rank, %kind, "Configuration error, not trying further strategies");
                        return Err(Error::Aborted(Box::new(diagnosis)));
                    }
                }
            }
        }

        self.state = NegotiatorState::Exhausted;
        let diagnosis = Diagnosis::new(rank, world_size, self.history.clone(), "");
        error!(rank, attempts = self.history.len(), "All rendezvous strategies failed");
        Err(Error::Exhausted(Box::new(diagnosis)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RendezvousStrategy;
    use muster_group::GroupConfig;
    use muster_net::PeerAddress;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails the first `failures` attempts, then forms a solo group.
    struct FaultyConnector {
        failures: usize,
        failure: fn() -> Error,
        calls: Mutex<Vec<StrategyKind>>,
    }

    impl FaultyConnector {
        fn new(failures: usize, failure: fn() -> Error) -> Self {
            Self {
                failures,
                failure,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<StrategyKind> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Connector for &FaultyConnector {
        async fn connect(&self, strategy: &RendezvousStrategy, group: &GroupConfig) -> Result<GroupSession> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(strategy.kind());
                calls.len()
            };
            if call <= self.failures {
                return Err((self.failure)());
            }
            let solo = GroupConfig::new(0, 1)?.with_timeout(group.timeout);
            Ok(GroupSession::solo(solo)?)
        }
    }

    /// Never finishes.
    struct StuckConnector;

    impl Connector for StuckConnector {
        async fn connect(&self, _: &RendezvousStrategy, _: &GroupConfig) -> Result<GroupSession> {
            std::future::pending().await
        }
    }

    fn unreachable() -> Error {
        Error::Net(muster_net::Error::Unreachable {
            address: "10.0.0.9:29500".into(),
            attempts: 3,
            elapsed: Duration::from_secs(3),
            last_error: "connection refused".into(),
        })
    }

    fn conflict() -> Error {
        Error::LauncherConflict {
            var: "WORLD_SIZE",
            launcher: "4".into(),
            explicit: "2".into(),
        }
    }

    fn three_strategies() -> BootstrapConfig {
        BootstrapConfig::new(0, 1)
            .unwrap()
            .with_coordinator(PeerAddress::loopback(29400))
            .with_controller(PeerAddress::loopback(29500))
            .with_strategies(vec![
                StrategyKind::DirectHandshake,
                StrategyKind::ImplicitConfig,
                StrategyKind::SharedStore,
            ])
    }

    #[tokio::test]
    async fn test_falls_back_in_order() {
        let config = three_strategies();
        let connector = FaultyConnector::new(2, unreachable);
        let mut negotiator = Negotiator::new(&config, &connector);
        assert_eq!(negotiator.state(), NegotiatorState::Idle);

        let session = negotiator.negotiate().await.unwrap();
        assert!(session.is_alive());
        assert_eq!(
            connector.calls(),
            vec![
                StrategyKind::DirectHandshake,
                StrategyKind::ImplicitConfig,
                StrategyKind::SharedStore
            ]
        );
        assert_eq!(
            negotiator.state(),
            NegotiatorState::Joined {
                kind: StrategyKind::SharedStore
            }
        );
        assert_eq!(negotiator.history().len(), 2);
        assert!(negotiator
            .history()
            .iter()
            .all(|r| r.error_kind == ErrorKind::Transient));
    }

    #[tokio::test]
    async fn test_exhausted_carries_every_attempt() {
        let config = three_strategies();
        let connector = FaultyConnector::new(usize::MAX, unreachable);
        let mut negotiator = Negotiator::new(&config, &connector);

        let err = negotiator.negotiate().await.unwrap_err();
        assert_eq!(negotiator.state(), NegotiatorState::Exhausted);
        assert_eq!(connector.calls().len(), 3);

        let diagnosis = err.diagnosis().unwrap();
        assert_eq!(diagnosis.attempts.len(), 3);
        assert!(matches!(err, Error::Exhausted(_)));
    }

    #[tokio::test]
    async fn test_config_error_stops_immediately() {
        let config = three_strategies();
        let connector = FaultyConnector::new(usize::MAX, conflict);
        let mut negotiator = Negotiator::new(&config, &connector);

        let err = negotiator.negotiate().await.unwrap_err();
        assert!(matches!(err, Error::Aborted(_)));
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(connector.calls(), vec![StrategyKind::DirectHandshake]);
        assert_eq!(negotiator.state(), NegotiatorState::Exhausted);
    }

    #[tokio::test]
    async fn test_negotiates_once() {
        let config = three_strategies();
        let connector = FaultyConnector::new(0, unreachable);
        let mut negotiator = Negotiator::new(&config, &connector);

        negotiator.negotiate().await.unwrap();
        let again = negotiator.negotiate().await.unwrap_err();
        assert!(matches!(again, Error::AlreadyNegotiated));
        assert_eq!(again.kind(), ErrorKind::Usage);
        assert_eq!(connector.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_advances() {
        let config = BootstrapConfig::new(0, 1)
            .unwrap()
            .with_attempt_timeout(Duration::from_millis(50));
        let mut negotiator = Negotiator::new(&config, StuckConnector);

        let err = negotiator.negotiate().await.unwrap_err();
        // Only the implicit strategy is planned without addresses.
        assert_eq!(negotiator.history().len(), 1);
        assert!(negotiator.history()[0].error.contains("did not finish"));
        assert!(matches!(err, Error::Exhausted(_)));
    }

    #[tokio::test]
    async fn test_no_strategies() {
        let config = BootstrapConfig::new(0, 2).unwrap().with_strategies(Vec::new());
        let connector = FaultyConnector::new(0, unreachable);
        let mut negotiator = Negotiator::new(&config, &connector);
        let err = negotiator.negotiate().await.unwrap_err();
        assert!(err.to_string().contains("no rendezvous strategy"));
        assert!(connector.calls().is_empty());
    }
}
