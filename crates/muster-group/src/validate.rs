//! Collective Validator - a fixed battery run against a fresh group.
//!
//! Every member runs the same four checks in the same order, then the group
//! exchanges pass flags so every member learns which ranks failed:
//!
//! 1. `all_gather(rank)` must return `0..world_size`.
//! 2. `broadcast` of [`BROADCAST_PROBE`] from rank 0 must arrive unchanged.
//! 3. `barrier` must complete.
//! 4. `all_reduce(rank + 1, Sum)` must equal `N(N+1)/2`.
//!
//! A failed check does not skip the later ones; members that stopped early
//! would leave the rest of the group waiting. Transport errors, on the other
//! hand, end the battery at once since the group is already gone.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::session::Collectives;
use crate::wire::ReduceOp;

/// Buffer broadcast from rank 0 during validation.
pub const BROADCAST_PROBE: [f64; 3] = [42.0, 100.0, 256.0];

/// One check of the battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    AllGather,
    Broadcast,
    Barrier,
    AllReduce,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllGather => write!(f, "all_gather"),
            Self::Broadcast => write!(f, "broadcast"),
            Self::Barrier => write!(f, "barrier"),
            Self::AllReduce => write!(f, "all_reduce"),
        }
    }
}

/// Result of one check on this member.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub check: Check,
    pub passed: bool,
    /// Mismatch description, empty when passed.
    pub detail: String,
    pub elapsed: Duration,
}

/// What the battery found, identical in `failed_ranks` on every member.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub rank: u32,
    pub world_size: u32,
    pub outcomes: Vec<CheckOutcome>,
    /// Ranks where any check failed, ascending.
    pub failed_ranks: Vec<u32>,
}

impl ValidationReport {
    /// Whether every rank passed every check.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.failed_ranks.is_empty()
    }

    /// Whether this member passed every check.
    #[must_use]
    pub fn passed_locally(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    /// Local mismatch details, tagged with this member's rank.
    #[must_use]
    pub fn detail(&self) -> String {
        let failures: Vec<String> = self
            .outcomes
            .iter()
            .filter(|o| !o.passed)
            .map(|o| format!("[rank {}] {}: {}", self.rank, o.check, o.detail))
            .collect();

        if failures.is_empty() && !self.failed_ranks.is_empty() {
            format!("[rank {}] local checks passed", self.rank)
        } else {
            failures.join("; ")
        }
    }

    /// Turn an unhealthy report into [`Error::ValidationFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_healthy() {
            Ok(self)
        } else {
            Err(Error::ValidationFailed {
                failed_ranks: self.failed_ranks.clone(),
                detail: self.detail(),
            })
        }
    }
}

/// Run the battery against `session`.
pub async fn validate<C: Collectives>(session: &mut C) -> Result<ValidationReport> {
    let rank = session.rank();
    let world_size = session.world_size();
    let mut outcomes = Vec::with_capacity(4);

    // 1. all_gather
    let started = Instant::now();
    let gathered: Vec<u32> = session.all_gather(&rank).await?;
    let expected: Vec<u32> = (0..world_size).collect();
    outcomes.push(outcome(
        Check::AllGather,
        started,
        (gathered != expected).then(|| format!("expected {expected:?}, got {gathered:?}")),
    ));

    // 2. broadcast
    let started = Instant::now();
    let mut buffer = if rank == 0 {
        BROADCAST_PROBE.to_vec()
    } else {
        vec![0.0; BROADCAST_PROBE.len()]
    };
    session.broadcast(&mut buffer, 0).await?;
    let identical = buffer.len() == BROADCAST_PROBE.len()
        && buffer
            .iter()
            .zip(BROADCAST_PROBE.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits());
    outcomes.push(outcome(
        Check::Broadcast,
        started,
        (!identical).then(|| format!("expected {BROADCAST_PROBE:?}, got {buffer:?}")),
    ));

    // 3. barrier
    let started = Instant::now();
    session.barrier().await?;
    outcomes.push(outcome(Check::Barrier, started, None));

    // 4. all_reduce
    let started = Instant::now();
    let sum = session.all_reduce(u64::from(rank) + 1, ReduceOp::Sum).await?;
    let n = u64::from(world_size);
    let expected_sum = n * (n + 1) / 2;
    outcomes.push(outcome(
        Check::AllReduce,
        started,
        (sum != expected_sum).then(|| format!("expected {expected_sum}, got {sum}")),
    ));

    // Verdict
    let local_pass = outcomes.iter().all(|o| o.passed);
    let verdicts: Vec<bool> = session.all_gather(&local_pass).await?;
    let failed_ranks: Vec<u32> = verdicts
        .iter()
        .zip(0..)
        .filter(|(passed, _)| !**passed)
        .map(|(_, rank)| rank)
        .collect();

    let report = ValidationReport {
        rank,
        world_size,
        outcomes,
        failed_ranks,
    };

    if report.is_healthy() {
        info!(rank, world_size, "Group validation passed");
    } else {
        warn!(
            rank,
            world_size,
            failed_ranks = ?report.failed_ranks,
            detail = %report.detail(),
            "Group validation failed"
        );
    }
    Ok(report)
}

fn outcome(check: Check, started: Instant, failure: Option<String>) -> CheckOutcome {
    CheckOutcome {
        check,
        passed: failure.is_none(),
        detail: failure.unwrap_or_default(),
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::Reduce;
    use crate::session::{GroupSession, Wire};
    use crate::testing::loopback_group;
    use futures::future::join_all;
    use std::future::Future;

    /// Alters every broadcast result received on one rank.
    struct CorruptBroadcast<'a> {
        inner: &'a mut GroupSession,
        victim: u32,
    }

    impl Collectives for CorruptBroadcast<'_> {
        fn rank(&self) -> u32 {
            self.inner.rank()
        }

        fn world_size(&self) -> u32 {
            self.inner.world_size()
        }

        fn barrier(&mut self) -> impl Future<Output = Result<()>> + Send {
            self.inner.barrier()
        }

        async fn broadcast<T: Wire>(&mut self, buffer: &mut T, source: u32) -> Result<()> {
            self.inner.broadcast(buffer, source).await?;
            if self.inner.rank() == self.victim {
                let mut bytes = bincode::serialize(&*buffer)?;
                if let Some(last) = bytes.last_mut() {
                    *last ^= 0x01;
                }
                *buffer = bincode::deserialize(&bytes)?;
            }
            Ok(())
        }

        fn all_gather<T: Wire>(&mut self, value: &T) -> impl Future<Output = Result<Vec<T>>> + Send {
            self.inner.all_gather(value)
        }

        fn all_reduce<T: Wire + Reduce>(
            &mut self,
            value: T,
            op: ReduceOp,
        ) -> impl Future<Output = Result<T>> + Send {
            self.inner.all_reduce(value, op)
        }
    }

    #[tokio::test]
    async fn test_healthy_groups_pass() {
        for n in [1u32, 2, 3, 5] {
            let mut sessions = loopback_group(n).await;
            let reports = join_all(sessions.iter_mut().map(validate)).await;

            for (rank, report) in reports.into_iter().enumerate() {
                let report = report.unwrap();
                assert_eq!(report.rank as usize, rank);
                assert!(report.is_healthy(), "n={n}: {report:?}");
                assert_eq!(report.outcomes.len(), 4);
                assert!(report.into_result().is_ok());
            }
        }
    }

    #[tokio::test]
    async fn test_corrupted_broadcast_names_rank() {
        let mut sessions = loopback_group(3).await;
        let reports = join_all(sessions.iter_mut().map(|session| async move {
            let mut wrapped = CorruptBroadcast {
                inner: session,
                victim: 2,
            };
            validate(&mut wrapped).await
        }))
        .await;

        for report in reports {
            let report = report.unwrap();
            assert_eq!(report.failed_ranks, vec![2]);
            assert_eq!(report.outcomes.len(), 4);
            assert_eq!(report.passed_locally(), report.rank != 2);

            if report.rank == 2 {
                let broadcast = &report.outcomes[1];
                assert_eq!(broadcast.check, Check::Broadcast);
                assert!(!broadcast.passed);
                assert!(report.detail().starts_with("[rank 2] broadcast"));
            }

            match report.into_result() {
                Err(Error::ValidationFailed { failed_ranks, .. }) => {
                    assert_eq!(failed_ranks, vec![2]);
                }
                other => panic!("expected validation failure, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_validation_on_dead_session_is_usage_error() {
        let mut sessions = loopback_group(1).await;
        sessions[0].teardown().await.unwrap();
        let err = validate(&mut sessions[0]).await.unwrap_err();
        assert!(matches!(err, Error::NotJoined { .. }));
    }
}
