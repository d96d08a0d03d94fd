//! Human-readable account of a failed bootstrap.

use std::fmt;

use muster_group::ErrorKind;

use crate::strategy::AttemptRecord;

/// What went wrong, what was tried and what to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub rank: u32,
    pub world_size: u32,
    /// Every attempt in the order it was made.
    pub attempts: Vec<AttemptRecord>,
    /// The error that ended the negotiation.
    pub root_cause: String,
    /// Class of the root cause.
    pub kind: ErrorKind,
    pub next_steps: Vec<String>,
}

impl Diagnosis {
    /// Build a diagnosis from the attempt history.
    ///
    /// The root cause is the last attempt's error, or `fallback` when nothing
    /// was attempted.
    #[must_use]
    pub fn new(rank: u32, world_size: u32, attempts: Vec<AttemptRecord>, fallback: &str) -> Self {
        let (root_cause, kind) = attempts
            .last()
            .map(|a| (a.error.clone(), a.error_kind))
            .unwrap_or_else(|| (fallback.to_string(), ErrorKind::Config));

        // A participant that never reached its controller is the most common
        // failure, so it wins over whatever came after.
        let kind = if attempts.iter().any(|a| a.error_kind == ErrorKind::Sequencing)
            && kind != ErrorKind::Config
        {
            ErrorKind::Sequencing
        } else {
            kind
        };

        let next_steps = next_steps(kind, rank, attempts.is_empty());
        Self {
            rank,
            world_size,
            attempts,
            root_cause,
            kind,
            next_steps,
        }
    }
}

fn next_steps(kind: ErrorKind, rank: u32, nothing_attempted: bool) -> Vec<String> {
    let mut steps = Vec::new();

    if nothing_attempted {
        steps.push(
            "Configure at least one rendezvous: --coordinator, --controller, --rendezvous-file \
             or launcher variables (MASTER_ADDR, MASTER_PORT)"
                .to_string(),
        );
    }

    match kind {
        ErrorKind::Sequencing => {
            steps.push("Start the controller (rank 0 or `muster controller`) before any participant".into());
            steps.push("Check the controller address with `muster probe <addr>` from this host".into());
        }
        ErrorKind::Transient => {
            steps.push("Check that firewalls allow the controller and hub ports in both directions".into());
            steps.push("Run `muster diagnose` on every host and compare the advertised addresses".into());
            if rank != 0 {
                steps.push("Pass --advertise if this host picked an address others cannot reach".into());
            }
        }
        ErrorKind::Config => {
            steps.push("Make sure every process agrees on world size and has a distinct rank".into());
            steps.push("Check that explicit flags do not contradict launcher variables".into());
        }
        ErrorKind::Collective => {
            steps.push("A member left or diverged mid-collective; restart every process of the group".into());
        }
        ErrorKind::Usage => {
            steps.push("Build a new negotiator or session instead of reusing a finished one".into());
        }
    }

    steps.push("Stop every process of this group (Ctrl-C) before retrying so no stale links remain".into());
    steps
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Bootstrap failed for rank {} of {} ({} error)",
            self.rank, self.world_size, self.kind
        )?;
        writeln!(f, "  root cause: {}", self.root_cause)?;

        if self.attempts.is_empty() {
            writeln!(f, "  no strategy was attempted")?;
        } else {
            writeln!(f, "  strategies tried:")?;
            for (i, attempt) in self.attempts.iter().enumerate() {
                writeln!(f, "    {}. {}", i + 1, attempt)?;
            }
        }

        writeln!(f, "  next steps:")?;
        for step in &self.next_steps {
            writeln!(f, "    - {step}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyKind;
    use std::time::Duration;

    fn record(kind: StrategyKind, error_kind: ErrorKind, error: &str) -> AttemptRecord {
        AttemptRecord {
            kind,
            error: error.to_string(),
            error_kind,
            elapsed: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_sequencing_dominates() {
        let diagnosis = Diagnosis::new(
            1,
            3,
            vec![
                record(StrategyKind::SharedStore, ErrorKind::Sequencing, "controller unreachable"),
                record(StrategyKind::SharedFile, ErrorKind::Transient, "marker never appeared"),
            ],
            "unused",
        );
        assert_eq!(diagnosis.kind, ErrorKind::Sequencing);
        assert_eq!(diagnosis.root_cause, "marker never appeared");
        assert!(diagnosis.next_steps.iter().any(|s| s.contains("controller")));
    }

    #[test]
    fn test_report_lists_every_attempt() {
        let diagnosis = Diagnosis::new(
            2,
            4,
            vec![
                record(StrategyKind::DirectHandshake, ErrorKind::Transient, "refused"),
                record(StrategyKind::ImplicitConfig, ErrorKind::Transient, "MASTER_ADDR not set"),
            ],
            "unused",
        );
        let text = diagnosis.to_string();
        assert!(text.contains("rank 2 of 4"));
        assert!(text.contains("1. direct"));
        assert!(text.contains("2. implicit"));
        assert!(text.contains("MASTER_ADDR not set"));
        assert!(text.contains("Ctrl-C"));
    }

    #[test]
    fn test_nothing_attempted() {
        let diagnosis = Diagnosis::new(0, 2, Vec::new(), "no rendezvous configured");
        assert_eq!(diagnosis.root_cause, "no rendezvous configured");
        assert!(diagnosis.to_string().contains("no strategy was attempted"));
        assert!(diagnosis.next_steps[0].contains("--coordinator"));
    }
}
