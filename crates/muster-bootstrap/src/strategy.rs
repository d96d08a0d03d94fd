//! Rendezvous strategies and the record of each attempt.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use muster_group::ErrorKind;
use muster_net::PeerAddress;

use crate::error::Error;

/// Names a strategy independently of its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    DirectHandshake,
    ImplicitConfig,
    SharedStore,
    SharedFile,
}

impl StrategyKind {
    /// Every kind, in the default negotiation order.
    pub const ALL: [StrategyKind; 4] = [
        Self::DirectHandshake,
        Self::ImplicitConfig,
        Self::SharedStore,
        Self::SharedFile,
    ];
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectHandshake => write!(f, "direct"),
            Self::ImplicitConfig => write!(f, "implicit"),
            Self::SharedStore => write!(f, "store"),
            Self::SharedFile => write!(f, "file"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "direct-handshake" | "tcp" => Ok(Self::DirectHandshake),
            "implicit" | "implicit-config" | "env" => Ok(Self::ImplicitConfig),
            "store" | "shared-store" => Ok(Self::SharedStore),
            "file" | "shared-file" => Ok(Self::SharedFile),
            other => Err(Error::InvalidConfig(format!(
                "unknown strategy {other:?} (expected direct, implicit, store or file)"
            ))),
        }
    }
}

/// One way of forming the group, with everything it needs.
///
/// Built fresh for each attempt and dropped when the attempt ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousStrategy {
    /// Rank 0 listens on the coordinator address; everyone else dials it.
    DirectHandshake { coordinator: PeerAddress },
    /// Rendezvous at the controller named by launcher variables.
    ImplicitConfig,
    /// Rendezvous through the controller's store.
    SharedStore {
        controller: PeerAddress,
        is_controller: bool,
    },
    /// Rendezvous through a marker file on this host.
    SharedFile { path: PathBuf },
}

impl RendezvousStrategy {
    /// The kind of this strategy.
    #[must_use]
    pub const fn kind(&self) -> StrategyKind {
        match self {
            Self::DirectHandshake { .. } => StrategyKind::DirectHandshake,
            Self::ImplicitConfig => StrategyKind::ImplicitConfig,
            Self::SharedStore { .. } => StrategyKind::SharedStore,
            Self::SharedFile { .. } => StrategyKind::SharedFile,
        }
    }
}

impl fmt::Display for RendezvousStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectHandshake { coordinator } => write!(f, "direct handshake via {coordinator}"),
            Self::ImplicitConfig => write!(f, "launcher environment"),
            Self::SharedStore {
                controller,
                is_controller: true,
            } => write!(f, "shared store hosted here on {controller}"),
            Self::SharedStore { controller, .. } => write!(f, "shared store at {controller}"),
            Self::SharedFile { path } => write!(f, "shared file {}", path.display()),
        }
    }
}

/// Outcome of one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub kind: StrategyKind,
    pub error: String,
    pub error_kind: ErrorKind,
    pub elapsed: Duration,
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} error after {:.1}s): {}",
            self.kind,
            self.error_kind,
            self.elapsed.as_secs_f64(),
            self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.to_string().parse::<StrategyKind>().unwrap(), kind);
        }
        assert_eq!("env".parse::<StrategyKind>().unwrap(), StrategyKind::ImplicitConfig);
        assert!("smoke-signals".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_strategy_kind() {
        let strategy = RendezvousStrategy::SharedStore {
            controller: PeerAddress::loopback(29500),
            is_controller: false,
        };
        assert_eq!(strategy.kind(), StrategyKind::SharedStore);
        assert_eq!(strategy.to_string(), "shared store at 127.0.0.1:29500");
    }
}
