//! Error types for muster-bootstrap.

use std::time::Duration;

use muster_group::ErrorKind;
use thiserror::Error;

use crate::diagnosis::Diagnosis;
use crate::strategy::StrategyKind;

/// Result type for muster-bootstrap operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during bootstrap.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid bootstrap configuration.
    #[error("invalid bootstrap configuration: {0}")]
    InvalidConfig(String),

    /// A launcher variable contradicts the explicit configuration.
    #[error("launcher sets {var}={launcher} but configuration says {explicit}")]
    LauncherConflict {
        var: &'static str,
        launcher: String,
        explicit: String,
    },

    /// The strategy lacks what it needs on this host; try the next one.
    #[error("{kind} strategy unavailable: {reason}")]
    StrategyUnavailable { kind: StrategyKind, reason: String },

    /// A strategy did not finish within the per-attempt bound.
    #[error("{kind} strategy did not finish within {after:?}")]
    AttemptTimeout { kind: StrategyKind, after: Duration },

    /// `negotiate` was called a second time.
    #[error("negotiator already ran; build a new one to retry")]
    AlreadyNegotiated,

    /// A strategy raised a configuration error; nothing else was tried.
    #[error("bootstrap aborted on configuration error\n{0}")]
    Aborted(Box<Diagnosis>),

    /// Every strategy failed.
    #[error("all rendezvous strategies failed\n{0}")]
    Exhausted(Box<Diagnosis>),

    /// Group formation or use failed.
    #[error(transparent)]
    Group(#[from] muster_group::Error),

    /// The rendezvous store failed.
    #[error(transparent)]
    Store(#[from] muster_store::Error),

    /// Addressing or probing failed.
    #[error(transparent)]
    Net(#[from] muster_net::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::LauncherConflict { .. } | Self::Aborted(_) => {
                ErrorKind::Config
            }
            Self::StrategyUnavailable { .. } | Self::AttemptTimeout { .. } | Self::Io(_) => {
                ErrorKind::Transient
            }
            Self::AlreadyNegotiated => ErrorKind::Usage,
            Self::Exhausted(diagnosis) => diagnosis.kind,
            Self::Group(e) => e.kind(),
            Self::Store(e) => ErrorKind::of_store(e),
            Self::Net(e) => ErrorKind::of_net(e),
        }
    }

    /// The diagnosis carried by a fatal negotiation error.
    #[must_use]
    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        match self {
            Self::Aborted(diagnosis) | Self::Exhausted(diagnosis) => Some(diagnosis),
            _ => None,
        }
    }
}
