//! Error types for muster-group.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Result type for muster-group operations.
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unreachable peers, refused connections, DNS and join timeouts.
    /// Recovered by retry and strategy fallback.
    Transient,
    /// Conflicting or invalid configuration. Never retried.
    Config,
    /// A participant started before its controller and gave up waiting.
    Sequencing,
    /// A collective failed mid-flight. The group is gone.
    Collective,
    /// An operation was called when the contract does not allow it.
    Usage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Config => write!(f, "configuration"),
            Self::Sequencing => write!(f, "sequencing"),
            Self::Collective => write!(f, "collective"),
            Self::Usage => write!(f, "usage"),
        }
    }
}

/// Errors that can occur while forming or using a group.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid group configuration.
    #[error("invalid group configuration: {0}")]
    InvalidConfig(String),

    /// The requested backend is not built in.
    #[error("backend {name:?} is not available (available: {available})")]
    BackendUnavailable { name: String, available: String },

    /// The hub refused this member.
    #[error("hub rejected join: {reason}")]
    JoinRejected { reason: String },

    /// A collective or teardown was called outside the joined state.
    #[error("session is {state}, not joined")]
    NotJoined { state: SessionState },

    /// Teardown was called twice.
    #[error("session already torn down")]
    AlreadyTornDown,

    /// A call argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A collective failed and the group was aborted.
    #[error("{op} failed: {reason}")]
    Collective { op: String, reason: String },

    /// The hub aborted the group.
    #[error("group aborted by hub: {reason}")]
    Aborted { reason: String },

    /// Forming the group ran out of time.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// A peer announced a frame above the size limit.
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// The validation battery found ranks with wrong results.
    #[error("validation failed on ranks {failed_ranks:?}: {detail}")]
    ValidationFailed { failed_ranks: Vec<u32>, detail: String },

    /// Addressing or probing failed.
    #[error(transparent)]
    Net(#[from] muster_net::Error),

    /// The rendezvous store failed.
    #[error(transparent)]
    Store(#[from] muster_store::Error),

    /// Frame encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::BackendUnavailable { .. } | Self::JoinRejected { .. } => {
                ErrorKind::Config
            }
            Self::NotJoined { .. } | Self::AlreadyTornDown | Self::InvalidArgument(_) => {
                ErrorKind::Usage
            }
            Self::Collective { .. }
            | Self::Aborted { .. }
            | Self::FrameTooLarge(_)
            | Self::ValidationFailed { .. } => ErrorKind::Collective,
            Self::Net(e) => ErrorKind::of_net(e),
            Self::Store(e) => ErrorKind::of_store(e),
            Self::Timeout { .. } | Self::Encoding(_) | Self::Io(_) => ErrorKind::Transient,
        }
    }

    /// Whether another attempt (or another strategy) could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Sequencing)
    }
}

impl ErrorKind {
    /// Classify an addressing or probing error.
    #[must_use]
    pub fn of_net(error: &muster_net::Error) -> Self {
        match error {
            muster_net::Error::MalformedAddress { .. } | muster_net::Error::InvalidConfig(_) => {
                Self::Config
            }
            _ => Self::Transient,
        }
    }

    /// Classify a rendezvous store error.
    #[must_use]
    pub fn of_store(error: &muster_store::Error) -> Self {
        match error {
            e if e.is_config() => Self::Config,
            // The store is only ever dialed at the controller.
            muster_store::Error::Net(muster_net::Error::Unreachable { .. }) => Self::Sequencing,
            muster_store::Error::Net(e) => Self::of_net(e),
            _ => Self::Transient,
        }
    }
}
