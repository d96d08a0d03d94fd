//! Error types for muster-store.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for muster-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why the store refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    /// The rank is already registered by another participant.
    DuplicateRank,
    /// The rank is outside `0..world_size`.
    InvalidRank,
    /// The key already holds a value.
    KeyExists,
    /// The participant and the controller disagree on the world size.
    WorldSizeMismatch,
    /// A wait ran out of time on the controller side.
    Timeout,
    /// The request could not be parsed.
    BadRequest,
}

impl std::fmt::Display for RejectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DuplicateRank => "duplicate rank",
            Self::InvalidRank => "invalid rank",
            Self::KeyExists => "key exists",
            Self::WorldSizeMismatch => "world size mismatch",
            Self::Timeout => "timeout",
            Self::BadRequest => "bad request",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in rendezvous store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Reaching the controller failed.
    #[error(transparent)]
    Net(#[from] muster_net::Error),

    /// The store refused the request.
    #[error("store rejected request ({kind}): {message}")]
    Rejected { kind: RejectKind, message: String },

    /// Waiting for a key, the roster or disbanding ran out of time.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// The connection to the controller closed.
    #[error("controller connection closed")]
    Disconnected,

    /// The controller answered with something that does not fit the request.
    #[error("unexpected store response: {0}")]
    UnexpectedResponse(String),

    /// The rendezvous marker file is unusable.
    #[error("rendezvous marker {path}: {reason}")]
    Marker { path: String, reason: String },

    /// Invalid store configuration.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure comes from conflicting configuration between
    /// processes rather than from the network.
    #[must_use]
    pub fn is_config(&self) -> bool {
        match self {
            Self::Rejected { kind, .. } => matches!(
                kind,
                RejectKind::DuplicateRank | RejectKind::InvalidRank | RejectKind::WorldSizeMismatch
            ),
            Self::InvalidConfig(_) => true,
            Self::Net(e) => matches!(e, muster_net::Error::MalformedAddress { .. } | muster_net::Error::InvalidConfig(_)),
            _ => false,
        }
    }
}
