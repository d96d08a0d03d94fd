//! Error types for muster-net.

use std::time::Duration;

use thiserror::Error;

/// Result type for muster-net operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while addressing or probing peers.
#[derive(Debug, Error)]
pub enum Error {
    /// The address is not an `IPv4:port` literal, or cannot be probed.
    #[error("malformed address {input:?}: {reason}")]
    MalformedAddress { input: String, reason: String },

    /// A hostname did not resolve to any IPv4 address.
    #[error("could not resolve {host:?}: {reason}")]
    Resolution { host: String, reason: String },

    /// The target never accepted a connection within the attempt budget.
    #[error("{address} unreachable after {attempts} attempts in {elapsed:?} (last error: {last_error})")]
    Unreachable {
        address: String,
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },

    /// Invalid prober configuration.
    #[error("invalid probe configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying later (or with another strategy) could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Resolution { .. } | Self::Unreachable { .. } | Self::Io(_)
        )
    }
}
