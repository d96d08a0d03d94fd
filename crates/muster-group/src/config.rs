//! Group configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Collective transport backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Rank-0 hub over TCP.
    #[default]
    Tcp,
}

/// Backend names that are recognized but not built in.
const UNAVAILABLE_BACKENDS: &[&str] = &["nccl", "mpi"];

impl Backend {
    /// Backends this build supports.
    #[must_use]
    pub const fn available() -> &'static [Backend] {
        &[Backend::Tcp]
    }

    /// Canonical name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            // gloo is the usual name for the CPU TCP backend.
            "tcp" | "gloo" => Ok(Self::Tcp),
            other => {
                let available = Self::available()
                    .iter()
                    .map(Backend::name)
                    .collect::<Vec<_>>()
                    .join(", ");
                if UNAVAILABLE_BACKENDS.contains(&other) {
                    Err(Error::BackendUnavailable {
                        name: other.to_string(),
                        available,
                    })
                } else {
                    Err(Error::InvalidConfig(format!(
                        "unknown backend {other:?} (available: {available})"
                    )))
                }
            }
        }
    }
}

/// Who hosts the rendezvous store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ControllerMode {
    /// Rank 0 hosts the store and joins the group.
    #[default]
    Member,
    /// An external process hosts the store and never joins.
    Pure,
}

impl fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Member => write!(f, "member"),
            Self::Pure => write!(f, "pure"),
        }
    }
}

impl FromStr for ControllerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "member" => Ok(Self::Member),
            "pure" => Ok(Self::Pure),
            other => Err(Error::InvalidConfig(format!(
                "unknown controller mode {other:?} (expected member or pure)"
            ))),
        }
    }
}

/// Identity of one member within a group.
///
/// `0 <= rank < world_size` holds for every constructed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    rank: u32,
    world_size: u32,

    /// Collective transport.
    /// Default: [`Backend::Tcp`].
    pub backend: Backend,

    /// Bound for joining and for each collective.
    /// Default: 60s.
    pub timeout: Duration,

    /// Whether rank 0 hosts the rendezvous store.
    /// Default: [`ControllerMode::Member`].
    pub controller_mode: ControllerMode,
}

impl GroupConfig {
    /// Create a config, checking the rank against the world size.
    pub fn new(rank: u32, world_size: u32) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidConfig("world size must be at least 1".into()));
        }
        if rank >= world_size {
            return Err(Error::InvalidConfig(format!(
                "rank {rank} outside 0..{world_size}"
            )));
        }
        Ok(Self {
            rank,
            world_size,
            backend: Backend::default(),
            timeout: Duration::from_secs(60),
            controller_mode: ControllerMode::default(),
        })
    }

    /// Set the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the join and collective timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the controller mode.
    #[must_use]
    pub fn with_controller_mode(mut self, mode: ControllerMode) -> Self {
        self.controller_mode = mode;
        self
    }

    /// This member's rank.
    #[must_use]
    pub const fn rank(&self) -> u32 {
        self.rank
    }

    /// Number of members.
    #[must_use]
    pub const fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Whether this member hosts the hub.
    #[must_use]
    pub const fn is_hub(&self) -> bool {
        self.rank == 0
    }

    /// Whether this member hosts the rendezvous store.
    #[must_use]
    pub fn is_controller(&self) -> bool {
        self.rank == 0 && self.controller_mode == ControllerMode::Member
    }
}
