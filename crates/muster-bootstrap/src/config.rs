//! Bootstrap configuration.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use muster_group::{Backend, ControllerMode, GroupConfig};
use muster_net::{PeerAddress, ProbeConfig};

use crate::error::{Error, Result};
use crate::launcher::LauncherEnv;
use crate::strategy::{RendezvousStrategy, StrategyKind};

/// Everything a member needs to bootstrap. Built once, passed by reference.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    rank: u32,
    world_size: u32,

    /// Collective backend.
    /// Default: [`Backend::Tcp`].
    pub backend: Backend,

    /// Whether rank 0 hosts the store or an external controller does.
    /// Default: [`ControllerMode::Member`].
    pub controller_mode: ControllerMode,

    /// Address rank 0 listens on for a direct handshake.
    pub coordinator: Option<PeerAddress>,

    /// Address of the rendezvous store.
    pub controller: Option<PeerAddress>,

    /// Marker file for single-host rendezvous.
    pub rendezvous_file: Option<PathBuf>,

    /// Address other members should use to reach this one.
    /// Default: resolved from the routing table.
    pub advertise: Option<Ipv4Addr>,

    /// Bound for each strategy attempt, and for each collective afterwards.
    /// Default: 30s.
    pub attempt_timeout: Duration,

    /// How hard to poll a controller or hub before giving up.
    pub probe: ProbeConfig,

    /// Strategy order. `None` uses the default order, skipping strategies
    /// without the parameters they need.
    pub strategies: Option<Vec<StrategyKind>>,
}

impl BootstrapConfig {
    /// Create a config for `rank` of `world_size`.
    pub fn new(rank: u32, world_size: u32) -> Result<Self> {
        // Reuse the group's range checks.
        GroupConfig::new(rank, world_size)?;
        Ok(Self {
            rank,
            world_size,
            backend: Backend::default(),
            controller_mode: ControllerMode::default(),
            coordinator: None,
            controller: None,
            rendezvous_file: None,
            advertise: None,
            attempt_timeout: Duration::from_secs(30),
            probe: ProbeConfig::default(),
            strategies: None,
        })
    }

    /// Create a config from explicit values, falling back to the launcher's
    /// `RANK` and `WORLD_SIZE`.
    pub fn from_launcher(rank: Option<u32>, world_size: Option<u32>, launcher: &LauncherEnv) -> Result<Self> {
        let world_size = world_size.or(launcher.world_size).ok_or_else(|| {
            Error::InvalidConfig("world size not given and WORLD_SIZE not set".into())
        })?;
        let rank = match rank.or(launcher.rank) {
            Some(rank) => rank,
            None if world_size == 1 => 0,
            None => return Err(Error::InvalidConfig("rank not given and RANK not set".into())),
        };
        Self::new(rank, world_size)
    }

    /// Set the backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the controller mode.
    #[must_use]
    pub fn with_controller_mode(mut self, mode: ControllerMode) -> Self {
        self.controller_mode = mode;
        self
    }

    /// Set the coordinator address for a direct handshake.
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: PeerAddress) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Set the rendezvous store address.
    #[must_use]
    pub fn with_controller(mut self, controller: PeerAddress) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Set the rendezvous marker file.
    #[must_use]
    pub fn with_rendezvous_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rendezvous_file = Some(path.into());
        self
    }

    /// Set the advertised address.
    #[must_use]
    pub fn with_advertise(mut self, ip: Ipv4Addr) -> Self {
        self.advertise = Some(ip);
        self
    }

    /// Set the per-attempt bound.
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set the probe configuration.
    #[must_use]
    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    /// Set the strategy order.
    #[must_use]
    pub fn with_strategies(mut self, strategies: Vec<StrategyKind>) -> Self {
        self.strategies = Some(strategies);
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

    /// The group identity handed to every strategy.
    pub fn group_config(&self) -> Result<GroupConfig> {
        Ok(GroupConfig::new(self.rank, self.world_size)?
            .with_backend(self.backend)
            .with_timeout(self.attempt_timeout)
            .with_controller_mode(self.controller_mode))
    }

    /// Strategies to attempt, in order.
    ///
    /// With the default order, strategies missing their parameters are left
    /// out. An explicitly requested strategy missing its parameters is a
    /// configuration error.
    pub fn plan(&self) -> Result<Vec<RendezvousStrategy>> {
        self.probe.validate()?;
        let is_controller = self.rank == 0 && self.controller_mode == ControllerMode::Member;

        let build = |kind: StrategyKind| -> Option<RendezvousStrategy> {
            match kind {
                StrategyKind::DirectHandshake => self
                    .coordinator
                    .map(|coordinator| RendezvousStrategy::DirectHandshake { coordinator }),
                StrategyKind::ImplicitConfig => Some(RendezvousStrategy::ImplicitConfig),
                StrategyKind::SharedStore => self.controller.map(|controller| {
                    RendezvousStrategy::SharedStore {
                        controller,
                        is_controller,
                    }
                }),
                StrategyKind::SharedFile => self
                    .rendezvous_file
                    .clone()
                    .map(|path| RendezvousStrategy::SharedFile { path }),
            }
        };

        match &self.strategies {
            None => Ok(StrategyKind::ALL.into_iter().filter_map(build).collect()),
            Some(kinds) => {
                let mut plan = Vec::with_capacity(kinds.len());
                for &kind in kinds {
                    if plan.iter().any(|s: &RendezvousStrategy| s.kind() == kind) {
                        return Err(Error::InvalidConfig(format!("strategy {kind} listed twice")));
                    }
                    let strategy = build(kind).ok_or_else(|| {
                        Error::InvalidConfig(format!("strategy {kind} requested but {} not set", needs(kind)))
                    })?;
                    plan.push(strategy);
                }
                Ok(plan)
            }
        }
    }
}

fn needs(kind: StrategyKind) -> &'static str {
    match kind {
        StrategyKind::DirectHandshake => "the coordinator address",
        StrategyKind::ImplicitConfig => "nothing",
        StrategyKind::SharedStore => "the controller address",
        StrategyKind::SharedFile => "the rendezvous file",
    }
}

/// Turn `host:port` into an address, resolving a hostname if needed.
pub async fn resolve_endpoint(input: &str) -> Result<PeerAddress> {
    if let Ok(address) = PeerAddress::parse(input) {
        return Ok(address);
    }
    let (host, port) = input.trim().rsplit_once(':').ok_or_else(|| {
        Error::InvalidConfig(format!("{input:?} is not host:port"))
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{input:?} has no valid port")))?;
    Ok(PeerAddress::resolve(host, port).await?)
}
