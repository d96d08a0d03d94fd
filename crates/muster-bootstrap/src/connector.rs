//! Connectors turn a strategy into a joined session.

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;

use muster_group::{GroupConfig, GroupSession};
use muster_net::{bind_listener, AddressResolver, PeerAddress, Prober};
use muster_store::{FileStore, RendezvousLease, StoreClient, StoreHandle, StoreServer};
use tracing::{debug, info};

use crate::config::BootstrapConfig;
use crate::error::{Error, Result};
use crate::launcher::LauncherEnv;
use crate::strategy::{RendezvousStrategy, StrategyKind};

/// Performs one rendezvous attempt.
///
/// The negotiator only sees this trait, so tests can inject failures without
/// a network.
pub trait Connector {
    /// Form the group described by `group` using `strategy`.
    fn connect(
        &self,
        strategy: &RendezvousStrategy,
        group: &GroupConfig,
    ) -> impl Future<Output = Result<GroupSession>> + Send;
}

/// Connector that talks to real sockets and files.
#[derive(Debug, Clone)]
pub struct NetworkConnector {
    launcher: LauncherEnv,
    prober: Prober,
    advertise: Option<Ipv4Addr>,
    resolver: AddressResolver,
}

impl NetworkConnector {
    /// Create a connector for `config`, with launcher values captured at
    /// process start.
    #[must_use]
    pub fn new(config: &BootstrapConfig, launcher: LauncherEnv) -> Self {
        Self {
            launcher,
            prober: Prober::new(config.probe),
            advertise: config.advertise,
            resolver: AddressResolver::default(),
        }
    }

    /// Use a custom resolver for the advertised address.
    #[must_use]
    pub fn with_resolver(mut self, resolver: AddressResolver) -> Self {
        self.resolver = resolver;
        self
    }

    async fn advertised_ip(&self) -> Ipv4Addr {
        match self.advertise {
            Some(ip) => ip,
            None => {
                let (ip, source) = self.resolver.resolve().await;
                debug!(%ip, %source, "Advertising resolved address");
                ip
            }
        }
    }

    async fn direct(&self, coordinator: PeerAddress, group: &GroupConfig) -> Result<GroupSession> {
        if group.world_size() == 1 {
            return Ok(GroupSession::solo(group.clone())?);
        }
        if group.is_hub() {
            let listener = bind_listener(&PeerAddress::unspecified(coordinator.port()))?;
            Ok(GroupSession::host(group.clone(), listener).await?)
        } else {
            Ok(GroupSession::connect(group.clone(), coordinator, &self.prober).await?)
        }
    }

    async fn implicit(&self, group: &GroupConfig) -> Result<GroupSession> {
        let launcher = &self.launcher;
        if !launcher.invalid.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "unparsable launcher variables: {}",
                launcher.invalid.join(", ")
            )));
        }
        check_consistent("RANK", launcher.rank, group.rank())?;
        check_consistent("WORLD_SIZE", launcher.world_size, group.world_size())?;

        // A lone member needs no controller.
        if group.world_size() == 1 {
            return Ok(GroupSession::solo(group.clone())?);
        }

        let (host, port) = launcher.controller().ok_or_else(|| Error::StrategyUnavailable {
            kind: StrategyKind::ImplicitConfig,
            reason: "MASTER_ADDR and MASTER_PORT are not both set".into(),
        })?;
        let controller = PeerAddress::resolve(host, port).await?;
        debug!(%controller, host, "Launcher names controller");

        self.store(controller, group.is_controller(), group).await
    }

    async fn store(&self, controller: PeerAddress, is_controller: bool, group: &GroupConfig) -> Result<GroupSession> {
        let world_size = group.world_size();
        let (server, store_addr) = if is_controller {
            let server = StoreServer::spawn(PeerAddress::unspecified(controller.port()), world_size).await?;
            let local = server.loopback_addr();
            (Some(server), local)
        } else {
            (None, controller)
        };

        let client = StoreClient::connect(store_addr, world_size, &self.prober).await?;
        let mut lease = RendezvousLease::new(group.rank(), StoreHandle::Tcp(client));
        if let Some(server) = server {
            lease = lease.with_server(server);
        }

        let ip = self.advertised_ip().await;
        self.form_group(lease, ip, group).await
    }

    async fn file(&self, path: &Path, group: &GroupConfig) -> Result<GroupSession> {
        let store = FileStore::open(path, group.rank(), group.world_size(), group.timeout).await?;
        let lease = RendezvousLease::new(group.rank(), StoreHandle::File(store));
        self.form_group(lease, Ipv4Addr::LOCALHOST, group).await
    }

    /// Register, wait for the roster and build the hub at rank 0's address.
    async fn form_group(&self, mut lease: RendezvousLease, ip: Ipv4Addr, group: &GroupConfig) -> Result<GroupSession> {
        let rank = group.rank();
        let listener = if group.is_hub() {
            Some(bind_listener(&PeerAddress::unspecified(0))?)
        } else {
            None
        };
        let port = match &listener {
            Some(listener) => listener.local_addr()?.port(),
            None => 0,
        };
        let advertised = PeerAddress::new(ip, port);

        let store = lease.handle_mut();
        store.register(rank, advertised).await?;
        let roster = store.roster(group.timeout).await?;
        info!(rank, world_size = group.world_size(), store = store.kind(), "Roster complete");

        let session = match listener {
            Some(listener) => GroupSession::host(group.clone(), listener).await?,
            None => {
                let hub = roster
                    .iter()
                    .find(|member| member.rank == 0)
                    .map(|member| member.address)
                    .ok_or_else(|| Error::InvalidConfig("roster has no rank 0".into()))?;
                GroupSession::connect(group.clone(), hub, &self.prober).await?
            }
        };
        Ok(session.with_lease(lease))
    }
}

impl Connector for NetworkConnector {
    async fn connect(&self, strategy: &RendezvousStrategy, group: &GroupConfig) -> Result<GroupSession> {
        match strategy {
            RendezvousStrategy::DirectHandshake { coordinator } => self.direct(*coordinator, group).await,
            RendezvousStrategy::ImplicitConfig => self.implicit(group).await,
            RendezvousStrategy::SharedStore {
                controller,
                is_controller,
            } => self.store(*controller, *is_controller, group).await,
            RendezvousStrategy::SharedFile { path } => self.file(path, group).await,
        }
    }
}

fn check_consistent(var: &'static str, launcher: Option<u32>, explicit: u32) -> Result<()> {
    match launcher {
        Some(value) if value != explicit => Err(Error::LauncherConflict {
            var,
            launcher: value.to_string(),
            explicit: explicit.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use muster_group::{validate, Collectives};
    use muster_net::ProbeConfig;
    use std::time::Duration;

    fn config(rank: u32, world_size: u32) -> BootstrapConfig {
        BootstrapConfig::new(rank, world_size)
            .unwrap()
            .with_advertise(Ipv4Addr::LOCALHOST)
            .with_attempt_timeout(Duration::from_secs(10))
            .with_probe(
                ProbeConfig::default()
                    .with_interval(Duration::from_millis(20))
                    .with_max_attempts(200),
            )
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn connect_all(configs: Vec<BootstrapConfig>, strategy: impl Fn(&BootstrapConfig) -> RendezvousStrategy) -> Vec<GroupSession> {
        let attempts = configs.iter().map(|config| {
            let connector = NetworkConnector::new(config, LauncherEnv::default());
            let strategy = strategy(config);
            let group = config.group_config().unwrap();
            async move { connector.connect(&strategy, &group).await }
        });
        join_all(attempts)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect()
    }

    #[tokio::test]
    async fn test_direct_handshake() {
        let coordinator = PeerAddress::loopback(free_port());
        let configs = (0..3).map(|rank| config(rank, 3)).collect();
        let mut sessions = connect_all(configs, |_| RendezvousStrategy::DirectHandshake { coordinator }).await;

        let reports = join_all(sessions.iter_mut().map(validate)).await;
        assert!(reports.into_iter().all(|r| r.unwrap().is_healthy()));
    }

    #[tokio::test]
    async fn test_shared_store_with_member_controller() {
        let controller = PeerAddress::loopback(free_port());
        let configs = (0..3).map(|rank| config(rank, 3)).collect();
        let mut sessions = connect_all(configs, |c| RendezvousStrategy::SharedStore {
            controller,
            is_controller: c.rank() == 0,
        })
        .await;

        let gathered = join_all(sessions.iter_mut().map(|s| async move {
            let rank = s.rank();
            s.all_gather(&rank).await.unwrap()
        }))
        .await;
        assert!(gathered.iter().all(|g| g == &vec![0, 1, 2]));

        // The controller waits for everyone to disband before stopping.
        let torn = join_all(sessions.iter_mut().map(|s| s.teardown())).await;
        assert!(torn.into_iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rendezvous");
        let configs = (0..3).map(|rank| config(rank, 3)).collect();
        let mut sessions = connect_all(configs, |_| RendezvousStrategy::SharedFile { path: path.clone() }).await;

        let sums = join_all(sessions.iter_mut().map(|s| async move {
            let value = s.rank() + 1;
            s.all_reduce(value, muster_group::ReduceOp::Sum).await.unwrap()
        }))
        .await;
        assert!(sums.iter().all(|&sum| sum == 6));

        join_all(sessions.iter_mut().map(|s| s.teardown())).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_implicit_without_launcher_values_fails_over() {
        let config = config(1, 2);
        let connector = NetworkConnector::new(&config, LauncherEnv::default());
        let err = connector
            .connect(&RendezvousStrategy::ImplicitConfig, &config.group_config().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StrategyUnavailable { .. }));
        assert!(err.kind() != muster_group::ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_implicit_single_member_needs_no_launcher() {
        let config = config(0, 1);
        let connector = NetworkConnector::new(&config, LauncherEnv::default());
        let mut session = connector
            .connect(&RendezvousStrategy::ImplicitConfig, &config.group_config().unwrap())
            .await
            .unwrap();
        assert_eq!(session.world_size(), 1);
        assert!(validate(&mut session).await.unwrap().is_healthy());
        session.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_implicit_conflict_is_config_error() {
        let config = config(1, 2);
        let launcher = LauncherEnv::from_pairs([
            ("MASTER_ADDR", "127.0.0.1"),
            ("MASTER_PORT", "29500"),
            ("WORLD_SIZE", "4"),
        ]);
        let connector = NetworkConnector::new(&config, launcher);
        let err = connector
            .connect(&RendezvousStrategy::ImplicitConfig, &config.group_config().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LauncherConflict { var: "WORLD_SIZE", .. }));
        assert_eq!(err.kind(), muster_group::ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_implicit_uses_launcher_controller() {
        let port = free_port();
        let pairs = |rank: &str| {
            LauncherEnv::from_pairs([
                ("MASTER_ADDR", "127.0.0.1".to_string()),
                ("MASTER_PORT", port.to_string()),
                ("RANK", rank.to_string()),
                ("WORLD_SIZE", "2".to_string()),
            ])
        };

        let attempts = (0..2u32).map(|rank| {
            let config = config(rank, 2);
            let connector = NetworkConnector::new(&config, pairs(&rank.to_string()));
            let group = config.group_config().unwrap();
            async move { connector.connect(&RendezvousStrategy::ImplicitConfig, &group).await }
        });
        let sessions = join_all(attempts).await;
        assert!(sessions.iter().all(Result::is_ok));
    }
}
