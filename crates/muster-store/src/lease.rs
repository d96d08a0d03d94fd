//! Rendezvous lease: what a member keeps from the store after the group forms.

use std::time::Duration;

use muster_net::PeerAddress;
use tracing::{debug, info, warn};

use crate::client::StoreClient;
use crate::error::Result;
use crate::file::FileStore;
use crate::protocol::Member;
use crate::server::StoreServer;

/// Either kind of rendezvous store.
#[derive(Debug)]
pub enum StoreHandle {
    /// Controller-hosted TCP store.
    Tcp(StoreClient),
    /// Marker file on the local host.
    File(FileStore),
}

impl StoreHandle {
    /// Register `rank` at `address`.
    pub async fn register(&mut self, rank: u32, address: PeerAddress) -> Result<()> {
        match self {
            Self::Tcp(client) => client.register(rank, address).await.map(|_| ()),
            Self::File(file) => file.register(rank, address).await,
        }
    }

    /// Wait until every rank is registered.
    pub async fn roster(&mut self, timeout: Duration) -> Result<Vec<Member>> {
        match self {
            Self::Tcp(client) => client.roster(timeout).await,
            Self::File(file) => file.roster(timeout).await,
        }
    }

    /// Store `value` under a new `key`.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match self {
            Self::Tcp(client) => client.set(key, value).await,
            Self::File(file) => file.set(key, value).await,
        }
    }

    /// Wait for `key` and return its value.
    pub async fn get(&mut self, key: &str, timeout: Duration) -> Result<String> {
        match self {
            Self::Tcp(client) => client.get(key, timeout).await,
            Self::File(file) => file.get(key, timeout).await,
        }
    }

    /// Announce that `rank` has left.
    pub async fn disband(&mut self, rank: u32) -> Result<()> {
        match self {
            Self::Tcp(client) => client.disband(rank).await,
            Self::File(file) => file.disband(rank).await,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::File(_) => "file",
        }
    }
}

/// Store resources held by a group member for the lifetime of its session.
///
/// On release the member disbands. The owner of the store (the controller
/// that hosts the server, or the creator of the marker file) additionally
/// waits until every member has disbanded before tearing the store down, so
/// no participant loses its store while still leaving.
#[derive(Debug)]
pub struct RendezvousLease {
    rank: u32,
    handle: StoreHandle,
    server: Option<StoreServer>,
}

impl RendezvousLease {
    /// Lease over a store this member does not host.
    #[must_use]
    pub const fn new(rank: u32, handle: StoreHandle) -> Self {
        Self {
            rank,
            handle,
            server: None,
        }
    }

    /// Lease that also owns the store server.
    #[must_use]
    pub fn with_server(mut self, server: StoreServer) -> Self {
        self.server = Some(server);
        self
    }

    /// The member rank this lease belongs to.
    #[must_use]
    pub const fn rank(&self) -> u32 {
        self.rank
    }

    /// The underlying store.
    pub fn handle_mut(&mut self) -> &mut StoreHandle {
        &mut self.handle
    }

    /// Whether this member owns the store's lifetime.
    #[must_use]
    pub fn owns_store(&self) -> bool {
        match &self.handle {
            StoreHandle::File(file) => file.is_creator(),
            StoreHandle::Tcp(_) => self.server.is_some(),
        }
    }

    /// Disband and, as owner, wait up to `timeout` for everyone else before
    /// tearing the store down.
    ///
    /// Teardown always runs to completion; the first failure is returned.
    pub async fn release(mut self, timeout: Duration) -> Result<()> {
        let rank = self.rank;
        let owns_store = self.owns_store();
        let mut first_error = None;

        if let Err(e) = self.handle.disband(rank).await {
            warn!(rank, error = %e, "Failed to disband from rendezvous store");
            first_error.get_or_insert(e);
        }

        if owns_store {
            debug!(rank, store = self.handle.kind(), ?timeout, "Waiting for all members to disband");
            let waited = match (&mut self.handle, &self.server) {
                (_, Some(server)) => server.wait_disbanded(timeout).await,
                (StoreHandle::File(file), None) => file.wait_disbanded(timeout).await,
                (StoreHandle::Tcp(_), None) => Ok(()),
            };
            if let Err(e) = waited {
                warn!(rank, error = %e, "Not every member disbanded, tearing down anyway");
                first_error.get_or_insert(e);
            }

            if let StoreHandle::File(file) = &mut self.handle {
                if let Err(e) = file.remove_marker().await {
                    warn!(rank, error = %e, "Failed to remove rendezvous marker");
                    first_error.get_or_insert(e);
                }
            }
            if let Some(server) = self.server.take() {
                server.shutdown();
            }
        }

        info!(rank, store = self.handle.kind(), "Rendezvous lease released");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_net::{ProbeConfig, Prober};

    fn prober() -> Prober {
        Prober::new(
            ProbeConfig::default()
                .with_interval(Duration::from_millis(50))
                .with_max_attempts(20),
        )
    }

    #[tokio::test]
    async fn test_owner_waits_for_every_disband() {
        let server = StoreServer::spawn(PeerAddress::loopback(0), 2).await.unwrap();
        let controller = server.local_addr();

        let owner_client = StoreClient::connect(controller, 2, &prober()).await.unwrap();
        let member_client = StoreClient::connect(controller, 2, &prober()).await.unwrap();

        let owner = RendezvousLease::new(0, StoreHandle::Tcp(owner_client)).with_server(server);
        let member = RendezvousLease::new(1, StoreHandle::Tcp(member_client));
        assert!(owner.owns_store());
        assert!(!member.owns_store());

        let (owner_done, member_done) = tokio::join!(owner.release(Duration::from_secs(2)), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            member.release(Duration::from_secs(2)).await
        });
        owner_done.unwrap();
        member_done.unwrap();
    }

    #[tokio::test]
    async fn test_owner_gives_up_after_timeout() {
        let server = StoreServer::spawn(PeerAddress::loopback(0), 2).await.unwrap();
        let client = StoreClient::connect(server.local_addr(), 2, &prober()).await.unwrap();
        let owner = RendezvousLease::new(0, StoreHandle::Tcp(client)).with_server(server);

        let err = owner.release(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, crate::Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_file_lease_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marker");
        let wait = Duration::from_secs(2);

        let creator = FileStore::open(&path, 0, 2, wait).await.unwrap();
        let joiner = FileStore::open(&path, 1, 2, wait).await.unwrap();
        let owner = RendezvousLease::new(0, StoreHandle::File(creator));
        let member = RendezvousLease::new(1, StoreHandle::File(joiner));

        member.release(wait).await.unwrap();
        assert!(path.exists());
        owner.release(wait).await.unwrap();
        assert!(!path.exists());
    }
}
