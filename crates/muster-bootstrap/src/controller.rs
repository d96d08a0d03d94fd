//! Pure controller: hosts the rendezvous store without joining the group.

use std::time::Duration;

use muster_net::PeerAddress;
use muster_store::{Member, StoreServer};
use tracing::{info, warn};

use crate::error::Result;

/// Wait between progress logs while no disband bound is set.
const IDLE_LOG_INTERVAL: Duration = Duration::from_secs(3600);

/// A controller that hosts the store for members running in
/// [`ControllerMode::Pure`](muster_group::ControllerMode::Pure).
///
/// It must start before any participant and outlive every join.
#[derive(Debug)]
pub struct PureController {
    server: StoreServer,
    world_size: u32,
}

impl PureController {
    /// Bind the store on `bind` for a group of `world_size`.
    pub async fn start(bind: PeerAddress, world_size: u32) -> Result<Self> {
        let server = StoreServer::spawn(bind, world_size).await?;
        info!(local_addr = %server.local_addr(), world_size, "Pure controller started");
        Ok(Self { server, world_size })
    }

    /// Address the store is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> PeerAddress {
        self.server.local_addr()
    }

    /// Serve until every member has joined and disbanded, then stop.
    ///
    /// `disband_timeout` of `None` waits for the group indefinitely.
    pub async fn run(self, join_timeout: Duration, disband_timeout: Option<Duration>) -> Result<Vec<Member>> {
        let roster = self.server.wait_roster(join_timeout).await?;
        info!(world_size = self.world_size, "All members registered");
        for member in &roster {
            info!(rank = member.rank, address = %member.address, "Member");
        }

        match disband_timeout {
            Some(timeout) => self.server.wait_disbanded(timeout).await?,
            None => loop {
                match self.server.wait_disbanded(IDLE_LOG_INTERVAL).await {
                    Ok(()) => break,
                    Err(_) => {
                        let disbanded = self.server.disbanded().await;
                        warn!(disbanded, world_size = self.world_size, "Group still running");
                    }
                }
            },
        }

        info!(world_size = self.world_size, "All members disbanded");
        self.server.shutdown();
        Ok(roster)
    }
}
