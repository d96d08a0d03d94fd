//! Loopback groups for tests.

use std::time::Duration;

use futures::future::join_all;
use muster_net::{bind_listener, PeerAddress, ProbeConfig, Prober};

use crate::config::GroupConfig;
use crate::session::GroupSession;

pub(crate) fn fast_prober() -> Prober {
    Prober::new(
        ProbeConfig::default()
            .with_interval(Duration::from_millis(20))
            .with_attempt_timeout(Duration::from_millis(200))
            .with_max_attempts(100),
    )
}

/// Form a group of `world_size` sessions on loopback, ordered by rank.
pub(crate) async fn loopback_group(world_size: u32) -> Vec<GroupSession> {
    let timeout = Duration::from_secs(10);
    let config = |rank| {
        GroupConfig::new(rank, world_size)
            .unwrap()
            .with_timeout(timeout)
    };

    if world_size == 1 {
        return vec![GroupSession::solo(config(0)).unwrap()];
    }

    let listener = bind_listener(&PeerAddress::loopback(0)).unwrap();
    let hub_addr = PeerAddress::loopback(listener.local_addr().unwrap().port());
    let prober = fast_prober();

    let (hub, spokes) = tokio::join!(
        GroupSession::host(config(0), listener),
        join_all((1..world_size).map(|rank| GroupSession::connect(config(rank), hub_addr, &prober)))
    );

    let mut sessions = vec![hub.unwrap()];
    sessions.extend(spokes.into_iter().map(Result::unwrap));
    sessions
}
