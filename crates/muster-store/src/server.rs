//! Controller-side store server.
//!
//! One task accepts connections; each connection gets its own task reading
//! commands line by line. All state lives behind a single lock, so
//! registration is serialized no matter how many participants connect at
//! once. Waiters (`get`, `roster`) park on a watch channel that is bumped on
//! every write.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use muster_net::{bind_listener, PeerAddress};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{Error, RejectKind, Result};
use crate::protocol::{member_key, Member, StoreCommand, StoreResponse};

/// Store contents.
#[derive(Debug)]
struct StoreState {
    world_size: u32,
    members: BTreeMap<u32, PeerAddress>,
    values: HashMap<String, String>,
    counters: HashMap<String, i64>,
    disbanded: BTreeSet<u32>,
}

impl StoreState {
    fn new(world_size: u32) -> Self {
        Self {
            world_size,
            members: BTreeMap::new(),
            values: HashMap::new(),
            counters: HashMap::new(),
            disbanded: BTreeSet::new(),
        }
    }

    fn registered(&self) -> u32 {
        saturating_count(self.members.len())
    }

    fn disbanded(&self) -> u32 {
        saturating_count(self.disbanded.len())
    }

    fn roster(&self) -> Option<Vec<Member>> {
        if self.registered() < self.world_size {
            return None;
        }
        Some(
            self.members
                .iter()
                .map(|(&rank, &address)| Member { rank, address })
                .collect(),
        )
    }

    fn all_disbanded(&self) -> bool {
        self.disbanded() >= self.world_size
    }
}

/// State shared between the server handle and connection tasks.
#[derive(Debug)]
struct Shared {
    state: Mutex<StoreState>,
    changed: watch::Sender<u64>,
}

impl Shared {
    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Wait until `check` yields a value or the timeout passes.
    async fn wait_for<T>(
        &self,
        timeout: Duration,
        mut check: impl FnMut(&StoreState) -> Option<T>,
    ) -> Option<T> {
        // Subscribe before looking so a write between the check and the
        // wait is not missed.
        let mut rx = self.changed.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(found) = check(&*self.state.lock().await) {
                return Some(found);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    async fn execute(&self, cmd: StoreCommand) -> StoreResponse {
        match cmd {
            StoreCommand::Hello { world_size } => {
                let expected = self.state.lock().await.world_size;
                if world_size == expected {
                    StoreResponse::Welcome { world_size }
                } else {
                    StoreResponse::reject(
                        RejectKind::WorldSizeMismatch,
                        format!("controller expects world size {expected}, participant has {world_size}"),
                    )
                }
            }

            StoreCommand::Register { rank, address } => {
                let response = {
                    let mut state = self.state.lock().await;
                    if rank >= state.world_size {
                        return StoreResponse::reject(
                            RejectKind::InvalidRank,
                            format!("rank {rank} outside 0..{}", state.world_size),
                        );
                    }
                    if let Some(existing) = state.members.get(&rank) {
                        return StoreResponse::reject(
                            RejectKind::DuplicateRank,
                            format!("rank {rank} already registered by {existing}"),
                        );
                    }
                    state.members.insert(rank, address);
                    info!(
                        rank,
                        %address,
                        registered = state.members.len(),
                        world_size = state.world_size,
                        "Member registered"
                    );
                    StoreResponse::Registered {
                        registered: state.registered(),
                        world_size: state.world_size,
                    }
                };
                self.notify();
                response
            }

            StoreCommand::Roster { timeout_ms } => {
                let timeout = Duration::from_millis(timeout_ms);
                match self.wait_for(timeout, StoreState::roster).await {
                    Some(members) => StoreResponse::Roster { members },
                    None => {
                        let state = self.state.lock().await;
                        StoreResponse::reject(
                            RejectKind::Timeout,
                            format!(
                                "only {}/{} members registered after {timeout:?}",
                                state.members.len(),
                                state.world_size
                            ),
                        )
                    }
                }
            }

            StoreCommand::Set { key, value } => {
                {
                    let mut state = self.state.lock().await;
                    if state.values.contains_key(&key) {
                        return StoreResponse::reject(
                            RejectKind::KeyExists,
                            format!("key {key:?} already set"),
                        );
                    }
                    state.values.insert(key, value);
                }
                self.notify();
                StoreResponse::Ok
            }

            StoreCommand::Get { key, timeout_ms } => {
                let timeout = Duration::from_millis(timeout_ms);
                match self
                    .wait_for(timeout, |state| state.values.get(&key).cloned())
                    .await
                {
                    Some(value) => StoreResponse::Value { value },
                    None => StoreResponse::reject(
                        RejectKind::Timeout,
                        format!("key {key:?} not set after {timeout:?}"),
                    ),
                }
            }

            StoreCommand::Add { key, delta } => {
                let value = {
                    let mut state = self.state.lock().await;
                    let counter = state.counters.entry(key).or_insert(0);
                    *counter = counter.wrapping_add(delta);
                    *counter
                };
                self.notify();
                StoreResponse::Counter { value }
            }

            StoreCommand::Check { keys } => {
                let state = self.state.lock().await;
                let present = keys.iter().all(|key| {
                    state.values.contains_key(key)
                        || state.counters.contains_key(key)
                        || key
                            .strip_prefix("member/")
                            .and_then(|rank| rank.parse::<u32>().ok())
                            .is_some_and(|rank| state.members.contains_key(&rank))
                });
                StoreResponse::Bool { value: present }
            }

            StoreCommand::Disband { rank } => {
                {
                    let mut state = self.state.lock().await;
                    if rank >= state.world_size {
                        return StoreResponse::reject(
                            RejectKind::InvalidRank,
                            format!("rank {rank} outside 0..{}", state.world_size),
                        );
                    }
                    state.disbanded.insert(rank);
                    debug!(
                        rank,
                        disbanded = state.disbanded.len(),
                        world_size = state.world_size,
                        "Member disbanded"
                    );
                }
                self.notify();
                StoreResponse::Ok
            }

            StoreCommand::Ping => StoreResponse::Pong,
        }
    }
}

/// Rendezvous store server, owned by the controller.
///
/// Dropping the server stops the listener and closes every participant
/// connection.
#[derive(Debug)]
pub struct StoreServer {
    shared: Arc<Shared>,
    local_addr: PeerAddress,
    accept_task: JoinHandle<()>,
}

impl StoreServer {
    /// Bind `bind` and start serving a group of `world_size` members.
    pub async fn spawn(bind: PeerAddress, world_size: u32) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidConfig("world size must be at least 1".into()));
        }

        let listener = bind_listener(&bind)?;
        let local_port = listener.local_addr()?.port();
        let local_addr = bind.with_port(local_port);

        let (changed, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(StoreState::new(world_size)),
            changed,
        });

        info!(%local_addr, world_size, "Rendezvous store listening");

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Store connection accepted");
                        let shared = Arc::clone(&accept_shared);
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, shared).await {
                                warn!(%peer, error = %e, "Store connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept store connection: {}", e);
                    }
                }
                while connections.try_join_next().is_some() {}
            }
        });

        Ok(Self {
            shared,
            local_addr,
            accept_task,
        })
    }

    /// The address the server is bound to (with the actual port).
    #[must_use]
    pub const fn local_addr(&self) -> PeerAddress {
        self.local_addr
    }

    /// Loopback address of this server, for a controller that is also a member.
    #[must_use]
    pub const fn loopback_addr(&self) -> PeerAddress {
        PeerAddress::loopback(self.local_addr.port())
    }

    /// Number of members registered so far.
    pub async fn registered(&self) -> u32 {
        self.shared.state.lock().await.registered()
    }

    /// Number of members that have disbanded.
    pub async fn disbanded(&self) -> u32 {
        self.shared.state.lock().await.disbanded()
    }

    /// Wait until every member has registered.
    pub async fn wait_roster(&self, timeout: Duration) -> Result<Vec<Member>> {
        self.shared
            .wait_for(timeout, StoreState::roster)
            .await
            .ok_or_else(|| Error::Timeout {
                what: "all members to register".to_string(),
                after: timeout,
            })
    }

    /// Wait until every member has disbanded.
    pub async fn wait_disbanded(&self, timeout: Duration) -> Result<()> {
        self.shared
            .wait_for(timeout, |state| state.all_disbanded().then_some(()))
            .await
            .ok_or_else(|| Error::Timeout {
                what: "all members to disband".to_string(),
                after: timeout,
            })
    }

    /// Stop serving.
    pub fn shutdown(self) {
        info!(local_addr = %self.local_addr, "Rendezvous store shutting down");
        // Drop aborts the accept task and with it every connection.
    }
}

impl Drop for StoreServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<StoreCommand>(&line) {
            Ok(cmd) => shared.execute(cmd).await,
            Err(e) => StoreResponse::reject(RejectKind::BadRequest, format!("Invalid command: {e}")),
        };

        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

/// Collection length as a wire count. Ranks stay below a `u32` world size,
/// so this only saturates on a corrupted state.
fn saturating_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8, port: u16) -> PeerAddress {
        PeerAddress::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn shared(world_size: u32) -> Shared {
        let (changed, _) = watch::channel(0);
        Shared {
            state: Mutex::new(StoreState::new(world_size)),
            changed,
        }
    }

    #[test]
    fn test_counts_saturate_instead_of_wrapping() {
        assert_eq!(saturating_count(0), 0);
        assert_eq!(saturating_count(3), 3);
        assert_eq!(saturating_count(usize::MAX), u32::MAX);

        let mut state = StoreState::new(2);
        state.members.insert(0, addr(1, 7000));
        state.disbanded.insert(0);
        assert_eq!(state.registered(), 1);
        assert_eq!(state.disbanded(), 1);
        assert!(state.roster().is_none());
        assert!(!state.all_disbanded());
    }

    #[tokio::test]
    async fn test_register_is_append_only() {
        let store = shared(2);

        let first = store
            .execute(StoreCommand::Register { rank: 1, address: addr(2, 100) })
            .await;
        assert_eq!(first, StoreResponse::Registered { registered: 1, world_size: 2 });

        let dup = store
            .execute(StoreCommand::Register { rank: 1, address: addr(3, 100) })
            .await;
        assert!(matches!(dup, StoreResponse::Error { kind: RejectKind::DuplicateRank, .. }));

        // The original entry is untouched.
        let state = store.state.lock().await;
        assert_eq!(state.members.get(&1), Some(&addr(2, 100)));
    }

    #[tokio::test]
    async fn test_rank_out_of_range_rejected() {
        let store = shared(2);
        let resp = store
            .execute(StoreCommand::Register { rank: 2, address: addr(2, 100) })
            .await;
        assert!(matches!(resp, StoreResponse::Error { kind: RejectKind::InvalidRank, .. }));
    }

    #[tokio::test]
    async fn test_set_never_overwrites() {
        let store = shared(1);
        assert_eq!(
            store
                .execute(StoreCommand::Set { key: "k".into(), value: "a".into() })
                .await,
            StoreResponse::Ok
        );
        let second = store
            .execute(StoreCommand::Set { key: "k".into(), value: "b".into() })
            .await;
        assert!(matches!(second, StoreResponse::Error { kind: RejectKind::KeyExists, .. }));

        let got = store
            .execute(StoreCommand::Get { key: "k".into(), timeout_ms: 10 })
            .await;
        assert_eq!(got, StoreResponse::Value { value: "a".into() });
    }

    #[tokio::test]
    async fn test_get_times_out_on_missing_key() {
        let store = shared(1);
        let resp = store
            .execute(StoreCommand::Get { key: "missing".into(), timeout_ms: 20 })
            .await;
        assert!(matches!(resp, StoreResponse::Error { kind: RejectKind::Timeout, .. }));
    }

    #[tokio::test]
    async fn test_hello_checks_world_size() {
        let store = shared(3);
        assert_eq!(
            store.execute(StoreCommand::Hello { world_size: 3 }).await,
            StoreResponse::Welcome { world_size: 3 }
        );
        assert!(matches!(
            store.execute(StoreCommand::Hello { world_size: 2 }).await,
            StoreResponse::Error { kind: RejectKind::WorldSizeMismatch, .. }
        ));
    }

    #[tokio::test]
    async fn test_add_and_check() {
        let store = shared(1);
        assert_eq!(
            store.execute(StoreCommand::Add { key: "c".into(), delta: 2 }).await,
            StoreResponse::Counter { value: 2 }
        );
        assert_eq!(
            store.execute(StoreCommand::Add { key: "c".into(), delta: 3 }).await,
            StoreResponse::Counter { value: 5 }
        );
        assert_eq!(
            store
                .execute(StoreCommand::Check { keys: vec!["c".into(), "member/0".into()] })
                .await,
            StoreResponse::Bool { value: false }
        );
        store
            .execute(StoreCommand::Register { rank: 0, address: addr(1, 1) })
            .await;
        assert_eq!(
            store
                .execute(StoreCommand::Check { keys: vec!["c".into(), member_key(0)] })
                .await,
            StoreResponse::Bool { value: true }
        );
    }

    #[tokio::test]
    async fn test_server_waits_for_roster_and_disband() {
        let server = StoreServer::spawn(PeerAddress::loopback(0), 2).await.unwrap();
        assert!(server.wait_roster(Duration::from_millis(20)).await.is_err());

        {
            let mut state = server.shared.state.lock().await;
            state.members.insert(1, addr(2, 1));
            state.members.insert(0, addr(1, 1));
        }
        server.shared.notify();

        let roster = server.wait_roster(Duration::from_millis(100)).await.unwrap();
        assert_eq!(roster.iter().map(|m| m.rank).collect::<Vec<_>>(), vec![0, 1]);

        server.shared.execute(StoreCommand::Disband { rank: 0 }).await;
        assert!(server.wait_disbanded(Duration::from_millis(20)).await.is_err());
        server.shared.execute(StoreCommand::Disband { rank: 1 }).await;
        server.wait_disbanded(Duration::from_millis(100)).await.unwrap();
        assert_eq!(server.disbanded().await, 2);
    }
}
