//! Participant-side store client.

use std::time::Duration;

use muster_net::{PeerAddress, Prober};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{Member, StoreCommand, StoreResponse};

/// Slack on top of a server-side wait before the client gives up on a reply.
const IO_GRACE: Duration = Duration::from_secs(10);

/// Connection to the controller's store.
///
/// Requests are strictly one at a time. A request that times out on the
/// client side leaves the connection in an unknown state, so every later
/// request fails with [`Error::Disconnected`].
#[derive(Debug)]
pub struct StoreClient {
    controller: PeerAddress,
    world_size: u32,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    poisoned: bool,
}

impl StoreClient {
    /// Connect to the controller, retrying through `prober` until it listens,
    /// and confirm both sides agree on the world size.
    pub async fn connect(controller: PeerAddress, world_size: u32, prober: &Prober) -> Result<Self> {
        let (stream, probe) = prober.connect(&controller).await?;
        debug!(
            %controller,
            attempts = probe.attempts,
            elapsed = ?probe.duration,
            "Connected to rendezvous store"
        );

        let (reader, writer) = stream.into_split();
        let mut client = Self {
            controller,
            world_size,
            reader: BufReader::new(reader),
            writer,
            poisoned: false,
        };

        match client.request(StoreCommand::Hello { world_size }, Duration::ZERO).await? {
            StoreResponse::Welcome { .. } => {
                info!(%controller, world_size, "Joined rendezvous store");
                Ok(client)
            }
            other => Err(unexpected("hello", &other)),
        }
    }

    /// The controller this client talks to.
    #[must_use]
    pub const fn controller(&self) -> PeerAddress {
        self.controller
    }

    /// The world size confirmed at handshake.
    #[must_use]
    pub const fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Register `rank` at `address`. Returns how many members are registered.
    pub async fn register(&mut self, rank: u32, address: PeerAddress) -> Result<u32> {
        match self
            .request(StoreCommand::Register { rank, address }, Duration::ZERO)
            .await?
        {
            StoreResponse::Registered { registered, .. } => Ok(registered),
            other => Err(unexpected("register", &other)),
        }
    }

    /// Wait until every rank is registered; members come back ordered by rank.
    pub async fn roster(&mut self, timeout: Duration) -> Result<Vec<Member>> {
        let cmd = StoreCommand::Roster {
            timeout_ms: millis(timeout),
        };
        match self.request(cmd, timeout).await? {
            StoreResponse::Roster { members } => Ok(members),
            other => Err(unexpected("roster", &other)),
        }
    }

    /// Store `value` under a new `key`.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let cmd = StoreCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.request(cmd, Duration::ZERO).await? {
            StoreResponse::Ok => Ok(()),
            other => Err(unexpected("set", &other)),
        }
    }

    /// Wait for `key` to be set and return its value.
    pub async fn get(&mut self, key: &str, timeout: Duration) -> Result<String> {
        let cmd = StoreCommand::Get {
            key: key.to_string(),
            timeout_ms: millis(timeout),
        };
        match self.request(cmd, timeout).await? {
            StoreResponse::Value { value } => Ok(value),
            other => Err(unexpected("get", &other)),
        }
    }

    /// Add `delta` to a counter and return the new value.
    pub async fn add(&mut self, key: &str, delta: i64) -> Result<i64> {
        let cmd = StoreCommand::Add {
            key: key.to_string(),
            delta,
        };
        match self.request(cmd, Duration::ZERO).await? {
            StoreResponse::Counter { value } => Ok(value),
            other => Err(unexpected("add", &other)),
        }
    }

    /// Whether every key in `keys` is present.
    pub async fn check(&mut self, keys: &[&str]) -> Result<bool> {
        let cmd = StoreCommand::Check {
            keys: keys.iter().map(|k| (*k).to_string()).collect(),
        };
        match self.request(cmd, Duration::ZERO).await? {
            StoreResponse::Bool { value } => Ok(value),
            other => Err(unexpected("check", &other)),
        }
    }

    /// Announce that `rank` has left the group.
    pub async fn disband(&mut self, rank: u32) -> Result<()> {
        match self.request(StoreCommand::Disband { rank }, Duration::ZERO).await? {
            StoreResponse::Ok => Ok(()),
            other => Err(unexpected("disband", &other)),
        }
    }

    /// Health check.
    pub async fn ping(&mut self) -> Result<()> {
        match self.request(StoreCommand::Ping, Duration::ZERO).await? {
            StoreResponse::Pong => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Send one command and read one response line.
    ///
    /// `wait` is how long the server may legitimately hold the request.
    async fn request(&mut self, cmd: StoreCommand, wait: Duration) -> Result<StoreResponse> {
        if self.poisoned {
            return Err(Error::Disconnected);
        }

        let bound = wait + IO_GRACE;
        let outcome = tokio::time::timeout(bound, self.exchange(&cmd)).await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.poisoned = true;
                return Err(e);
            }
            Err(_) => {
                self.poisoned = true;
                return Err(Error::Timeout {
                    what: format!("controller {} to answer", self.controller),
                    after: bound,
                });
            }
        };

        match response {
            StoreResponse::Error { kind, error } => Err(Error::Rejected {
                kind,
                message: error,
            }),
            other => Ok(other),
        }
    }

    async fn exchange(&mut self, cmd: &StoreCommand) -> Result<StoreResponse> {
        let line = serde_json::to_string(cmd)? + "\n";
        self.writer.write_all(line.as_bytes()).await?;

        let mut response = String::new();
        if self.reader.read_line(&mut response).await? == 0 {
            return Err(Error::Disconnected);
        }
        Ok(serde_json::from_str(&response)?)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn unexpected(op: &str, response: &StoreResponse) -> Error {
    Error::UnexpectedResponse(format!("{op}: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectKind;
    use crate::server::StoreServer;
    use muster_net::ProbeConfig;

    fn fast_prober() -> Prober {
        Prober::new(
            ProbeConfig::default()
                .with_interval(Duration::from_millis(50))
                .with_attempt_timeout(Duration::from_millis(200))
                .with_max_attempts(20),
        )
    }

    async fn server(world_size: u32) -> StoreServer {
        StoreServer::spawn(PeerAddress::loopback(0), world_size)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_roster() {
        let server = server(2).await;
        let prober = fast_prober();

        let mut a = StoreClient::connect(server.local_addr(), 2, &prober).await.unwrap();
        let mut b = StoreClient::connect(server.local_addr(), 2, &prober).await.unwrap();

        assert_eq!(a.register(1, PeerAddress::loopback(7001)).await.unwrap(), 1);

        // Roster is not complete yet.
        let early = a.roster(Duration::from_millis(50)).await;
        assert!(matches!(
            early,
            Err(Error::Rejected { kind: RejectKind::Timeout, .. })
        ));

        assert_eq!(b.register(0, PeerAddress::loopback(7000)).await.unwrap(), 2);

        let roster = a.roster(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            roster,
            vec![
                Member { rank: 0, address: PeerAddress::loopback(7000) },
                Member { rank: 1, address: PeerAddress::loopback(7001) },
            ]
        );
        assert_eq!(b.roster(Duration::from_secs(1)).await.unwrap(), roster);
        assert_eq!(server.registered().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_rank_is_config_error() {
        let server = server(2).await;
        let prober = fast_prober();
        let mut a = StoreClient::connect(server.local_addr(), 2, &prober).await.unwrap();
        let mut b = StoreClient::connect(server.local_addr(), 2, &prober).await.unwrap();

        a.register(0, PeerAddress::loopback(7000)).await.unwrap();
        let err = b.register(0, PeerAddress::loopback(7001)).await.unwrap_err();
        assert!(err.is_config());
        assert!(matches!(err, Error::Rejected { kind: RejectKind::DuplicateRank, .. }));
    }

    #[tokio::test]
    async fn test_world_size_mismatch_on_connect() {
        let server = server(2).await;
        let err = StoreClient::connect(server.local_addr(), 3, &fast_prober())
            .await
            .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_get_waits_for_set() {
        let server = server(1).await;
        let prober = fast_prober();
        let mut reader = StoreClient::connect(server.local_addr(), 1, &prober).await.unwrap();
        let mut writer = StoreClient::connect(server.local_addr(), 1, &prober).await.unwrap();

        let (got, set) = tokio::join!(reader.get("hub", Duration::from_secs(2)), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.set("hub", "127.0.0.1:9000").await
        });
        set.unwrap();
        assert_eq!(got.unwrap(), "127.0.0.1:9000");

        let overwrite = writer.set("hub", "127.0.0.1:9001").await.unwrap_err();
        assert!(matches!(overwrite, Error::Rejected { kind: RejectKind::KeyExists, .. }));
        assert!(writer.check(&["hub"]).await.unwrap());
        assert!(!writer.check(&["hub", "other"]).await.unwrap());
    }

    #[tokio::test]
    async fn test_counter_and_ping() {
        let server = server(1).await;
        let mut client = StoreClient::connect(server.local_addr(), 1, &fast_prober())
            .await
            .unwrap();
        client.ping().await.unwrap();
        assert_eq!(client.add("arrivals", 1).await.unwrap(), 1);
        assert_eq!(client.add("arrivals", 1).await.unwrap(), 2);
        assert_eq!(client.add("arrivals", -2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_participant_started_before_controller() {
        // Reserve a port, then start the controller on it a little later.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let controller = PeerAddress::loopback(port);

        let late_server = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            StoreServer::spawn(controller, 1).await.unwrap()
        };
        let prober = fast_prober();
        let (server, client) = tokio::join!(late_server, StoreClient::connect(controller, 1, &prober));
        let mut client = client.unwrap();
        client.register(0, PeerAddress::loopback(7000)).await.unwrap();
        assert_eq!(server.registered().await, 1);
    }

    #[tokio::test]
    async fn test_controller_never_started() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let prober = Prober::new(
            ProbeConfig::default()
                .with_interval(Duration::from_millis(20))
                .with_max_attempts(3),
        );
        let err = StoreClient::connect(PeerAddress::loopback(port), 1, &prober)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Net(muster_net::Error::Unreachable { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_disconnect_after_shutdown() {
        let server = server(1).await;
        let mut client = StoreClient::connect(server.local_addr(), 1, &fast_prober())
            .await
            .unwrap();
        server.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(client.ping().await.is_err());
        assert!(matches!(client.ping().await, Err(Error::Disconnected)));
    }
}
