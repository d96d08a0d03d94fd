//! Group Session - a joined member and its collectives.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use muster_net::{PeerAddress, Prober};
use muster_store::RendezvousLease;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::GroupConfig;
use crate::error::{Error, Result};
use crate::reduce::{fold, Reduce};
use crate::wire::{decode, encode, read_frame, write_frame, Frame, OpCode, ReduceOp};

/// How long the hub waits for a freshly accepted link to say hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound for best-effort notifications (`Abort`, `Goodbye`).
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Values that can travel through a collective.
pub trait Wire: Serialize + DeserializeOwned + Send + Sync {}

impl<T: Serialize + DeserializeOwned + Send + Sync> Wire for T {}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Collectives may be called.
    Joined,
    /// A collective failed; the group is gone.
    Failed,
    /// Resources were released.
    TornDown,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Joined => write!(f, "Joined"),
            Self::Failed => write!(f, "Failed"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

/// Group-wide operations. Each call completes only once every member has
/// made the same call.
pub trait Collectives {
    /// This member's rank.
    fn rank(&self) -> u32;

    /// Number of members.
    fn world_size(&self) -> u32;

    /// Wait until every member arrives.
    fn barrier(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Replace `buffer` with the source's buffer. The source's buffer is
    /// left untouched.
    fn broadcast<T: Wire>(
        &mut self,
        buffer: &mut T,
        source: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Every member's value, ordered by rank.
    fn all_gather<T: Wire>(&mut self, value: &T) -> impl Future<Output = Result<Vec<T>>> + Send;

    /// Every member's value reduced with `op` in rank order.
    fn all_reduce<T: Wire + Reduce>(
        &mut self,
        value: T,
        op: ReduceOp,
    ) -> impl Future<Output = Result<T>> + Send;
}

/// The hub's link to one other member.
#[derive(Debug)]
struct Spoke {
    rank: u32,
    stream: TcpStream,
}

#[derive(Debug)]
enum Link {
    /// World size 1: nothing to talk to.
    Solo,
    /// Rank 0, with one link per other rank ordered by rank.
    Hub { spokes: Vec<Spoke> },
    /// Any other rank, linked to the hub.
    Spoke { stream: TcpStream },
    /// Released by teardown.
    Closed,
}

/// A joined group member.
///
/// Created by bootstrap, bound to one [`GroupConfig`] for its whole life.
#[derive(Debug)]
pub struct GroupSession {
    config: GroupConfig,
    state: SessionState,
    link: Link,
    seq: u64,
    lease: Option<RendezvousLease>,
}

impl GroupSession {
    /// Session for a group of one.
    pub fn solo(config: GroupConfig) -> Result<Self> {
        if config.world_size() != 1 {
            return Err(Error::InvalidConfig(format!(
                "solo session needs world size 1, got {}",
                config.world_size()
            )));
        }
        info!(rank = 0, world_size = 1, "Joined single-member group");
        Ok(Self::joined(config, Link::Solo))
    }

    /// Host the hub on `listener` and wait for every other rank to connect.
    ///
    /// Links with a duplicate rank, a rank out of range or a different world
    /// size are refused without failing the join. The first link for a rank
    /// wins.
    pub async fn host(config: GroupConfig, listener: TcpListener) -> Result<Self> {
        if !config.is_hub() {
            return Err(Error::InvalidConfig(format!(
                "rank {} cannot host the hub",
                config.rank()
            )));
        }
        if config.world_size() == 1 {
            return Self::solo(config);
        }

        let world_size = config.world_size();
        let deadline = Instant::now() + config.timeout;
        let mut joined: BTreeMap<u32, TcpStream> = BTreeMap::new();

        debug!(
            world_size,
            local = ?listener.local_addr().ok(),
            timeout = ?config.timeout,
            "Hub waiting for members"
        );

        while joined.len() < (world_size - 1) as usize {
            let accepted = tokio::time::timeout_at(deadline, listener.accept()).await;
            let (mut stream, peer) = match accepted {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to accept member link");
                    continue;
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        what: format!(
                            "members to join the hub ({}/{} present)",
                            joined.len() + 1,
                            world_size
                        ),
                        after: config.timeout,
                    })
                }
            };
            let _ = stream.set_nodelay(true);

            let hello = tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut stream)).await;
            let (rank, their_world) = match hello {
                Ok(Ok(Frame::Hello { rank, world_size })) => (rank, world_size),
                Ok(Ok(other)) => {
                    warn!(%peer, frame = ?other, "Member link opened without hello");
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(%peer, error = %e, "Member link failed before hello");
                    continue;
                }
                Err(_) => {
                    warn!(%peer, "Member link sent no hello in time");
                    continue;
                }
            };

            let refusal = if their_world != world_size {
                Some(format!(
                    "world size mismatch: hub has {world_size}, member has {their_world}"
                ))
            } else if rank == 0 || rank >= world_size {
                Some(format!("rank {rank} is not a valid member rank in 1..{world_size}"))
            } else if joined.contains_key(&rank) {
                Some(format!("rank {rank} already joined"))
            } else {
                None
            };

            if let Some(reason) = refusal {
                warn!(%peer, rank, %reason, "Refusing member link");
                let _ = tokio::time::timeout(
                    NOTIFY_TIMEOUT,
                    write_frame(&mut stream, &Frame::Reject { reason }),
                )
                .await;
                continue;
            }

            debug!(%peer, rank, joined = joined.len() + 2, world_size, "Member joined hub");
            joined.insert(rank, stream);
        }

        let mut spokes = Vec::with_capacity(joined.len());
        for (rank, mut stream) in joined {
            write_frame(&mut stream, &Frame::Welcome { world_size }).await?;
            spokes.push(Spoke { rank, stream });
        }

        info!(rank = 0, world_size, "Hub formed group");
        Ok(Self::joined(config, Link::Hub { spokes }))
    }

    /// Connect to the hub at `hub`, retrying through `prober` until it
    /// listens, and wait until every rank has joined.
    pub async fn connect(config: GroupConfig, hub: PeerAddress, prober: &Prober) -> Result<Self> {
        if config.is_hub() {
            return Err(Error::InvalidConfig("rank 0 hosts the hub, it cannot connect to one".into()));
        }

        let (mut stream, probe) = prober.connect(&hub).await?;
        debug!(rank = config.rank(), %hub, attempts = probe.attempts, "Connected to hub");

        write_frame(
            &mut stream,
            &Frame::Hello {
                rank: config.rank(),
                world_size: config.world_size(),
            },
        )
        .await?;

        let reply = tokio::time::timeout(config.timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::Timeout {
                what: format!("hub {hub} to welcome rank {}", config.rank()),
                after: config.timeout,
            })??;

        match reply {
            Frame::Welcome { world_size } if world_size == config.world_size() => {
                info!(rank = config.rank(), world_size, %hub, "Joined group");
                Ok(Self::joined(config, Link::Spoke { stream }))
            }
            Frame::Welcome { world_size } => Err(Error::JoinRejected {
                reason: format!(
                    "hub welcomed world size {world_size}, expected {}",
                    config.world_size()
                ),
            }),
            Frame::Reject { reason } => Err(Error::JoinRejected { reason }),
            Frame::Abort { reason } => Err(Error::Aborted { reason }),
            other => Err(Error::Collective {
                op: "join".into(),
                reason: format!("unexpected frame {other:?}"),
            }),
        }
    }

    fn joined(config: GroupConfig, link: Link) -> Self {
        Self {
            config,
            state: SessionState::Joined,
            link,
            seq: 0,
            lease: None,
        }
    }

    /// Attach the rendezvous lease; it is released on teardown.
    #[must_use]
    pub fn with_lease(mut self, lease: RendezvousLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// This member's rank.
    #[must_use]
    pub const fn rank(&self) -> u32 {
        self.config.rank()
    }

    /// Number of members.
    #[must_use]
    pub const fn world_size(&self) -> u32 {
        self.config.world_size()
    }

    /// The configuration this session is bound to.
    #[must_use]
    pub const fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether collectives may be called.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state == SessionState::Joined
    }

    /// Release the hub link and the rendezvous lease.
    ///
    /// Allowed once, from `Joined` or `Failed`. The lease owner waits for the
    /// rest of the group to disband, bounded by the group timeout.
    pub async fn teardown(&mut self) -> Result<()> {
        if self.state == SessionState::TornDown {
            return Err(Error::AlreadyTornDown);
        }
        let rank = self.config.rank();
        let was = self.state;
        self.state = SessionState::TornDown;

        match std::mem::replace(&mut self.link, Link::Closed) {
            Link::Spoke { mut stream } if was == SessionState::Joined => {
                let _ = tokio::time::timeout(
                    NOTIFY_TIMEOUT,
                    write_frame(&mut stream, &Frame::Goodbye { rank }),
                )
                .await;
            }
            Link::Hub { mut spokes } if was == SessionState::Joined => {
                notify_all(&mut spokes, &Frame::Goodbye { rank }).await;
            }
            _ => {}
        }

        let released = match self.lease.take() {
            Some(lease) => lease.release(self.config.timeout).await.map_err(Error::from),
            None => Ok(()),
        };

        info!(rank, previous = %was, "Session torn down");
        released
    }

    fn ensure_joined(&self) -> Result<()> {
        match self.state {
            SessionState::Joined => Ok(()),
            state => Err(Error::NotJoined { state }),
        }
    }

    /// Move to `Failed`, telling every spoke if this is the hub.
    async fn fail(&mut self, op: OpCode, reason: String) -> Error {
        warn!(rank = self.config.rank(), %op, seq = self.seq, %reason, "Collective failed, aborting group");
        self.state = SessionState::Failed;
        if let Link::Hub { spokes } = &mut self.link {
            notify_all(spokes, &Frame::Abort { reason: reason.clone() }).await;
        }
        Error::Collective {
            op: op.to_string(),
            reason,
        }
    }

    /// Run one collective round.
    ///
    /// Every member contributes `payload`. On the hub (or solo), `combine`
    /// turns the rank-ordered contributions into the shared result.
    async fn exchange<F>(&mut self, op: OpCode, payload: Vec<u8>, combine: F) -> Result<Vec<u8>>
    where
        F: FnOnce(Vec<Vec<u8>>) -> Result<Vec<u8>> + Send,
    {
        self.ensure_joined()?;
        self.seq += 1;
        let seq = self.seq;
        let timeout = self.config.timeout;
        trace!(rank = self.config.rank(), %op, seq, "Collective started");

        let outcome = match &mut self.link {
            Link::Solo => combine(vec![payload]).map_err(|e| RoundError::Failed(e.to_string())),
            Link::Hub { spokes } => hub_round(spokes, seq, op, payload, timeout, combine).await,
            Link::Spoke { stream } => spoke_round(stream, seq, op, payload, timeout).await,
            Link::Closed => return Err(Error::NotJoined { state: self.state }),
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(RoundError::Aborted(reason)) => {
                self.state = SessionState::Failed;
                warn!(rank = self.config.rank(), %op, %reason, "Group aborted by hub");
                Err(Error::Aborted { reason })
            }
            Err(RoundError::Failed(reason)) => Err(self.fail(op, reason).await),
        }
    }
}

/// Why a collective round did not produce a result.
enum RoundError {
    /// The hub told us the group is gone.
    Aborted(String),
    /// This member saw the failure itself.
    Failed(String),
}

impl From<String> for RoundError {
    fn from(reason: String) -> Self {
        Self::Failed(reason)
    }
}

async fn hub_round<F>(
    spokes: &mut [Spoke],
    seq: u64,
    op: OpCode,
    payload: Vec<u8>,
    timeout: Duration,
    combine: F,
) -> std::result::Result<Vec<u8>, RoundError>
where
    F: FnOnce(Vec<Vec<u8>>) -> Result<Vec<u8>>,
{
    let mut contributions = Vec::with_capacity(spokes.len() + 1);
    contributions.push(payload);

    let reads = spokes.iter_mut().map(|spoke| async move {
        let rank = spoke.rank;
        match tokio::time::timeout(timeout, read_frame(&mut spoke.stream)).await {
            Ok(Ok(Frame::Contribute { seq: s, op: o, payload })) if s == seq && o == op => Ok(payload),
            Ok(Ok(Frame::Contribute { seq: s, op: o, .. })) => Err(format!(
                "rank {rank} called {o} (seq {s}) while rank 0 called {op} (seq {seq})"
            )),
            Ok(Ok(Frame::Goodbye { .. })) => Err(format!("rank {rank} left the group")),
            Ok(Ok(other)) => Err(format!("rank {rank} sent unexpected frame {other:?}")),
            Ok(Err(e)) => Err(format!("rank {rank} link failed: {e}")),
            Err(_) => Err(format!("rank {rank} did not contribute within {timeout:?}")),
        }
    });
    for read in join_all(reads).await {
        contributions.push(read?);
    }

    let result = combine(contributions).map_err(|e| e.to_string())?;

    let frame = Frame::Result {
        seq,
        payload: result.clone(),
    };
    for spoke in spokes.iter_mut() {
        write_frame(&mut spoke.stream, &frame)
            .await
            .map_err(|e| format!("sending result to rank {} failed: {e}", spoke.rank))?;
    }
    Ok(result)
}

async fn spoke_round(
    stream: &mut TcpStream,
    seq: u64,
    op: OpCode,
    payload: Vec<u8>,
    timeout: Duration,
) -> std::result::Result<Vec<u8>, RoundError> {
    write_frame(stream, &Frame::Contribute { seq, op, payload })
        .await
        .map_err(|e| format!("sending contribution to hub failed: {e}"))?;

    match tokio::time::timeout(timeout, read_frame(stream)).await {
        Ok(Ok(Frame::Result { seq: s, payload })) if s == seq => Ok(payload),
        Ok(Ok(Frame::Result { seq: s, .. })) => {
            Err(format!("hub answered seq {s}, expected {seq}").into())
        }
        Ok(Ok(Frame::Abort { reason })) => Err(RoundError::Aborted(reason)),
        Ok(Ok(Frame::Goodbye { .. })) => Err("hub left the group".to_string().into()),
        Ok(Ok(other)) => Err(format!("hub sent unexpected frame {other:?}").into()),
        Ok(Err(e)) => Err(format!("hub link failed: {e}").into()),
        Err(_) => Err(format!("no result from hub within {timeout:?}").into()),
    }
}

/// Best-effort send of `frame` to every spoke.
async fn notify_all(spokes: &mut [Spoke], frame: &Frame) {
    let sends = spokes.iter_mut().map(|spoke| async move {
        let sent = tokio::time::timeout(NOTIFY_TIMEOUT, write_frame(&mut spoke.stream, frame)).await;
        if !matches!(sent, Ok(Ok(()))) {
            debug!(rank = spoke.rank, "Could not notify member");
        }
    });
    join_all(sends).await;
}

impl Collectives for GroupSession {
    fn rank(&self) -> u32 {
        self.config.rank()
    }

    fn world_size(&self) -> u32 {
        self.config.world_size()
    }

    async fn barrier(&mut self) -> Result<()> {
        self.exchange(OpCode::Barrier, Vec::new(), |_| Ok(Vec::new()))
            .await
            .map(|_| ())
    }

    async fn broadcast<T: Wire>(&mut self, buffer: &mut T, source: u32) -> Result<()> {
        self.ensure_joined()?;
        if source >= self.config.world_size() {
            return Err(Error::InvalidArgument(format!(
                "broadcast source {source} outside 0..{}",
                self.config.world_size()
            )));
        }

        let is_source = self.config.rank() == source;
        let payload = if is_source { encode(&*buffer)? } else { Vec::new() };
        let index = source as usize;
        let result = self
            .exchange(OpCode::Broadcast { source }, payload, move |mut contributions| {
                Ok(std::mem::take(&mut contributions[index]))
            })
            .await?;

        if !is_source {
            *buffer = self.decode_result(OpCode::Broadcast { source }, &result).await?;
        }
        Ok(())
    }

    async fn all_gather<T: Wire>(&mut self, value: &T) -> Result<Vec<T>> {
        let payload = encode(value)?;
        let result = self
            .exchange(OpCode::AllGather, payload, |contributions| encode(&contributions))
            .await?;

        let parts: Vec<Vec<u8>> = self.decode_result(OpCode::AllGather, &result).await?;
        let mut values = Vec::with_capacity(parts.len());
        for part in &parts {
            values.push(self.decode_result(OpCode::AllGather, part).await?);
        }
        Ok(values)
    }

    async fn all_reduce<T: Wire + Reduce>(&mut self, value: T, op: ReduceOp) -> Result<T> {
        let payload = encode(&value)?;
        let result = self
            .exchange(OpCode::AllReduce { op }, payload, move |contributions| {
                let values = contributions
                    .iter()
                    .map(|bytes| decode::<T>(bytes))
                    .collect::<Result<Vec<T>>>()?;
                encode(&fold(values, op)?)
            })
            .await?;

        self.decode_result(OpCode::AllReduce { op }, &result).await
    }
}

impl GroupSession {
    /// Decode a collective result; undecodable bytes fail the group.
    async fn decode_result<T: Wire>(&mut self, op: OpCode, bytes: &[u8]) -> Result<T> {
        match decode(bytes) {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(op, format!("undecodable result: {e}")).await),
        }
    }
}
