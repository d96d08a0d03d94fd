//! File-backed rendezvous for groups on a single host.
//!
//! The marker is an append-only JSON-lines file. The first line is a header
//! naming the rendezvous generation and world size; every later line is one
//! `key = value` entry. When a key appears more than once the first entry
//! wins, which gives the same no-overwrite semantics as the TCP store without
//! any locking.
//!
//! Rank 0 creates the marker. A marker left behind by an earlier run is
//! replaced on open, and joiners that already wrote into the old generation
//! replay their entries into the new one. A joiner that finds its own rank
//! already registered by someone else assumes the marker is stale and waits
//! for rank 0 to replace it.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use muster_net::PeerAddress;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Error, RejectKind, Result};
use crate::protocol::{member_key, Member};

/// How often the marker file is re-read while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One line of the marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Header { generation: String, world_size: u32 },
    Entry { key: String, value: String },
}

/// Parsed contents of the marker file.
#[derive(Debug, Default)]
struct Snapshot {
    generation: String,
    world_size: u32,
    entries: HashMap<String, String>,
}

/// Rendezvous through a marker file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    world_size: u32,
    creator: bool,
    generation: String,
    /// Entries this process wrote, replayed if the marker is replaced.
    written: Vec<(String, String)>,
    /// How long a joiner waits for a stale marker to be replaced.
    wait: Duration,
    removed: bool,
}

impl FileStore {
    /// Open the marker at `path` as `rank`.
    ///
    /// Rank 0 creates a fresh marker, replacing any stale one. Other ranks wait
    /// up to `timeout` for the marker to appear.
    pub async fn open(path: impl AsRef<Path>, rank: u32, world_size: u32, timeout: Duration) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::InvalidConfig("world size must be at least 1".into()));
        }
        if rank >= world_size {
            return Err(Error::Rejected {
                kind: RejectKind::InvalidRank,
                message: format!("rank {rank} outside 0..{world_size}"),
            });
        }

        if rank == 0 {
            Self::create(path.as_ref(), world_size).await
        } else {
            Self::join(path.as_ref(), world_size, timeout).await
        }
    }

    /// Create a fresh marker at `path`.
    pub async fn create(path: &Path, world_size: u32) -> Result<Self> {
        if tokio::fs::try_exists(path).await? {
            warn!(path = %path.display(), "Replacing stale rendezvous marker");
        }

        let generation = new_generation();
        let header = Record::Header {
            generation: generation.clone(),
            world_size,
        };
        let line = serde_json::to_string(&header)? + "\n";

        // Write then rename so joiners never see a marker without a header.
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, line).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!(path = %path.display(), %generation, world_size, "Rendezvous marker created");

        Ok(Self {
            path: path.to_path_buf(),
            world_size,
            creator: true,
            generation,
            written: Vec::new(),
            wait: Duration::ZERO,
            removed: false,
        })
    }

    /// Wait for the marker at `path` to appear and adopt its generation.
    pub async fn join(path: &Path, world_size: u32, timeout: Duration) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(snapshot) = read_snapshot(path).await? {
                check_world_size(&snapshot, world_size)?;
                debug!(path = %path.display(), generation = %snapshot.generation, "Joined rendezvous marker");
                return Ok(Self {
                    path: path.to_path_buf(),
                    world_size,
                    creator: false,
                    generation: snapshot.generation,
                    written: Vec::new(),
                    wait: timeout,
                    removed: false,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("rendezvous marker {}", path.display()),
                    after: timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// The marker path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this process created the marker.
    #[must_use]
    pub const fn is_creator(&self) -> bool {
        self.creator
    }

    /// The rendezvous generation this store is bound to.
    #[must_use]
    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// The world size recorded in the marker.
    #[must_use]
    pub const fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Store `value` under a new `key`. The first write of a key wins.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let snapshot = self.current().await?;
        if let Some(existing) = snapshot.entries.get(key) {
            if existing != value || !self.wrote(key) {
                return Err(key_exists(key));
            }
            return Ok(());
        }

        self.append(key, value).await?;

        // Another writer may have appended the same key first.
        let snapshot = self.current().await?;
        match snapshot.entries.get(key) {
            Some(winner) if winner == value => {
                self.written.push((key.to_string(), value.to_string()));
                Ok(())
            }
            _ => Err(key_exists(key)),
        }
    }

    /// Wait up to `timeout` for `key` and return its value.
    pub async fn get(&mut self, key: &str, timeout: Duration) -> Result<String> {
        let what = format!("key {key:?}");
        self.poll(timeout, what, |snapshot| snapshot.entries.get(key).cloned())
            .await
    }

    /// Register `rank` at `address`.
    ///
    /// The creator's generation is fresh, so a rank already present there is a
    /// duplicate. A joiner cannot tell a duplicate from a leftover of an
    /// earlier run; it waits for a new generation instead and times out if
    /// none arrives.
    pub async fn register(&mut self, rank: u32, address: PeerAddress) -> Result<()> {
        if rank >= self.world_size {
            return Err(Error::Rejected {
                kind: RejectKind::InvalidRank,
                message: format!("rank {rank} outside 0..{}", self.world_size),
            });
        }

        let key = member_key(rank);
        let value = address.to_string();
        let deadline = tokio::time::Instant::now() + self.wait;
        let mut stale_logged = false;

        loop {
            match self.set(&key, &value).await {
                Err(Error::Rejected {
                    kind: RejectKind::KeyExists,
                    ..
                }) if self.creator => {
                    return Err(Error::Rejected {
                        kind: RejectKind::DuplicateRank,
                        message: format!("rank {rank} already registered in {}", self.path.display()),
                    });
                }
                Err(Error::Rejected {
                    kind: RejectKind::KeyExists,
                    ..
                }) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Timeout {
                            what: format!("rank {rank} to be free in {}", self.path.display()),
                            after: self.wait,
                        });
                    }
                    if !stale_logged {
                        stale_logged = true;
                        warn!(
                            rank,
                            path = %self.path.display(),
                            generation = %self.generation,
                            "Rank already taken in marker, waiting for a fresh one"
                        );
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                other => {
                    if other.is_ok() {
                        debug!(rank, %address, path = %self.path.display(), "Member registered in marker");
                    }
                    return other;
                }
            }
        }
    }

    /// Wait until every rank is registered; members come back ordered by rank.
    ///
    /// A roster only counts once it holds every entry this store wrote, so a
    /// complete roster left in a stale marker is never taken as this group's.
    pub async fn roster(&mut self, timeout: Duration) -> Result<Vec<Member>> {
        let world_size = self.world_size;
        let written = self.written.clone();
        let entries = self
            .poll(timeout, "all members to register".to_string(), |snapshot| {
                let ours = written
                    .iter()
                    .all(|(key, value)| snapshot.entries.get(key) == Some(value));
                if !ours {
                    return None;
                }
                (0..world_size)
                    .map(|rank| snapshot.entries.get(&member_key(rank)).cloned())
                    .collect::<Option<Vec<_>>>()
            })
            .await?;

        entries
            .into_iter()
            .zip(0..)
            .map(|(value, rank)| {
                let address = PeerAddress::parse(&value).map_err(|e| self.marker_error(e.to_string()))?;
                Ok(Member { rank, address })
            })
            .collect()
    }

    /// Announce that `rank` has left the group.
    pub async fn disband(&mut self, rank: u32) -> Result<()> {
        self.set(&disband_key(rank), "1").await
    }

    /// Wait until every rank has disbanded.
    pub async fn wait_disbanded(&mut self, timeout: Duration) -> Result<()> {
        let world_size = self.world_size;
        self.poll(timeout, "all members to disband".to_string(), |snapshot| {
            (0..world_size)
                .all(|rank| snapshot.entries.contains_key(&disband_key(rank)))
                .then_some(())
        })
        .await
    }

    /// Remove the marker. Only the creator removes it, and only while it still
    /// holds this store's generation.
    pub async fn remove_marker(&mut self) -> Result<()> {
        if !self.creator || self.removed {
            return Ok(());
        }
        self.removed = true;

        match read_snapshot(&self.path).await? {
            Some(snapshot) if snapshot.generation == self.generation => {
                tokio::fs::remove_file(&self.path).await?;
                info!(path = %self.path.display(), "Rendezvous marker removed");
            }
            Some(_) => warn!(path = %self.path.display(), "Marker replaced by another run, leaving it"),
            None => {}
        }
        Ok(())
    }

    fn wrote(&self, key: &str) -> bool {
        self.written.iter().any(|(k, _)| k == key)
    }

    fn marker_error(&self, reason: impl Into<String>) -> Error {
        Error::Marker {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    async fn poll<T>(
        &mut self,
        timeout: Duration,
        what: String,
        mut check: impl FnMut(&Snapshot) -> Option<T>,
    ) -> Result<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.current().await?;
            if let Some(found) = check(&snapshot) {
                return Ok(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout { what, after: timeout });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Read the marker, following a replacement if one happened.
    async fn current(&mut self) -> Result<Snapshot> {
        let snapshot = read_snapshot(&self.path)
            .await?
            .ok_or_else(|| self.marker_error("marker disappeared"))?;

        if snapshot.generation == self.generation {
            return Ok(snapshot);
        }
        if self.creator {
            return Err(self.marker_error("replaced by another rendezvous"));
        }

        check_world_size(&snapshot, self.world_size)?;
        warn!(
            path = %self.path.display(),
            old = %self.generation,
            new = %snapshot.generation,
            replayed = self.written.len(),
            "Rendezvous marker replaced, replaying entries"
        );
        self.generation = snapshot.generation;
        for (key, value) in self.written.clone() {
            self.append(&key, &value).await?;
        }

        read_snapshot(&self.path)
            .await?
            .ok_or_else(|| self.marker_error("marker disappeared"))
    }

    async fn append(&self, key: &str, value: &str) -> Result<()> {
        let record = Record::Entry {
            key: key.to_string(),
            value: value.to_string(),
        };
        let line = serde_json::to_string(&record)? + "\n";

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if self.creator && !self.removed {
            if let Ok(contents) = std::fs::read_to_string(&self.path) {
                if contents.contains(&self.generation) {
                    let _ = std::fs::remove_file(&self.path);
                }
            }
        }
    }
}

async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut lines = contents.split_inclusive('\n');
    let header = match lines.next() {
        Some(line) if line.ends_with('\n') => line,
        _ => return Ok(None),
    };

    let mut snapshot = match serde_json::from_str::<Record>(header) {
        Ok(Record::Header {
            generation,
            world_size,
        }) => Snapshot {
            generation,
            world_size,
            entries: HashMap::new(),
        },
        _ => {
            return Err(Error::Marker {
                path: path.display().to_string(),
                reason: "missing header".to_string(),
            })
        }
    };

    for line in lines {
        // A trailing line without newline is still being written.
        if !line.ends_with('\n') {
            break;
        }
        if let Ok(Record::Entry { key, value }) = serde_json::from_str::<Record>(line) {
            snapshot.entries.entry(key).or_insert(value);
        }
    }

    Ok(Some(snapshot))
}

fn check_world_size(snapshot: &Snapshot, world_size: u32) -> Result<()> {
    if snapshot.world_size == world_size {
        Ok(())
    } else {
        Err(Error::Rejected {
            kind: RejectKind::WorldSizeMismatch,
            message: format!(
                "marker expects world size {}, participant has {world_size}",
                snapshot.world_size
            ),
        })
    }
}

fn key_exists(key: &str) -> Error {
    Error::Rejected {
        kind: RejectKind::KeyExists,
        message: format!("key {key:?} already set"),
    }
}

fn disband_key(rank: u32) -> String {
    format!("disband/{rank}")
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn new_generation() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{nanos:x}-{}", std::process::id())
}
