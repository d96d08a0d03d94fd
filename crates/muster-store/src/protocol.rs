//! Store wire protocol: newline-delimited JSON commands and responses.

use muster_net::PeerAddress;
use serde::{Deserialize, Serialize};

use crate::error::RejectKind;

/// A registered group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub rank: u32,
    pub address: PeerAddress,
}

/// Command sent by a participant to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum StoreCommand {
    /// First command on every connection; confirms the world size.
    Hello { world_size: u32 },
    /// Register a rank with its advertised address.
    Register { rank: u32, address: PeerAddress },
    /// Wait until every rank has registered.
    Roster { timeout_ms: u64 },
    /// Store a value under a new key.
    Set { key: String, value: String },
    /// Wait for a key and return its value.
    Get { key: String, timeout_ms: u64 },
    /// Atomically add to a counter and return the new value.
    Add { key: String, delta: i64 },
    /// Whether all keys are present.
    Check { keys: Vec<String> },
    /// Announce that a rank has left the group.
    Disband { rank: u32 },
    /// Health check
    Ping,
}

/// Response from the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoreResponse {
    Ok,
    Welcome { world_size: u32 },
    Registered { registered: u32, world_size: u32 },
    Roster { members: Vec<Member> },
    Value { value: String },
    Counter { value: i64 },
    Bool { value: bool },
    Error { kind: RejectKind, error: String },
    Pong,
}

impl StoreResponse {
    pub(crate) fn reject(kind: RejectKind, error: impl Into<String>) -> Self {
        Self::Error {
            kind,
            error: error.into(),
        }
    }
}

/// Key under which a rank's registration lives.
pub(crate) fn member_key(rank: u32) -> String {
    format!("member/{rank}")
}
