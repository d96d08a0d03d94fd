//! Muster Group - Collective Sessions over a Hub Link
//!
//! A [`GroupSession`] is what a member holds once bootstrap succeeds: a fixed
//! rank, a fixed world size and a set of collectives that only complete when
//! every member has taken part.
//!
//! # Topology
//!
//! Rank 0 is the hub. Every other rank holds exactly one TCP link to it. For
//! each collective the hub collects one contribution per rank, combines them
//! in rank order and sends the same bytes back to everyone, so results are
//! bit-identical across the group.
//!
//! ```text
//!          rank 1
//!            │
//! rank 2 ── hub (rank 0) ── rank 3
//!            │
//!          rank 4
//! ```
//!
//! # Failure
//!
//! Any transport failure, timeout or mismatched call during a collective
//! fails the whole group: the hub sends `Abort` to every member and every
//! session moves to [`SessionState::Failed`]. Recovery means bootstrapping a
//! new group.
//!
//! # Validation
//!
//! [`validate`] runs a fixed battery of collectives against a fresh session
//! and reports which ranks saw wrong results.

pub mod config;
pub mod error;
pub mod reduce;
pub mod session;
pub mod validate;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Backend, ControllerMode, GroupConfig};
pub use error::{Error, ErrorKind, Result};
pub use reduce::Reduce;
pub use session::{Collectives, GroupSession, SessionState, Wire};
pub use validate::{validate, Check, CheckOutcome, ValidationReport, BROADCAST_PROBE};
pub use wire::{OpCode, ReduceOp};
