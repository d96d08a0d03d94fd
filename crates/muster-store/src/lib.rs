//! Muster Store - Rendezvous Key-Value Coordination
//!
//! A minimal store hosted by exactly one controller process. Participants use
//! it to find each other before any direct link exists.
//!
//! # Roles
//!
//! - **Controller**: runs a [`StoreServer`] on a fixed port, knows the world
//!   size up front, and must start first. It owns the store's lifetime and
//!   stays up until every participant has joined and, for store-mediated
//!   teardown, disbanded.
//! - **Participant**: opens a [`StoreClient`], retry-connecting through the
//!   prober until the controller listens.
//!
//! # Registration
//!
//! Each member registers once under its rank. Entries are append-only: a
//! rank cannot be registered twice, and no key can be overwritten. Once all
//! `world_size` ranks are present, [`StoreClient::roster`] returns the members
//! ordered by rank, identically for everyone.
//!
//! # File Rendezvous
//!
//! [`FileStore`] offers the same registration semantics through a marker file
//! for single-host groups. Its creator replaces any stale marker on open and
//! removes its own once the group disbands.
//!
//! # Wire Protocol
//!
//! Newline-delimited JSON, one [`StoreCommand`] per line, one
//! [`StoreResponse`] line back.

pub mod client;
pub mod error;
pub mod file;
pub mod lease;
pub mod protocol;
pub mod server;

pub use client::StoreClient;
pub use error::{Error, RejectKind, Result};
pub use file::FileStore;
pub use lease::{RendezvousLease, StoreHandle};
pub use protocol::{Member, StoreCommand, StoreResponse};
pub use server::StoreServer;
