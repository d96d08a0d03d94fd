//! Muster Bootstrap - Transport Negotiation and the `muster` Binary
//!
//! Turns a set of independently started processes into one validated
//! [`GroupSession`](muster_group::GroupSession).
//!
//! # Flow
//!
//! ```text
//! LauncherEnv ─┐
//!              ├─► BootstrapConfig ─► Negotiator ─► GroupSession ─► validate
//! flags/env ───┘        │                 │
//!                       │                 └─ Connector (network or injected)
//!                       └─ plan(): DirectHandshake, ImplicitConfig,
//!                                  SharedStore, SharedFile
//! ```
//!
//! The [`Negotiator`] tries each planned [`RendezvousStrategy`] once, bounded
//! by the attempt timeout, and falls back to the next one on failure. When
//! nothing works it returns a [`Diagnosis`] listing every attempt and what to
//! do next.
//!
//! # Controllers
//!
//! In [`ControllerMode::Member`](muster_group::ControllerMode::Member) rank 0
//! hosts the rendezvous store itself. In `Pure` mode a separate
//! [`PureController`] hosts it and never joins the group.

pub mod bootstrap;
pub mod config;
pub mod connector;
pub mod controller;
pub mod diagnosis;
pub mod diagnostics;
pub mod error;
pub mod launcher;
pub mod negotiator;
pub mod strategy;

pub use bootstrap::bootstrap;
pub use config::{resolve_endpoint, BootstrapConfig};
pub use connector::{Connector, NetworkConnector};
pub use controller::PureController;
pub use diagnosis::Diagnosis;
pub use diagnostics::{run_diagnostics, HostReport, SelfTest};
pub use error::{Error, Result};
pub use launcher::{LauncherEnv, LAUNCHER_VARS};
pub use negotiator::{Negotiator, NegotiatorState};
pub use strategy::{AttemptRecord, RendezvousStrategy, StrategyKind};
