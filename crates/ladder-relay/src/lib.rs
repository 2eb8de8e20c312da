//! Central relay, entry node and exit node of a ladder tunnel.
//!
//! A service behind NAT (reached by the exit node) is exposed on a public
//! port of an entry node. Neither node can reach the other, so both keep a
//! long-lived link to a central relay that forwards frames between them:
//!
//! ```text
//! client ── entry ══ central relay ══ exit ── backend
//! ```
//!
//! # Architecture
//!
//! - [`session`]: the protocol state machine of one node, free of I/O.
//!   Events go in, actions come out, and role-specific behaviour lives in
//!   a [`session::LinkSessionHandler`] per role.
//! - [`reactor`]: the tokio transport that runs a [`Node`].
//! - [`registry`], [`chain`], [`directory`], [`pipes`]: the tables the
//!   roles route and clean up with.

pub mod chain;
pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod pipes;
pub mod reactor;
pub mod registry;
pub mod session;

pub use error::RelayError;
pub use session::{Action, Event, Node, NodeConfig};
