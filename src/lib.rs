//! # ladder-rs
//!
//! NAT-traversal tunnels through a central relay.
//!
//! ## Crates
//!
//! - [`ladder_core`] - Default configuration values and log constants
//! - [`ladder_proto`] - Frame codec and control messages
//! - [`ladder_relay`] - Node state machine, tokio transport and CLI

pub use ladder_core as core;
pub use ladder_proto as proto;
pub use ladder_relay as relay;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use ladder_proto::{ControlMessage, LinkKind, NodeCode, NodeRole};
    pub use ladder_relay::config::{CentralNodeConfig, EntryNodeConfig, ExitNodeConfig};
    pub use ladder_relay::reactor::run;
    pub use ladder_relay::{Node, NodeConfig, RelayError};
}
