//! Link session state machine.
//!
//! A [`Node`] is the whole protocol state of one relay process with no I/O
//! of its own. The transport feeds it [`Event`]s and carries out the
//! [`Action`]s it queues: sends, closes, connects, listeners and timers.
//! Everything role-specific lives behind [`LinkSessionHandler`], picked
//! once by role when the node is built.
//!
//! Closing a link removes it from the tables immediately and queues a
//! disposal; queued disposals are handed to the role handler after the
//! current event so cascades never re-enter the handler.

mod central;
mod core;
mod entry;
mod exit;
mod handler;
mod link;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use ladder_proto::{CONTROL_CODE, ControlMessage, NodeCode, NodeRole};
use tracing::{debug, error, trace, warn};

pub use self::central::CentralHandler;
pub use self::core::Core;
pub use self::entry::EntryHandler;
pub use self::exit::ExitHandler;
pub use self::handler::LinkSessionHandler;
pub use self::link::{DisposedLink, Link, LinkState};

use crate::chain::RelayChain;
use crate::config::{CentralNodeConfig, EntryNodeConfig, ExitNodeConfig};
use crate::directory::CentralDirectory;
use crate::error::RelayError;
use crate::pipes::PipeTracker;

/// Process-local handle of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an accepting listener hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Boundary nodes connecting to the central relay.
    Relay,
    /// External clients of an entry node.
    Terminus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Relay link has been silent for the keepalive window.
    KeepaliveIdle,
    /// PING sent, waiting for PONG.
    PongWait,
    /// Entry terminus still has no pipe.
    DeferredFlush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    PongTimeout,
    ProtocolViolation,
    /// Opposite side could not make the pipe.
    PipeFailed,
    /// Opposite terminus went away.
    CutByPeer,
    /// Opposite boundary node went away.
    NodeLost,
    /// Connected after the pipe was already abandoned.
    Abandoned,
    DeferredTimeout,
    DeferredOverflow,
    AtCapacity,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::PongTimeout => "pong timeout",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::PipeFailed => "pipe failed",
            CloseReason::CutByPeer => "cut by peer",
            CloseReason::NodeLost => "node lost",
            CloseReason::Abandoned => "abandoned",
            CloseReason::DeferredTimeout => "pipe not made in time",
            CloseReason::DeferredOverflow => "too many bytes before pipe",
            CloseReason::AtCapacity => "no free node code",
            CloseReason::Shutdown => "shutdown",
        })
    }
}

/// Inputs from the transport and timer collaborators.
#[derive(Debug)]
pub enum Event {
    /// The node was just started.
    Started,
    Connected {
        link: LinkId,
        peer: SocketAddr,
    },
    ConnectFailed {
        link: LinkId,
        error: RelayError,
    },
    Accepted {
        link: LinkId,
        peer: SocketAddr,
        listener: ListenerKind,
    },
    Received {
        link: LinkId,
        data: Bytes,
    },
    Disconnected {
        link: LinkId,
    },
    TimerFired {
        link: LinkId,
        timer: TimerKind,
    },
}

/// Requests to the transport and timer collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Listen {
        addr: String,
        listener: ListenerKind,
    },
    Connect {
        link: LinkId,
        addr: String,
    },
    Send {
        link: LinkId,
        data: Bytes,
    },
    /// Close the connection. Pending sends go out first.
    Close {
        link: LinkId,
        reason: CloseReason,
    },
    /// Arm a timer, replacing one of the same kind on the same link.
    Schedule {
        link: LinkId,
        timer: TimerKind,
        delay: Duration,
    },
    Cancel {
        link: LinkId,
        timer: TimerKind,
    },
}

/// Role configuration a node is built from.
#[derive(Debug, Clone)]
pub enum NodeConfig {
    Central(CentralNodeConfig),
    Entry(EntryNodeConfig),
    Exit(ExitNodeConfig),
}

pub struct Node {
    core: Core,
    handler: Box<dyn LinkSessionHandler + Send>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("core", &self.core).finish()
    }
}

impl Node {
    /// Builds a node with the session handler for its role.
    pub fn new(config: NodeConfig) -> Result<Self, RelayError> {
        let (role, timeouts, handler): (NodeRole, _, Box<dyn LinkSessionHandler + Send>) =
            match config {
                NodeConfig::Central(cfg) => (
                    NodeRole::CentralRelay,
                    cfg.timeouts,
                    Box::new(CentralHandler::new(cfg.central)),
                ),
                NodeConfig::Entry(cfg) => (
                    NodeRole::EntryNode,
                    cfg.timeouts,
                    Box::new(EntryHandler::new(cfg.entry)),
                ),
                NodeConfig::Exit(cfg) => {
                    let handler = ExitHandler::new(cfg.exit)?;
                    (NodeRole::ExitNode, cfg.timeouts, Box::new(handler))
                }
            };
        Ok(Self {
            core: Core::new(role, timeouts),
            handler,
        })
    }

    pub fn central(config: CentralNodeConfig) -> Self {
        Self {
            core: Core::new(NodeRole::CentralRelay, config.timeouts),
            handler: Box::new(CentralHandler::new(config.central)),
        }
    }

    pub fn entry(config: EntryNodeConfig) -> Self {
        Self {
            core: Core::new(NodeRole::EntryNode, config.timeouts),
            handler: Box::new(EntryHandler::new(config.entry)),
        }
    }

    pub fn exit(config: ExitNodeConfig) -> Result<Self, RelayError> {
        Self::new(NodeConfig::Exit(config))
    }

    pub fn role(&self) -> NodeRole {
        self.core.role()
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn link_count(&self) -> usize {
        self.core.link_count()
    }

    /// Code the central relay assigned to this node (0 on the central relay).
    pub fn local_code(&self) -> Option<NodeCode> {
        self.core.local_code()
    }

    pub fn relay_chain(&self, terminus: NodeCode) -> Option<RelayChain> {
        self.core.chains().get(terminus)
    }

    /// Exit/entry directory, on the central relay only.
    pub fn central_directory(&self) -> Option<&CentralDirectory> {
        self.handler.directory()
    }

    /// Pending and established pipes, on an exit node only.
    pub fn pipes(&self) -> Option<&PipeTracker> {
        self.handler.pipes()
    }

    pub fn is_stopped(&self) -> bool {
        self.core.stopping
    }

    /// Hands out an id for a connection the transport accepted.
    pub fn new_link_id(&mut self) -> LinkId {
        self.core.new_link_id()
    }

    /// Actions queued since the last call.
    pub fn take_actions(&mut self) -> Vec<Action> {
        self.core.take_actions()
    }

    /// Feeds one event through the state machine.
    ///
    /// An error is fatal for the process: the node has already shut itself
    /// down and queued quiet closes for every remaining link.
    pub fn handle(&mut self, event: Event) -> Result<(), RelayError> {
        if self.core.stopping {
            return Ok(());
        }
        let result = self
            .dispatch(event)
            .and_then(|()| self.drain_disposed());
        if let Err(e) = &result {
            error!(role = %self.role(), error = %e, error_type = e.error_type(), "node stopping");
            self.shutdown();
        }
        result
    }

    /// Closes every link quietly. Further events are ignored.
    pub fn shutdown(&mut self) {
        if self.core.stopping {
            return;
        }
        self.core.stopping = true;
        for id in self.core.link_ids() {
            if let Err(e) = self.core.close(id, CloseReason::Shutdown, true) {
                debug!(link = %id, error = %e, "close during shutdown");
            }
        }
        self.core.disposed.clear();
    }

    fn dispatch(&mut self, event: Event) -> Result<(), RelayError> {
        let core = &mut self.core;
        match event {
            Event::Started => {
                if core.role() == NodeRole::CentralRelay {
                    core.set_local_code(CONTROL_CODE);
                }
                self.handler.on_start(core)
            }
            Event::Accepted {
                link,
                peer,
                listener,
            } => match listener {
                ListenerKind::Relay => {
                    debug!(link = %link, peer = %peer, "relay link accepted");
                    core.insert_link(Link::accepted_relay(link, peer));
                    core.start_keepalive(link);
                    Ok(())
                }
                ListenerKind::Terminus => {
                    debug!(link = %link, peer = %peer, "terminus accepted");
                    core.insert_link(Link::accepted_terminus(link, peer));
                    self.handler.on_terminus_accepted(core, link)
                }
            },
            Event::Connected { link, peer } => {
                let Some(l) = core.link_mut(link) else {
                    // Link was dropped while connecting.
                    core.close_stray(link);
                    return Ok(());
                };
                if l.state() != LinkState::Connecting {
                    return Err(RelayError::consistency(format!(
                        "connect completed twice for link {link}"
                    )));
                }
                l.set_peer(peer);
                if l.is_terminus() {
                    l.set_state(LinkState::Active);
                    self.handler.on_terminus_connected(core, link)
                } else {
                    l.set_state(LinkState::AwaitingHandshake);
                    core.start_keepalive(link);
                    self.handler.on_relay_connected(core, link)
                }
            }
            Event::ConnectFailed { link, error } => {
                if core.remove_link(link).is_none() {
                    return Ok(());
                }
                if core.central_link() == Some(link) {
                    return Err(error);
                }
                self.handler.on_connect_failed(core, link, &error)
            }
            Event::Received { link, data } => self.on_received(link, data),
            Event::Disconnected { link } => core.close(link, CloseReason::PeerClosed, false),
            Event::TimerFired { link, timer } => self.on_timer(link, timer),
        }
    }

    fn drain_disposed(&mut self) -> Result<(), RelayError> {
        while let Some(gone) = self.core.disposed.pop_front() {
            if gone.kind.is_some_and(|k| k.is_relay()) && self.role() != NodeRole::CentralRelay {
                warn!(link = %gone.id, reason = %gone.reason, "link to central relay lost");
                return Err(RelayError::CentralLinkLost);
            }
            self.handler.on_disposed(&mut self.core, &gone)?;
        }
        Ok(())
    }

    fn on_received(&mut self, link: LinkId, data: Bytes) -> Result<(), RelayError> {
        let Some(l) = self.core.link(link) else {
            return Ok(());
        };
        if l.is_terminus() {
            return self.core.terminus_data(link, data);
        }
        match self.relay_data(link, data) {
            Err(e) if e.is_protocol_violation() => {
                warn!(link = %link, error = %e, error_type = e.error_type(), "closing link");
                let central = self.core.central_link() == Some(link);
                self.core.close(link, CloseReason::ProtocolViolation, false)?;
                if central { Err(e) } else { Ok(()) }
            }
            other => other,
        }
    }

    fn relay_data(&mut self, link: LinkId, data: Bytes) -> Result<(), RelayError> {
        self.core.start_keepalive(link);
        if let Some(l) = self.core.link_mut(link) {
            l.decoder.extend(&data);
        }
        loop {
            // The handler may close this link while frames are still buffered.
            let Some(l) = self.core.link_mut(link) else {
                return Ok(());
            };
            let Some(frame) = l.decoder.next_frame()? else {
                return Ok(());
            };
            if frame.is_control() {
                let msg = ControlMessage::decode(&frame.rest)?;
                self.on_control(link, msg)?;
            } else if self.handler.may_forward(&self.core, link, frame.dest) {
                self.core.forward(link, frame)?;
            } else {
                debug!(link = %link, dest = frame.dest, "destination not attached, dropping");
            }
        }
    }

    fn on_control(&mut self, link: LinkId, msg: ControlMessage) -> Result<(), RelayError> {
        let Some(state) = self.core.link(link).map(Link::state) else {
            return Ok(());
        };
        trace!(link = %link, op = msg.name(), "control message");
        let core = &mut self.core;
        let handler = &mut self.handler;
        match msg {
            ControlMessage::Ping => core.send_control(link, &[CONTROL_CODE], &ControlMessage::Pong),
            ControlMessage::Pong => {
                core.cancel(link, TimerKind::PongWait);
                Ok(())
            }
            ControlMessage::Identify(_)
            | ControlMessage::Accepted(_)
            | ControlMessage::Rejected(_)
                if state != LinkState::AwaitingHandshake =>
            {
                Err(RelayError::protocol(format!(
                    "{} on a link that finished its handshake",
                    msg.name()
                )))
            }
            ControlMessage::Identify(identify) => handler.on_identify(core, link, identify),
            ControlMessage::Accepted(accepted) => handler.on_accepted(core, link, accepted),
            ControlMessage::Rejected(reason) => handler.on_rejected(core, link, reason),
            _ if state != LinkState::Active => Err(RelayError::protocol(format!(
                "{} before handshake",
                msg.name()
            ))),
            ControlMessage::FoundCut(cut) => handler.on_found_cut(core, link, cut),
            ControlMessage::MakePipe {
                entry_node,
                entry_terminus,
            } => handler.on_make_pipe(core, link, entry_node, entry_terminus),
            ControlMessage::PipeMade {
                entry_terminus,
                exit_node,
                exit_terminus,
            } => handler.on_pipe_made(core, link, entry_terminus, exit_node, exit_terminus),
            ControlMessage::PipeFail {
                entry_node,
                entry_terminus,
            } => handler.on_pipe_fail(core, link, entry_node, entry_terminus),
        }
    }

    fn on_timer(&mut self, link: LinkId, timer: TimerKind) -> Result<(), RelayError> {
        let Some(l) = self.core.link(link) else {
            return Ok(());
        };
        match timer {
            TimerKind::KeepaliveIdle => self.core.keepalive_idle(link),
            TimerKind::PongWait => {
                warn!(link = %link, code = ?l.remote_code(), "no pong, closing link");
                self.core.close(link, CloseReason::PongTimeout, false)
            }
            TimerKind::DeferredFlush => {
                let pending = l
                    .remote_code()
                    .is_some_and(|code| !self.core.chains().contains(code));
                if pending {
                    debug!(link = %link, "pipe not made in time");
                    self.core.close(link, CloseReason::DeferredTimeout, false)?;
                }
                Ok(())
            }
        }
    }
}
