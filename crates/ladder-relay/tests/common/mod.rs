//! In-memory switchboard that wires nodes together without sockets.
//!
//! Every action a node emits is carried out here: connects are matched
//! against listeners, sends become `Received` events on the peer, closes
//! become `Disconnected` on the peer. Clients and backends are plain byte
//! sinks the test drives by hand. Timers are only recorded; a test fires
//! them explicitly.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use ladder_proto::{ControlMessage, FrameDecoder, NodeCode};
use ladder_relay::RelayError;
use ladder_relay::config::{
    CentralConfig, CentralNodeConfig, EntryConfig, EntryNodeConfig, ExitConfig, ExitNodeConfig,
    TimeoutConfig,
};
use ladder_relay::session::{Action, Event, LinkId, ListenerKind, Node, TimerKind};

pub const CENTRAL_ADDR: &str = "127.0.0.1:7000";
pub const BACKEND_ADDR: &str = "127.0.0.1:8080";
pub const BACKEND_PORT: u16 = 8080;

// ============================================================================
// Node builders
// ============================================================================

pub fn central_node() -> Node {
    Node::central(CentralNodeConfig {
        central: CentralConfig {
            listen: CENTRAL_ADDR.parse().unwrap(),
        },
        timeouts: TimeoutConfig::default(),
    })
}

pub fn exit_node(identifier: &str, password: &str) -> Node {
    Node::exit(ExitNodeConfig {
        exit: ExitConfig {
            central: CENTRAL_ADDR.into(),
            identifier: identifier.into(),
            password: password.into(),
            backend: BACKEND_ADDR.into(),
            advertise_port: None,
        },
        timeouts: TimeoutConfig::default(),
    })
    .unwrap()
}

pub fn entry_node(identifier: &str, password: &str) -> Node {
    entry_node_with(identifier, password, TimeoutConfig::default())
}

pub fn entry_node_with(identifier: &str, password: &str, timeouts: TimeoutConfig) -> Node {
    entry_node_at("0.0.0.0", identifier, password, timeouts)
}

/// Entry node whose client listener binds `host`, so several entries for
/// one exit can coexist on the switchboard.
pub fn entry_node_on(host: &str, identifier: &str, password: &str) -> Node {
    entry_node_at(host, identifier, password, TimeoutConfig::default())
}

fn entry_node_at(host: &str, identifier: &str, password: &str, timeouts: TimeoutConfig) -> Node {
    Node::entry(EntryNodeConfig {
        entry: EntryConfig {
            central: CENTRAL_ADDR.into(),
            identifier: identifier.into(),
            password: password.into(),
            listen_host: host.into(),
        },
        timeouts,
    })
}

/// Address an entry node listens on for clients.
pub fn entry_listen_addr(port: u16) -> String {
    format!("0.0.0.0:{port}")
}

// ============================================================================
// Switchboard
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtId(pub usize);

#[derive(Debug, Clone, Copy)]
enum End {
    Node(NodeId, LinkId),
    External(ExtId),
}

/// What a backend connect from an exit node turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Accept,
    /// Left pending until the test resolves it.
    Hold,
    Refuse,
}

/// A client or backend socket the test plays the far end of.
#[derive(Debug)]
pub struct External {
    pub node: NodeId,
    pub link: LinkId,
    pub received: Vec<u8>,
    pub closed: bool,
}

/// A control message as delivered to a node.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub from: NodeId,
    pub to: NodeId,
    pub msg: ControlMessage,
}

pub struct Switchboard {
    nodes: Vec<Node>,
    queue: VecDeque<(NodeId, Event)>,
    peers: HashMap<(NodeId, LinkId), End>,
    listeners: HashMap<String, (NodeId, ListenerKind)>,
    externals: Vec<External>,
    backends: Vec<ExtId>,
    decoders: HashMap<(NodeId, LinkId), FrameDecoder>,
    pending: Vec<(NodeId, LinkId)>,
    timers: BTreeSet<(NodeId, LinkId, TimerKind)>,
    next_port: u16,
    pub backend_mode: BackendMode,
    pub delivered: Vec<Delivered>,
    pub errors: Vec<(NodeId, RelayError)>,
}

impl Default for Switchboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Switchboard {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            queue: VecDeque::new(),
            peers: HashMap::new(),
            listeners: HashMap::new(),
            externals: Vec::new(),
            backends: Vec::new(),
            decoders: HashMap::new(),
            pending: Vec::new(),
            timers: BTreeSet::new(),
            next_port: 40000,
            backend_mode: BackendMode::Accept,
            delivered: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Adds a node and queues its start.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.queue.push_back((id, Event::Started));
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Processes one queued event. Returns false when nothing is queued.
    pub fn step(&mut self) -> bool {
        let Some((id, event)) = self.queue.pop_front() else {
            return false;
        };
        if let Err(e) = self.nodes[id.0].handle(event) {
            self.errors.push((id, e));
        }
        for action in self.nodes[id.0].take_actions() {
            self.apply(id, action);
        }
        true
    }

    /// Runs until no events are left.
    pub fn run(&mut self) {
        let mut steps = 0;
        while self.step() {
            steps += 1;
            assert!(steps < 100_000, "switchboard did not settle");
        }
    }

    fn next_addr(&mut self) -> SocketAddr {
        self.next_port += 1;
        SocketAddr::from(([127, 0, 0, 1], self.next_port))
    }

    fn apply(&mut self, id: NodeId, action: Action) {
        match action {
            Action::Listen { addr, listener } => {
                self.listeners.insert(addr, (id, listener));
            }
            Action::Connect { link, addr } => self.connect(id, link, &addr),
            Action::Send { link, data } => match self.peers.get(&(id, link)).copied() {
                Some(End::Node(to, to_link)) => {
                    self.trace(id, to, to_link, &data);
                    self.queue
                        .push_back((to, Event::Received { link: to_link, data }));
                }
                Some(End::External(ext)) => {
                    self.externals[ext.0].received.extend_from_slice(&data);
                }
                None => {}
            },
            Action::Close { link, .. } => {
                self.timers.retain(|(n, l, _)| !(*n == id && *l == link));
                self.pending.retain(|p| *p != (id, link));
                match self.peers.remove(&(id, link)) {
                    Some(End::Node(to, to_link)) => {
                        self.peers.remove(&(to, to_link));
                        self.queue
                            .push_back((to, Event::Disconnected { link: to_link }));
                    }
                    Some(End::External(ext)) => self.externals[ext.0].closed = true,
                    None => {}
                }
            }
            Action::Schedule { link, timer, .. } => {
                self.timers.insert((id, link, timer));
            }
            Action::Cancel { link, timer } => {
                self.timers.remove(&(id, link, timer));
            }
        }
    }

    fn connect(&mut self, id: NodeId, link: LinkId, addr: &str) {
        if let Some(&(target, listener)) = self.listeners.get(addr) {
            let remote = self.nodes[target.0].new_link_id();
            self.peers.insert((id, link), End::Node(target, remote));
            self.peers.insert((target, remote), End::Node(id, link));
            let peer = self.next_addr();
            self.queue.push_back((
                target,
                Event::Accepted {
                    link: remote,
                    peer,
                    listener,
                },
            ));
            let far: SocketAddr = addr.parse().unwrap();
            self.queue
                .push_back((id, Event::Connected { link, peer: far }));
            return;
        }
        if addr == BACKEND_ADDR {
            match self.backend_mode {
                BackendMode::Accept => {
                    self.attach_backend(id, link);
                }
                BackendMode::Hold => self.pending.push((id, link)),
                BackendMode::Refuse => self.queue.push_back((
                    id,
                    Event::ConnectFailed {
                        link,
                        error: RelayError::ConnectTimeout(addr.to_string()),
                    },
                )),
            }
            return;
        }
        self.queue.push_back((
            id,
            Event::ConnectFailed {
                link,
                error: RelayError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)),
            },
        ));
    }

    fn attach_backend(&mut self, id: NodeId, link: LinkId) -> ExtId {
        let ext = ExtId(self.externals.len());
        self.externals.push(External {
            node: id,
            link,
            received: Vec::new(),
            closed: false,
        });
        self.backends.push(ext);
        self.peers.insert((id, link), End::External(ext));
        self.queue.push_back((
            id,
            Event::Connected {
                link,
                peer: BACKEND_ADDR.parse().unwrap(),
            },
        ));
        ext
    }

    /// Records control messages as the receiving node will decode them.
    fn trace(&mut self, from: NodeId, to: NodeId, to_link: LinkId, data: &[u8]) {
        let decoder = self.decoders.entry((to, to_link)).or_default();
        decoder.extend(data);
        while let Ok(Some(frame)) = decoder.next_frame() {
            if frame.is_control()
                && let Ok(msg) = ControlMessage::decode(&frame.rest)
            {
                self.delivered.push(Delivered { from, to, msg });
            }
        }
    }

    // ── Backends ──

    pub fn backends(&self) -> &[ExtId] {
        &self.backends
    }

    pub fn pending_connects(&self) -> usize {
        self.pending.len()
    }

    /// Completes the oldest held backend connect.
    pub fn complete_pending(&mut self) -> ExtId {
        let (id, link) = self.pending.remove(0);
        self.attach_backend(id, link)
    }

    /// Fails the oldest held backend connect.
    pub fn fail_pending(&mut self) {
        let (id, link) = self.pending.remove(0);
        self.queue.push_back((
            id,
            Event::ConnectFailed {
                link,
                error: RelayError::ConnectTimeout(BACKEND_ADDR.to_string()),
            },
        ));
    }

    /// Drops the oldest held backend connect as if the transport lost it.
    pub fn drop_pending(&mut self) {
        let (id, link) = self.pending.remove(0);
        self.queue.push_back((id, Event::Disconnected { link }));
    }

    // ── External sockets ──

    /// Opens a raw connection to any listener.
    pub fn connect_to(&mut self, addr: &str) -> ExtId {
        let (target, listener) = *self
            .listeners
            .get(addr)
            .unwrap_or_else(|| panic!("nothing listens on {addr}"));
        let link = self.nodes[target.0].new_link_id();
        let ext = ExtId(self.externals.len());
        self.externals.push(External {
            node: target,
            link,
            received: Vec::new(),
            closed: false,
        });
        self.peers.insert((target, link), End::External(ext));
        let peer = self.next_addr();
        self.queue.push_back((
            target,
            Event::Accepted {
                link,
                peer,
                listener,
            },
        ));
        ext
    }

    pub fn is_listening(&self, addr: &str) -> bool {
        self.listeners.contains_key(addr)
    }

    pub fn external(&self, ext: ExtId) -> &External {
        &self.externals[ext.0]
    }

    pub fn external_send(&mut self, ext: ExtId, data: &[u8]) {
        let e = &self.externals[ext.0];
        if e.closed {
            return;
        }
        self.queue.push_back((
            e.node,
            Event::Received {
                link: e.link,
                data: Bytes::copy_from_slice(data),
            },
        ));
    }

    pub fn external_close(&mut self, ext: ExtId) {
        let e = &mut self.externals[ext.0];
        if e.closed {
            return;
        }
        e.closed = true;
        let (node, link) = (e.node, e.link);
        self.peers.remove(&(node, link));
        self.queue.push_back((node, Event::Disconnected { link }));
    }

    // ── Relay links ──

    /// Link on `from` whose far end is `to`.
    pub fn link_to(&self, from: NodeId, to: NodeId) -> LinkId {
        self.peers
            .iter()
            .find_map(|(&(n, l), end)| match end {
                End::Node(t, _) if n == from && *t == to => Some(l),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no link from {from:?} to {to:?}"))
    }

    /// Drops the connection between two nodes as if the network cut it.
    pub fn sever(&mut self, a: NodeId, b: NodeId) {
        let link = self.link_to(a, b);
        if let Some(End::Node(_, far)) = self.peers.remove(&(a, link)) {
            self.peers.remove(&(b, far));
            self.queue.push_back((a, Event::Disconnected { link }));
            self.queue.push_back((b, Event::Disconnected { link: far }));
        }
    }

    /// Queues raw bytes as if they arrived on `link` of `node`.
    pub fn inject(&mut self, node: NodeId, link: LinkId, data: Bytes) {
        self.queue.push_back((node, Event::Received { link, data }));
    }

    // ── Timers ──

    pub fn is_armed(&self, node: NodeId, link: LinkId, timer: TimerKind) -> bool {
        self.timers.contains(&(node, link, timer))
    }

    pub fn fire(&mut self, node: NodeId, link: LinkId, timer: TimerKind) {
        assert!(
            self.timers.remove(&(node, link, timer)),
            "{timer:?} is not armed on {link} of {node:?}"
        );
        self.queue.push_back((node, Event::TimerFired { link, timer }));
    }

    // ── Trace ──

    /// Control messages delivered to `to`.
    pub fn delivered_to(&self, to: NodeId) -> Vec<ControlMessage> {
        self.delivered
            .iter()
            .filter(|d| d.to == to)
            .map(|d| d.msg.clone())
            .collect()
    }

    pub fn count_delivered(&self, to: NodeId, msg: &ControlMessage) -> usize {
        self.delivered
            .iter()
            .filter(|d| d.to == to && d.msg == *msg)
            .count()
    }

    pub fn clear_trace(&mut self) {
        self.delivered.clear();
    }

    pub fn error_of(&self, node: NodeId) -> Option<&RelayError> {
        self.errors
            .iter()
            .find_map(|(n, e)| (*n == node).then_some(e))
    }
}

/// Nodes every pipe scenario starts from.
pub struct Topology {
    pub board: Switchboard,
    pub central: NodeId,
    pub exit: NodeId,
    pub entry: NodeId,
}

/// Central relay, one exit "svc" and one entry bound to it, all settled.
pub fn topology() -> Topology {
    let mut board = Switchboard::new();
    let central = board.add(central_node());
    let exit = board.add(exit_node("svc", "secret"));
    let entry = board.add(entry_node("svc", "secret"));
    board.run();
    assert!(board.errors.is_empty(), "setup failed: {:?}", board.errors);
    Topology {
        board,
        central,
        exit,
        entry,
    }
}

pub fn entry_code(board: &Switchboard, entry: NodeId) -> NodeCode {
    board.node(entry).local_code().unwrap()
}
