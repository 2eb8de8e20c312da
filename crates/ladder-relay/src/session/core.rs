//! Role-independent node state: the link table, registry, relay chains,
//! keepalive and raw forwarding.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ladder_proto::{
    CONTROL_CODE, ControlMessage, Frame, LinkKind, NodeCode, NodeRole, write_raw,
};
use tracing::{debug, trace};

use super::link::{DisposedLink, Link, LinkState};
use super::{Action, CloseReason, LinkId, ListenerKind, TimerKind};
use crate::chain::{RelayChain, RelayChainTable};
use crate::config::TimeoutConfig;
use crate::error::RelayError;
use crate::registry::{Namespace, NodeRegistry};

/// Namespace a relay link of `kind` is registered in.
pub(crate) fn relay_namespace(kind: LinkKind) -> Option<Namespace> {
    match kind {
        LinkKind::UpwardsRelay => Some(Namespace::Upstream),
        LinkKind::DownwardsRelay => Some(Namespace::Downstream),
        LinkKind::Terminus => None,
    }
}

#[derive(Debug)]
pub struct Core {
    role: NodeRole,
    timeouts: TimeoutConfig,
    links: HashMap<LinkId, Link>,
    registry: NodeRegistry<LinkId>,
    chains: RelayChainTable,
    local_code: Option<NodeCode>,
    central_link: Option<LinkId>,
    next_link: u64,
    actions: Vec<Action>,
    pub(crate) disposed: VecDeque<DisposedLink>,
    pub(crate) stopping: bool,
}

impl Core {
    pub(crate) fn new(role: NodeRole, timeouts: TimeoutConfig) -> Self {
        Self {
            role,
            timeouts,
            links: HashMap::new(),
            registry: NodeRegistry::new(),
            chains: RelayChainTable::new(),
            local_code: None,
            central_link: None,
            next_link: 1,
            actions: Vec::new(),
            disposed: VecDeque::new(),
            stopping: false,
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    pub fn local_code(&self) -> Option<NodeCode> {
        self.local_code
    }

    pub(crate) fn set_local_code(&mut self, code: NodeCode) {
        self.local_code = Some(code);
    }

    pub fn central_link(&self) -> Option<LinkId> {
        self.central_link
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub(crate) fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&id)
    }

    pub(crate) fn insert_link(&mut self, link: Link) {
        self.links.insert(link.id(), link);
    }

    pub(crate) fn remove_link(&mut self, id: LinkId) -> Option<Link> {
        self.links.remove(&id)
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        let mut ids: Vec<LinkId> = self.links.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn registry(&self) -> &NodeRegistry<LinkId> {
        &self.registry
    }

    pub fn chains(&self) -> &RelayChainTable {
        &self.chains
    }

    pub(crate) fn chains_mut(&mut self) -> &mut RelayChainTable {
        &mut self.chains
    }

    pub(crate) fn new_link_id(&mut self) -> LinkId {
        let id = LinkId(self.next_link);
        self.next_link += 1;
        id
    }

    pub(crate) fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    // ── Transport and timer requests ──

    pub(crate) fn listen(&mut self, addr: String, listener: ListenerKind) {
        self.actions.push(Action::Listen { addr, listener });
    }

    /// Starts an outbound connect for a link of `kind`.
    pub(crate) fn connect(&mut self, addr: String, kind: LinkKind) -> LinkId {
        let id = self.new_link_id();
        self.links.insert(id, Link::connecting(id, kind));
        self.actions.push(Action::Connect { link: id, addr });
        id
    }

    /// Starts the connect to the central relay and remembers the link.
    pub(crate) fn connect_central(&mut self, addr: String, kind: LinkKind) -> LinkId {
        let id = self.connect(addr, kind);
        self.central_link = Some(id);
        id
    }

    pub(crate) fn send(&mut self, link: LinkId, data: Bytes) {
        self.actions.push(Action::Send { link, data });
    }

    pub(crate) fn send_control(
        &mut self,
        link: LinkId,
        chain: &[NodeCode],
        msg: &ControlMessage,
    ) -> Result<(), RelayError> {
        trace!(link = %link, op = msg.name(), chain = ?chain, "sending control message");
        let frame = msg.to_frame(chain)?;
        self.send(link, frame);
        Ok(())
    }

    /// Sends a control message through the central relay link.
    pub(crate) fn send_via_central(
        &mut self,
        chain: &[NodeCode],
        msg: &ControlMessage,
    ) -> Result<(), RelayError> {
        let central = self.central_or_fault()?;
        self.send_control(central, chain, msg)
    }

    pub(crate) fn schedule(&mut self, link: LinkId, timer: TimerKind, delay: Duration) {
        self.actions.push(Action::Schedule { link, timer, delay });
    }

    pub(crate) fn cancel(&mut self, link: LinkId, timer: TimerKind) {
        self.actions.push(Action::Cancel { link, timer });
    }

    fn central_or_fault(&self) -> Result<LinkId, RelayError> {
        self.central_link
            .ok_or_else(|| RelayError::consistency("no central relay link"))
    }

    // ── Registration ──

    /// Registers `link` under an allocated (or fixed) code.
    pub(crate) fn register(
        &mut self,
        link: LinkId,
        namespace: Namespace,
        assigned: Option<NodeCode>,
    ) -> Result<NodeCode, RelayError> {
        let Some(l) = self.links.get_mut(&link) else {
            return Err(RelayError::consistency(format!(
                "registering unknown link {link}"
            )));
        };
        if let Some(code) = l.remote_code() {
            return Err(RelayError::consistency(format!(
                "link {link} already holds code {code}"
            )));
        }
        let code = self.registry.register(namespace, link, assigned)?;
        l.set_registration(namespace, code)?;
        Ok(code)
    }

    /// Fixes the kind of a relay link that completed its handshake.
    pub(crate) fn activate(&mut self, link: LinkId, kind: LinkKind) -> Result<(), RelayError> {
        let l = self
            .links
            .get_mut(&link)
            .ok_or_else(|| RelayError::consistency(format!("activating unknown link {link}")))?;
        l.set_kind(kind)?;
        l.set_state(LinkState::Active);
        Ok(())
    }

    // ── Teardown ──

    /// Closes a link and queues its disposal. Closing twice is a no-op.
    pub(crate) fn close(
        &mut self,
        id: LinkId,
        reason: CloseReason,
        quiet: bool,
    ) -> Result<(), RelayError> {
        let Some(mut link) = self.links.remove(&id) else {
            return Ok(());
        };
        link.close_quietly |= quiet;
        self.actions.push(Action::Close { link: id, reason });

        if let Some((namespace, code)) = link.registration() {
            match self.registry.deregister(namespace, code) {
                Some(found) if found == id => {}
                other => {
                    return Err(RelayError::consistency(format!(
                        "code {code} of link {id} resolved to {other:?} on deregister"
                    )));
                }
            }
        }
        if self.central_link == Some(id) {
            self.central_link = None;
        }
        debug!(
            link = %id,
            code = ?link.remote_code(),
            reason = %reason,
            quiet = link.close_quietly,
            "link closed"
        );
        self.disposed
            .push_back(DisposedLink::from_link(&link, reason));
        Ok(())
    }

    /// Closes a connection the node holds no link for.
    pub(crate) fn close_stray(&mut self, link: LinkId) {
        self.actions.push(Action::Close {
            link,
            reason: CloseReason::Abandoned,
        });
    }

    /// Quietly closes the terminus registered under `code`, if any.
    pub(crate) fn close_terminus_quietly(
        &mut self,
        namespace: Namespace,
        code: NodeCode,
        reason: CloseReason,
    ) -> Result<bool, RelayError> {
        match self.registry.lookup(namespace, code) {
            Some(link) => {
                self.close(link, reason, true)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Keepalive ──

    pub(crate) fn start_keepalive(&mut self, link: LinkId) {
        let idle = self.timeouts.keepalive_idle();
        self.schedule(link, TimerKind::KeepaliveIdle, idle);
    }

    pub(crate) fn keepalive_idle(&mut self, link: LinkId) -> Result<(), RelayError> {
        trace!(link = %link, "link idle, sending ping");
        self.send_control(link, &[CONTROL_CODE], &ControlMessage::Ping)?;
        let wait = self.timeouts.pong_timeout();
        self.schedule(link, TimerKind::PongWait, wait);
        Ok(())
    }

    // ── Forwarding ──

    /// Routes a frame that is not addressed to this hop.
    ///
    /// A frame only ever crosses to the opposite side of the node it came
    /// in on: from an upwards relay link to the downstream space and back.
    pub(crate) fn forward(&mut self, from: LinkId, frame: Frame) -> Result<(), RelayError> {
        let Some(l) = self.links.get(&from).filter(|l| l.state() == LinkState::Active) else {
            return Err(RelayError::protocol(format!(
                "frame for {} before handshake",
                frame.dest
            )));
        };
        let Some(namespace) = l.kind().and_then(|kind| relay_namespace(kind.invert())) else {
            return Err(RelayError::consistency(format!(
                "relay frame on link {from} of kind {:?}",
                l.kind()
            )));
        };
        if Namespace::of(frame.dest) != Some(namespace) {
            debug!(link = %from, dest = frame.dest, "destination on the sending side, dropping");
            return Ok(());
        }
        let Some(target) = self.registry.lookup(namespace, frame.dest) else {
            debug!(link = %from, dest = frame.dest, "no link for destination, dropping frame");
            return Ok(());
        };
        let is_terminus = self
            .links
            .get(&target)
            .ok_or_else(|| {
                RelayError::consistency(format!(
                    "code {} maps to missing link {target}",
                    frame.dest
                ))
            })?
            .is_terminus();
        if is_terminus {
            self.send(target, frame.rest);
        } else {
            let out = frame
                .forwarded()
                .map_err(|_| RelayError::protocol("frame has no next hop"))?;
            self.send(target, out);
        }
        Ok(())
    }

    /// Raw bytes read from a terminus.
    pub(crate) fn terminus_data(&mut self, link: LinkId, data: Bytes) -> Result<(), RelayError> {
        let max_deferred = self.timeouts.max_deferred_bytes;
        let Some(l) = self.links.get_mut(&link) else {
            return Ok(());
        };
        let Some(code) = l.remote_code() else {
            return Ok(());
        };
        if let Some(chain) = self.chains.get(code) {
            return self.send_raw(chain, &data);
        }
        l.deferred.extend_from_slice(&data);
        if l.deferred.len() > max_deferred {
            debug!(link = %link, code, bytes = l.deferred.len(), "deferred bytes over limit");
            self.close(link, CloseReason::DeferredOverflow, false)?;
        }
        Ok(())
    }

    /// Sends whatever a terminus queued before its pipe existed.
    pub(crate) fn flush_deferred(&mut self, link: LinkId, chain: RelayChain) -> Result<(), RelayError> {
        let Some(l) = self.links.get_mut(&link) else {
            return Ok(());
        };
        let pending = l.take_deferred();
        if pending.is_empty() {
            return Ok(());
        }
        trace!(link = %link, bytes = pending.len(), "flushing deferred bytes");
        self.send_raw(chain, &pending)
    }

    fn send_raw(&mut self, chain: RelayChain, data: &[u8]) -> Result<(), RelayError> {
        let central = self.central_or_fault()?;
        let chunk = self.timeouts.relay_buffer_size;
        let frames = data.len().div_ceil(chunk).max(1);
        let mut buf = BytesMut::with_capacity(data.len() + frames * 8);
        write_raw(&mut buf, &chain.hops(), data, chunk)?;
        self.send(central, buf.freeze());
        Ok(())
    }
}
