//! Per-link state owned by the node.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use ladder_proto::{FrameDecoder, LinkKind, NodeCode};

use super::{CloseReason, LinkId};
use crate::error::RelayError;
use crate::registry::Namespace;

/// Lifecycle of a link while it is in the node's table. Removal from the
/// table is disposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound connect still pending.
    Connecting,
    /// Relay link waiting for IDENTIFY (central) or ACCEPTED (boundary).
    AwaitingHandshake,
    Active,
}

#[derive(Debug)]
pub struct Link {
    id: LinkId,
    kind: Option<LinkKind>,
    registration: Option<(Namespace, NodeCode)>,
    state: LinkState,
    peer: Option<SocketAddr>,
    pub(crate) close_quietly: bool,
    pub(crate) decoder: FrameDecoder,
    /// Terminus bytes waiting for the pipe to be made.
    pub(crate) deferred: BytesMut,
}

impl Link {
    fn new(id: LinkId, kind: Option<LinkKind>, state: LinkState, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            kind,
            registration: None,
            state,
            peer,
            close_quietly: false,
            decoder: FrameDecoder::new(),
            deferred: BytesMut::new(),
        }
    }

    pub(crate) fn connecting(id: LinkId, kind: LinkKind) -> Self {
        Self::new(id, Some(kind), LinkState::Connecting, None)
    }

    /// Inbound relay link; its kind is learned from IDENTIFY.
    pub(crate) fn accepted_relay(id: LinkId, peer: SocketAddr) -> Self {
        Self::new(id, None, LinkState::AwaitingHandshake, Some(peer))
    }

    pub(crate) fn accepted_terminus(id: LinkId, peer: SocketAddr) -> Self {
        Self::new(id, Some(LinkKind::Terminus), LinkState::Active, Some(peer))
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn kind(&self) -> Option<LinkKind> {
        self.kind
    }

    pub fn is_terminus(&self) -> bool {
        self.kind == Some(LinkKind::Terminus)
    }

    pub fn remote_code(&self) -> Option<NodeCode> {
        self.registration.map(|(_, code)| code)
    }

    pub fn registration(&self) -> Option<(Namespace, NodeCode)> {
        self.registration
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }

    pub(crate) fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    /// Fixes the link kind. A kind can be learned once and never changed.
    pub(crate) fn set_kind(&mut self, kind: LinkKind) -> Result<(), RelayError> {
        match self.kind {
            Some(current) if current != kind => Err(RelayError::protocol(format!(
                "link {} is already {current:?}, cannot become {kind:?}",
                self.id
            ))),
            _ => {
                self.kind = Some(kind);
                Ok(())
            }
        }
    }

    pub(crate) fn set_registration(
        &mut self,
        namespace: Namespace,
        code: NodeCode,
    ) -> Result<(), RelayError> {
        if let Some((_, existing)) = self.registration {
            return Err(RelayError::consistency(format!(
                "link {} already holds code {existing}",
                self.id
            )));
        }
        self.registration = Some((namespace, code));
        Ok(())
    }

    pub(crate) fn take_deferred(&mut self) -> Bytes {
        self.deferred.split().freeze()
    }
}

/// What is left of a link after it leaves the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposedLink {
    pub id: LinkId,
    pub kind: Option<LinkKind>,
    pub remote_code: Option<NodeCode>,
    /// Outward cut notification is suppressed.
    pub quiet: bool,
    pub reason: CloseReason,
    /// The link never finished connecting.
    pub was_connecting: bool,
}

impl DisposedLink {
    pub(crate) fn from_link(link: &Link, reason: CloseReason) -> Self {
        Self {
            id: link.id,
            kind: link.kind,
            remote_code: link.remote_code(),
            quiet: link.close_quietly,
            reason,
            was_connecting: link.state == LinkState::Connecting,
        }
    }

    pub fn is_terminus(&self) -> bool {
        self.kind == Some(LinkKind::Terminus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn kind_is_learned_once() {
        let mut link = Link::accepted_relay(LinkId(1), addr());
        assert_eq!(link.kind(), None);
        link.set_kind(LinkKind::UpwardsRelay).unwrap();
        link.set_kind(LinkKind::UpwardsRelay).unwrap();
        assert!(link.set_kind(LinkKind::DownwardsRelay).is_err());
    }

    #[test]
    fn code_is_assigned_once() {
        let mut link = Link::accepted_terminus(LinkId(2), addr());
        link.set_registration(Namespace::Upstream, 4).unwrap();
        assert_eq!(link.remote_code(), Some(4));
        assert!(matches!(
            link.set_registration(Namespace::Upstream, 5),
            Err(RelayError::Consistency(_))
        ));
    }

    #[test]
    fn deferred_bytes_drain_in_order() {
        let mut link = Link::accepted_terminus(LinkId(3), addr());
        link.deferred.extend_from_slice(b"hello ");
        link.deferred.extend_from_slice(b"world");
        assert_eq!(link.deferred_len(), 11);
        assert_eq!(&link.take_deferred()[..], b"hello world");
        assert_eq!(link.deferred_len(), 0);
    }
}
