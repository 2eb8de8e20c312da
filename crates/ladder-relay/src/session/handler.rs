use ladder_proto::{Accepted, FoundCut, Identify, NodeCode, NodeRole, RejectReason};

use super::{Core, DisposedLink, LinkId};
use crate::directory::CentralDirectory;
use crate::error::RelayError;
use crate::pipes::PipeTracker;

fn not_accepted(op: &str, role: NodeRole) -> RelayError {
    RelayError::protocol(format!("{op} is not accepted by the {role}"))
}

fn unexpected(what: &str, role: NodeRole) -> RelayError {
    RelayError::consistency(format!("{what} on the {role}"))
}

/// Role-specific behaviour of a node.
///
/// Each control opcode has a hook whose default treats the message as a
/// protocol violation, so a role only implements what it may legally
/// receive. Transport hooks default to a consistency fault because the
/// role never asked for that kind of link.
pub trait LinkSessionHandler {
    fn role(&self) -> NodeRole;

    /// Opens listeners or starts the connect to the central relay.
    fn on_start(&mut self, core: &mut Core) -> Result<(), RelayError>;

    /// Outbound relay link is up and waits for the handshake.
    fn on_relay_connected(&mut self, _core: &mut Core, _link: LinkId) -> Result<(), RelayError> {
        Err(unexpected("outbound relay link", self.role()))
    }

    fn on_terminus_connected(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
    ) -> Result<(), RelayError> {
        Err(unexpected("outbound terminus link", self.role()))
    }

    fn on_connect_failed(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
        _error: &RelayError,
    ) -> Result<(), RelayError> {
        Err(unexpected("failed outbound link", self.role()))
    }

    fn on_terminus_accepted(&mut self, _core: &mut Core, _link: LinkId) -> Result<(), RelayError> {
        Err(unexpected("accepted terminus", self.role()))
    }

    fn on_identify(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
        _msg: Identify,
    ) -> Result<(), RelayError> {
        Err(not_accepted("IDENTIFY", self.role()))
    }

    fn on_accepted(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
        _msg: Accepted,
    ) -> Result<(), RelayError> {
        Err(not_accepted("ACCEPTED", self.role()))
    }

    fn on_rejected(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
        _reason: RejectReason,
    ) -> Result<(), RelayError> {
        Err(not_accepted("REJECTED", self.role()))
    }

    fn on_found_cut(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
        _cut: FoundCut,
    ) -> Result<(), RelayError> {
        Err(not_accepted("FOUND_CUT", self.role()))
    }

    fn on_make_pipe(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
        _entry_node: NodeCode,
        _entry_terminus: NodeCode,
    ) -> Result<(), RelayError> {
        Err(not_accepted("MAKE_PIPE", self.role()))
    }

    fn on_pipe_made(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
        _entry_terminus: NodeCode,
        _exit_node: NodeCode,
        _exit_terminus: NodeCode,
    ) -> Result<(), RelayError> {
        Err(not_accepted("PIPE_MADE", self.role()))
    }

    fn on_pipe_fail(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
        _entry_node: NodeCode,
        _entry_terminus: NodeCode,
    ) -> Result<(), RelayError> {
        Err(not_accepted("PIPE_FAIL", self.role()))
    }

    /// Whether a relay frame from `from` may be passed on towards `dest`.
    fn may_forward(&self, _core: &Core, _from: LinkId, _dest: NodeCode) -> bool {
        true
    }

    /// A link left the tables. Runs the disconnect cascade for it.
    fn on_disposed(&mut self, core: &mut Core, gone: &DisposedLink) -> Result<(), RelayError>;

    fn directory(&self) -> Option<&CentralDirectory> {
        None
    }

    fn pipes(&self) -> Option<&PipeTracker> {
        None
    }
}
