//! Entry node role: exposes the exit's port publicly and asks the exit for
//! a pipe for every client that connects.

use ladder_proto::{
    Accepted, CONTROL_CODE, ControlMessage, FoundCut, Identify, LinkKind, NodeCode, NodeRole,
    RejectReason,
};
use tracing::{debug, info, warn};

use super::{CloseReason, Core, DisposedLink, LinkId, LinkSessionHandler, ListenerKind, TimerKind};
use crate::chain::RelayChain;
use crate::config::EntryConfig;
use crate::error::RelayError;
use crate::registry::Namespace;

pub struct EntryHandler {
    config: EntryConfig,
    /// Code of the exit node this entry is bound to.
    exit_code: Option<NodeCode>,
}

impl EntryHandler {
    pub fn new(config: EntryConfig) -> Self {
        Self {
            config,
            exit_code: None,
        }
    }

    fn exit_code(&self) -> Result<NodeCode, RelayError> {
        self.exit_code
            .ok_or_else(|| RelayError::consistency("entry node has no exit node yet"))
    }
}

impl LinkSessionHandler for EntryHandler {
    fn role(&self) -> NodeRole {
        NodeRole::EntryNode
    }

    fn on_start(&mut self, core: &mut Core) -> Result<(), RelayError> {
        info!(central = %self.config.central, identifier = %self.config.identifier, "connecting to central relay");
        core.connect_central(self.config.central.clone(), LinkKind::DownwardsRelay);
        Ok(())
    }

    fn on_relay_connected(&mut self, core: &mut Core, link: LinkId) -> Result<(), RelayError> {
        let identify = Identify {
            kind: LinkKind::DownwardsRelay.invert(),
            identifier: self.config.identifier.clone(),
            password: self.config.password.clone(),
            port: None,
        };
        core.send_control(link, &[CONTROL_CODE], &ControlMessage::Identify(identify))
    }

    fn on_accepted(
        &mut self,
        core: &mut Core,
        link: LinkId,
        msg: Accepted,
    ) -> Result<(), RelayError> {
        let Some(entry) = msg.entry else {
            return Err(RelayError::protocol("ACCEPTED without exit details"));
        };
        core.register(link, Namespace::Downstream, Some(CONTROL_CODE))?;
        core.activate(link, LinkKind::DownwardsRelay)?;
        core.set_local_code(msg.code);
        self.exit_code = Some(entry.exit_code);

        let addr = format!("{}:{}", self.config.listen_host, entry.port);
        info!(
            code = msg.code,
            exit = entry.exit_code,
            listen = %addr,
            "serving as entry node"
        );
        core.listen(addr, ListenerKind::Terminus);
        Ok(())
    }

    fn on_rejected(
        &mut self,
        _core: &mut Core,
        _link: LinkId,
        reason: RejectReason,
    ) -> Result<(), RelayError> {
        Err(RelayError::Rejected(reason))
    }

    fn on_terminus_accepted(&mut self, core: &mut Core, link: LinkId) -> Result<(), RelayError> {
        let exit_code = self.exit_code()?;
        let local = core
            .local_code()
            .ok_or_else(|| RelayError::consistency("terminus accepted before ACCEPTED"))?;
        let code = match core.register(link, Namespace::Upstream, None) {
            Ok(code) => code,
            Err(RelayError::AtCapacity(_)) => {
                warn!(link = %link, "no free terminus code, dropping client");
                return core.close(link, CloseReason::AtCapacity, true);
            }
            Err(e) => return Err(e),
        };
        debug!(link = %link, code, "client connected, requesting pipe");
        core.send_via_central(
            &[exit_code, CONTROL_CODE],
            &ControlMessage::MakePipe {
                entry_node: local,
                entry_terminus: code,
            },
        )?;
        let wait = core.timeouts().deferred_flush();
        core.schedule(link, TimerKind::DeferredFlush, wait);
        Ok(())
    }

    fn on_pipe_made(
        &mut self,
        core: &mut Core,
        _link: LinkId,
        entry_terminus: NodeCode,
        exit_node: NodeCode,
        exit_terminus: NodeCode,
    ) -> Result<(), RelayError> {
        let Some(terminus) = core.registry().lookup(Namespace::Upstream, entry_terminus) else {
            debug!(terminus = entry_terminus, "pipe made for a client that is gone");
            return Ok(());
        };
        let chain = RelayChain::new(exit_node, exit_terminus);
        if let Some(stale) = core.chains_mut().insert(entry_terminus, chain) {
            debug!(terminus = entry_terminus, stale = %stale, "replacing stale pipe");
        }
        core.cancel(terminus, TimerKind::DeferredFlush);
        core.flush_deferred(terminus, chain)?;
        debug!(terminus = entry_terminus, chain = %chain, "piped through");
        Ok(())
    }

    fn on_pipe_fail(
        &mut self,
        core: &mut Core,
        _link: LinkId,
        _entry_node: NodeCode,
        entry_terminus: NodeCode,
    ) -> Result<(), RelayError> {
        debug!(terminus = entry_terminus, "exit node could not make pipe");
        core.close_terminus_quietly(Namespace::Upstream, entry_terminus, CloseReason::PipeFailed)?;
        Ok(())
    }

    fn on_found_cut(
        &mut self,
        core: &mut Core,
        _link: LinkId,
        cut: FoundCut,
    ) -> Result<(), RelayError> {
        match cut {
            FoundCut::Terminus(code) => {
                if core.chains_mut().remove(code).is_none() {
                    debug!(terminus = code, "cut for a terminus without a pipe");
                }
                core.close_terminus_quietly(Namespace::Upstream, code, CloseReason::CutByPeer)?;
                Ok(())
            }
            FoundCut::Node(code) => {
                warn!(exit = code, "exit node lost, closing all clients");
                for terminus in core.registry().codes(Namespace::Upstream) {
                    core.close_terminus_quietly(
                        Namespace::Upstream,
                        terminus,
                        CloseReason::NodeLost,
                    )?;
                }
                core.chains_mut().clear();
                Err(RelayError::ExitNodeLost(code))
            }
        }
    }

    fn on_disposed(&mut self, core: &mut Core, gone: &DisposedLink) -> Result<(), RelayError> {
        if !gone.is_terminus() {
            return Ok(());
        }
        let Some(code) = gone.remote_code else {
            return Ok(());
        };
        let chain = core.chains_mut().remove(code);
        if gone.quiet {
            return Ok(());
        }
        match chain {
            Some(chain) => {
                debug!(terminus = code, chain = %chain, "client gone, cutting pipe");
                core.send_via_central(
                    &chain.control_hops(),
                    &ControlMessage::FoundCut(FoundCut::Terminus(chain.terminus)),
                )
            }
            None => {
                let local = core
                    .local_code()
                    .ok_or_else(|| RelayError::consistency("terminus without local code"))?;
                debug!(terminus = code, "client gone before pipe was made");
                core.send_via_central(
                    &[self.exit_code()?, CONTROL_CODE],
                    &ControlMessage::PipeFail {
                        entry_node: local,
                        entry_terminus: code,
                    },
                )
            }
        }
    }
}
