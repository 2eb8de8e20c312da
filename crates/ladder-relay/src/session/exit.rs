//! Exit node role: registers with the central relay and connects to the
//! backend for every pipe an entry node asks for.

use std::collections::HashMap;

use ladder_proto::{
    Accepted, CONTROL_CODE, ControlMessage, FoundCut, Identify, LinkKind, NodeCode, NodeRole,
    RejectReason,
};
use tracing::{debug, info, warn};

use super::{CloseReason, Core, DisposedLink, LinkId, LinkSessionHandler};
use crate::chain::RelayChain;
use crate::config::ExitConfig;
use crate::error::RelayError;
use crate::pipes::{Established, PipeTracker, TheirFailure};
use crate::registry::Namespace;

pub struct ExitHandler {
    config: ExitConfig,
    connect_port: u16,
    pipes: PipeTracker,
    /// Backend connects in flight, keyed by link, with the pipe they serve.
    connecting: HashMap<LinkId, (NodeCode, NodeCode)>,
}

impl ExitHandler {
    pub fn new(config: ExitConfig) -> Result<Self, RelayError> {
        let connect_port = config.connect_port()?;
        Ok(Self {
            config,
            connect_port,
            pipes: PipeTracker::new(),
            connecting: HashMap::new(),
        })
    }

    fn take_connecting(&mut self, link: LinkId) -> Result<(NodeCode, NodeCode), RelayError> {
        self.connecting
            .remove(&link)
            .ok_or_else(|| RelayError::consistency(format!("backend link {link} has no pipe")))
    }

    /// Connect for a pipe failed or could not be registered.
    fn fail_our_end(
        &mut self,
        core: &mut Core,
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    ) -> Result<(), RelayError> {
        let notify = self
            .pipes
            .link_failed_our_end(entry_node, entry_terminus)
            .map_err(|e| RelayError::consistency(e.to_string()))?;
        if !notify {
            debug!(entry_node, entry_terminus, "pipe already abandoned by entry node");
            return Ok(());
        }
        core.send_via_central(
            &[entry_node, CONTROL_CODE],
            &ControlMessage::PipeFail {
                entry_node,
                entry_terminus,
            },
        )
    }

    /// Drops an established pipe and quietly closes its backend link.
    fn cut_ours(
        &mut self,
        core: &mut Core,
        terminus: NodeCode,
        reason: CloseReason,
    ) -> Result<(), RelayError> {
        if let Some(chain) = core.chains_mut().remove(terminus) {
            self.pipes.link_lost(chain.node, chain.terminus);
        }
        core.close_terminus_quietly(Namespace::Downstream, terminus, reason)?;
        Ok(())
    }
}

impl LinkSessionHandler for ExitHandler {
    fn role(&self) -> NodeRole {
        NodeRole::ExitNode
    }

    fn on_start(&mut self, core: &mut Core) -> Result<(), RelayError> {
        info!(
            central = %self.config.central,
            identifier = %self.config.identifier,
            backend = %self.config.backend,
            "connecting to central relay"
        );
        core.connect_central(self.config.central.clone(), LinkKind::UpwardsRelay);
        Ok(())
    }

    fn on_relay_connected(&mut self, core: &mut Core, link: LinkId) -> Result<(), RelayError> {
        let identify = Identify {
            kind: LinkKind::UpwardsRelay.invert(),
            identifier: self.config.identifier.clone(),
            password: self.config.password.clone(),
            port: Some(self.connect_port),
        };
        core.send_control(link, &[CONTROL_CODE], &ControlMessage::Identify(identify))
    }

    fn on_accepted(
        &mut self,
        core: &mut Core,
        link: LinkId,
        msg: Accepted,
    ) -> Result<(), RelayError> {
        if msg.entry.is_some() {
            return Err(RelayError::protocol("exit node ACCEPTED with entry details"));
        }
        core.register(link, Namespace::Upstream, Some(CONTROL_CODE))?;
        core.activate(link, LinkKind::UpwardsRelay)?;
        core.set_local_code(msg.code);
        info!(code = msg.code, port = self.connect_port, "serving as exit node");
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

    fn on_make_pipe(
        &mut self,
        core: &mut Core,
        _link: LinkId,
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    ) -> Result<(), RelayError> {
        self.pipes
            .link_attempt(entry_node, entry_terminus)
            .map_err(|e| RelayError::protocol(e.to_string()))?;
        debug!(entry_node, entry_terminus, backend = %self.config.backend, "connecting to backend");
        let link = core.connect(self.config.backend.clone(), LinkKind::Terminus);
        self.connecting.insert(link, (entry_node, entry_terminus));
        Ok(())
    }

    fn on_terminus_connected(&mut self, core: &mut Core, link: LinkId) -> Result<(), RelayError> {
        let (entry_node, entry_terminus) = self.take_connecting(link)?;
        let code = match core.register(link, Namespace::Downstream, None) {
            Ok(code) => code,
            Err(RelayError::AtCapacity(_)) => {
                warn!(link = %link, "no free terminus code, dropping backend link");
                core.close(link, CloseReason::AtCapacity, true)?;
                return self.fail_our_end(core, entry_node, entry_terminus);
            }
            Err(e) => return Err(e),
        };
        let outcome = self
            .pipes
            .link_established(entry_node, entry_terminus, code)
            .map_err(|e| RelayError::consistency(e.to_string()))?;
        if outcome == Established::Ignored {
            debug!(entry_node, entry_terminus, "pipe abandoned while connecting");
            return core.close(link, CloseReason::Abandoned, true);
        }
        let chain = RelayChain::new(entry_node, entry_terminus);
        if let Some(old) = core.chains_mut().insert(code, chain) {
            return Err(RelayError::consistency(format!(
                "terminus {code} already piped to {old}"
            )));
        }
        let local = core
            .local_code()
            .ok_or_else(|| RelayError::consistency("backend connected before ACCEPTED"))?;
        debug!(terminus = code, chain = %chain, "piped through");
        core.send_via_central(
            &[entry_node, CONTROL_CODE],
            &ControlMessage::PipeMade {
                entry_terminus,
                exit_node: local,
                exit_terminus: code,
            },
        )
    }

    fn on_connect_failed(
        &mut self,
        core: &mut Core,
        link: LinkId,
        error: &RelayError,
    ) -> Result<(), RelayError> {
        let (entry_node, entry_terminus) = self.take_connecting(link)?;
        warn!(
            backend = %self.config.backend,
            error = %error,
            error_type = error.error_type(),
            "backend connect failed"
        );
        self.fail_our_end(core, entry_node, entry_terminus)
    }

    fn on_pipe_fail(
        &mut self,
        core: &mut Core,
        _link: LinkId,
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    ) -> Result<(), RelayError> {
        match self.pipes.link_failed_their_end(entry_node, entry_terminus) {
            TheirFailure::Marked => {
                debug!(entry_node, entry_terminus, "entry gave up, backend connect pending");
                Ok(())
            }
            TheirFailure::Established(ours) => {
                debug!(entry_node, entry_terminus, terminus = ours, "entry gave up on live pipe");
                core.chains_mut().remove(ours);
                core.close_terminus_quietly(Namespace::Downstream, ours, CloseReason::PipeFailed)?;
                Ok(())
            }
            TheirFailure::AlreadyResolved => {
                debug!(entry_node, entry_terminus, "pipe already gone");
                Ok(())
            }
        }
    }

    fn on_found_cut(
        &mut self,
        core: &mut Core,
        _link: LinkId,
        cut: FoundCut,
    ) -> Result<(), RelayError> {
        match cut {
            FoundCut::Terminus(ours) => {
                if !core.chains().contains(ours) {
                    debug!(terminus = ours, "cut for a terminus without a pipe");
                }
                self.cut_ours(core, ours, CloseReason::CutByPeer)
            }
            FoundCut::Node(entry_node) => {
                let lost = self.pipes.links_lost(entry_node);
                info!(entry_node, pipes = lost.len(), "entry node gone");
                for ours in lost {
                    core.chains_mut().remove(ours);
                    core.close_terminus_quietly(Namespace::Downstream, ours, CloseReason::NodeLost)?;
                }
                Ok(())
            }
        }
    }

    fn on_disposed(&mut self, core: &mut Core, gone: &DisposedLink) -> Result<(), RelayError> {
        if !gone.is_terminus() {
            return Ok(());
        }
        if gone.was_connecting {
            if let Some((entry_node, entry_terminus)) = self.connecting.remove(&gone.id) {
                // Closed before the connect resolved; nobody is told.
                if let Err(e) = self.pipes.link_failed_our_end(entry_node, entry_terminus) {
                    debug!(link = %gone.id, error = %e, "dropped backend connect had no pipe");
                }
            }
            return Ok(());
        }
        let Some(code) = gone.remote_code else {
            return Ok(());
        };
        let chain = core.chains_mut().remove(code);
        if let Some(chain) = chain {
            self.pipes.link_lost(chain.node, chain.terminus);
        }
        if gone.quiet {
            return Ok(());
        }
        match chain {
            Some(chain) => {
                debug!(terminus = code, chain = %chain, "backend gone, cutting pipe");
                core.send_via_central(
                    &chain.control_hops(),
                    &ControlMessage::FoundCut(FoundCut::Terminus(chain.terminus)),
                )
            }
            None => Err(RelayError::consistency(format!(
                "backend terminus {code} closed without a pipe"
            ))),
        }
    }

    fn pipes(&self) -> Option<&PipeTracker> {
        Some(&self.pipes)
    }
}
