//! Central relay role: admits exit and entry nodes, assigns their codes
//! and tells each side when the other disappears.

use ladder_proto::{
    Accepted, CONTROL_CODE, ControlMessage, EntryLink, FoundCut, Identify, LinkKind, NodeCode,
    NodeRole, RejectReason,
};
use tracing::{debug, info, warn};

use super::core::relay_namespace;
use super::{CloseReason, Core, DisposedLink, LinkId, LinkSessionHandler, ListenerKind};
use crate::config::CentralConfig;
use crate::directory::CentralDirectory;
use crate::error::RelayError;
use crate::registry::Namespace;

pub struct CentralHandler {
    config: CentralConfig,
    directory: CentralDirectory,
}

impl CentralHandler {
    pub fn new(config: CentralConfig) -> Self {
        Self {
            config,
            directory: CentralDirectory::new(),
        }
    }

    fn reject(
        &self,
        core: &mut Core,
        link: LinkId,
        identifier: &str,
        reason: RejectReason,
    ) -> Result<(), RelayError> {
        warn!(link = %link, identifier, reason = %reason, "identify rejected");
        core.send_control(link, &[CONTROL_CODE], &ControlMessage::Rejected(reason))
    }

    /// Registers a relay link that passed its checks. `None` means the
    /// code space is full and the link was closed.
    fn admit(
        &self,
        core: &mut Core,
        link: LinkId,
        kind: LinkKind,
    ) -> Result<Option<NodeCode>, RelayError> {
        let Some(namespace) = relay_namespace(kind) else {
            return Err(RelayError::protocol("terminus links cannot identify"));
        };
        match core.register(link, namespace, None) {
            Ok(code) => {
                core.activate(link, kind)?;
                Ok(Some(code))
            }
            Err(RelayError::AtCapacity(ns)) => {
                warn!(link = %link, namespace = %ns, "no free node code, closing link");
                core.close(link, CloseReason::AtCapacity, false)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn identify_exit(
        &mut self,
        core: &mut Core,
        link: LinkId,
        identifier: String,
        password: String,
        port: u16,
    ) -> Result<(), RelayError> {
        if self.directory.has_exit(&identifier) {
            return self.reject(core, link, &identifier, RejectReason::IdInUse);
        }
        let Some(code) = self.admit(core, link, LinkKind::DownwardsRelay)? else {
            return Ok(());
        };
        if let Err(reason) = self
            .directory
            .add_exit(identifier.clone(), password, port, code)
        {
            return Err(RelayError::consistency(format!(
                "exit {identifier} admitted twice: {reason}"
            )));
        }
        info!(link = %link, code, identifier = %identifier, port, "exit node registered");
        core.send_control(
            link,
            &[CONTROL_CODE],
            &ControlMessage::Accepted(Accepted { code, entry: None }),
        )
    }

    fn identify_entry(
        &mut self,
        core: &mut Core,
        link: LinkId,
        identifier: String,
        password: String,
    ) -> Result<(), RelayError> {
        let admission = match self.directory.admit_entry(&identifier, &password) {
            Ok(admission) => admission,
            Err(reason) => return self.reject(core, link, &identifier, reason),
        };
        let Some(code) = self.admit(core, link, LinkKind::UpwardsRelay)? else {
            return Ok(());
        };
        self.directory.add_entry(code, admission.exit_code)?;
        info!(
            link = %link,
            code,
            identifier = %identifier,
            exit = admission.exit_code,
            "entry node registered"
        );
        core.send_control(
            link,
            &[CONTROL_CODE],
            &ControlMessage::Accepted(Accepted {
                code,
                entry: Some(EntryLink {
                    port: admission.port,
                    exit_code: admission.exit_code,
                }),
            }),
        )
    }
}

impl LinkSessionHandler for CentralHandler {
    fn role(&self) -> NodeRole {
        NodeRole::CentralRelay
    }

    fn on_start(&mut self, core: &mut Core) -> Result<(), RelayError> {
        info!(listen = %self.config.listen, "serving as central relay");
        core.listen(self.config.listen.to_string(), ListenerKind::Relay);
        Ok(())
    }

    fn on_identify(
        &mut self,
        core: &mut Core,
        link: LinkId,
        msg: Identify,
    ) -> Result<(), RelayError> {
        let identifier = msg.identifier.to_lowercase();
        match (msg.kind, msg.port) {
            (LinkKind::DownwardsRelay, Some(port)) => {
                self.identify_exit(core, link, identifier, msg.password, port)
            }
            (LinkKind::UpwardsRelay, None) => {
                self.identify_entry(core, link, identifier, msg.password)
            }
            (kind, _) => Err(RelayError::protocol(format!(
                "IDENTIFY with invalid link kind {kind:?}"
            ))),
        }
    }

    fn on_disposed(&mut self, core: &mut Core, gone: &DisposedLink) -> Result<(), RelayError> {
        let Some(code) = gone.remote_code else {
            debug!(link = %gone.id, "unidentified link gone");
            return Ok(());
        };
        match gone.kind {
            Some(LinkKind::UpwardsRelay) => {
                let exit = self.directory.remove_entry(code)?;
                info!(link = %gone.id, code, "entry node gone");
                if let Some(exit_code) = exit
                    && !gone.quiet
                    && let Some(exit_link) = core.registry().lookup(Namespace::Downstream, exit_code)
                {
                    core.send_control(
                        exit_link,
                        &[CONTROL_CODE],
                        &ControlMessage::FoundCut(FoundCut::Node(code)),
                    )?;
                }
                Ok(())
            }
            Some(LinkKind::DownwardsRelay) => {
                let entries = self.directory.remove_exit(code)?;
                info!(link = %gone.id, code, lame_ducks = entries.len(), "exit node gone");
                if gone.quiet {
                    return Ok(());
                }
                for entry_code in entries {
                    if let Some(entry_link) = core.registry().lookup(Namespace::Upstream, entry_code)
                    {
                        core.send_control(
                            entry_link,
                            &[CONTROL_CODE],
                            &ControlMessage::FoundCut(FoundCut::Node(code)),
                        )?;
                    }
                }
                Ok(())
            }
            other => Err(RelayError::consistency(format!(
                "registered link {} has kind {other:?}",
                gone.id
            ))),
        }
    }

    fn may_forward(&self, core: &Core, from: LinkId, dest: NodeCode) -> bool {
        let Some(link) = core.link(from) else {
            return true;
        };
        match (link.kind(), link.remote_code()) {
            (Some(LinkKind::UpwardsRelay), Some(entry)) => self.directory.is_attached(entry, dest),
            (Some(LinkKind::DownwardsRelay), Some(exit)) => self.directory.is_attached(dest, exit),
            _ => true,
        }
    }

    fn directory(&self) -> Option<&CentralDirectory> {
        Some(&self.directory)
    }
}
