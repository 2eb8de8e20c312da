//! Error types for the relay crate.

use ladder_core::errors::{
    ERROR_AUTH, ERROR_CAPACITY, ERROR_CONFIG, ERROR_CONSISTENCY, ERROR_IO, ERROR_LINK_LOST,
    ERROR_PROTOCOL, ERROR_TIMEOUT,
};
use ladder_proto::{NodeCode, ParseError, RejectReason, WriteError};
use thiserror::Error;

use crate::registry::{Namespace, RegistryError};

/// Errors that can occur in a relay process.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("malformed frame: {0:?}")]
    Proto(ParseError),

    #[error("frame encoding failed: {0:?}")]
    ProtoWrite(WriteError),

    /// Peer sent something its role or link state does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("rejected by central relay: {0}")]
    Rejected(RejectReason),

    /// Routing tables disagree; continuing would forward on bad state.
    #[error("consistency fault: {0}")]
    Consistency(String),

    #[error("no free {0} node code")]
    AtCapacity(Namespace),

    #[error("connect timeout to {0}")]
    ConnectTimeout(String),

    #[error("link to central relay lost")]
    CentralLinkLost,

    #[error("exit node {0} disconnected")]
    ExitNodeLost(NodeCode),
}

impl RelayError {
    /// Get the error type string for log fields.
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::Io(_) => ERROR_IO,
            RelayError::Config(_) => ERROR_CONFIG,
            RelayError::Proto(_) | RelayError::ProtoWrite(_) | RelayError::Protocol(_) => {
                ERROR_PROTOCOL
            }
            RelayError::Rejected(_) => ERROR_AUTH,
            RelayError::Consistency(_) => ERROR_CONSISTENCY,
            RelayError::AtCapacity(_) => ERROR_CAPACITY,
            RelayError::ConnectTimeout(_) => ERROR_TIMEOUT,
            RelayError::CentralLinkLost | RelayError::ExitNodeLost(_) => ERROR_LINK_LOST,
        }
    }

    /// Whether the fault is confined to the link that caused it.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            RelayError::Proto(_) | RelayError::ProtoWrite(_) | RelayError::Protocol(_)
        )
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        RelayError::Protocol(msg.into())
    }

    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        RelayError::Consistency(msg.into())
    }
}

impl From<ParseError> for RelayError {
    fn from(err: ParseError) -> Self {
        RelayError::Proto(err)
    }
}

impl From<WriteError> for RelayError {
    fn from(err: WriteError) -> Self {
        RelayError::ProtoWrite(err)
    }
}

impl From<RegistryError> for RelayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AtCapacity(ns) => RelayError::AtCapacity(ns),
            other => RelayError::Consistency(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_labels() {
        assert_eq!(RelayError::CentralLinkLost.error_type(), ERROR_LINK_LOST);
        assert_eq!(
            RelayError::from(ParseError::InvalidLength).error_type(),
            ERROR_PROTOCOL
        );
        assert_eq!(
            RelayError::Rejected(RejectReason::WrongPassword).error_type(),
            ERROR_AUTH
        );
    }

    #[test]
    fn only_wire_faults_are_link_local() {
        assert!(RelayError::protocol("re-identify").is_protocol_violation());
        assert!(RelayError::from(ParseError::TrailingBytes).is_protocol_violation());
        assert!(!RelayError::consistency("missing chain").is_protocol_violation());
        assert!(!RelayError::CentralLinkLost.is_protocol_violation());
    }

    #[test]
    fn registry_errors_map_by_kind() {
        assert!(matches!(
            RelayError::from(RegistryError::AtCapacity(Namespace::Upstream)),
            RelayError::AtCapacity(Namespace::Upstream)
        ));
        assert!(matches!(
            RelayError::from(RegistryError::CodeInUse(3)),
            RelayError::Consistency(_)
        ));
    }
}
