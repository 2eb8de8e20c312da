//! Control messages carried in frames addressed to [`CONTROL_CODE`](crate::CONTROL_CODE).
//!
//! Body layout is `opcode byte | opcode-specific fields`. Strings are a
//! big-endian `u16` byte count followed by UTF-8.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    FOUND_CUT_NODE, FOUND_CUT_TERMINUS, LinkKind, NodeCode, OP_ACCEPTED, OP_FOUND_CUT,
    OP_IDENTIFY, OP_MAKE_PIPE, OP_PING, OP_PIPE_FAIL, OP_PIPE_MADE, OP_PONG, OP_REJECTED,
    ParseError, RejectReason, WriteError, write_frame,
};

/// `IDENTIFY` sent by a boundary node right after connecting to the central relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identify {
    /// Kind of the link as seen from the central relay.
    pub kind: LinkKind,
    pub identifier: String,
    pub password: String,
    /// Public port entry nodes should expose. Present only for exit nodes.
    pub port: Option<u16>,
}

/// Extra `ACCEPTED` payload for an entry node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLink {
    pub port: u16,
    pub exit_code: NodeCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Code the central relay assigned to the identifying node.
    pub code: NodeCode,
    pub entry: Option<EntryLink>,
}

/// Sub-type of a `FOUND_CUT` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundCut {
    /// One pipe ended; carries the receiver-side terminus code.
    Terminus(NodeCode),
    /// A whole boundary node vanished; carries its code at the central relay.
    Node(NodeCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Identify(Identify),
    Accepted(Accepted),
    Rejected(RejectReason),
    Ping,
    Pong,
    FoundCut(FoundCut),
    MakePipe {
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    },
    PipeMade {
        entry_terminus: NodeCode,
        exit_node: NodeCode,
        exit_terminus: NodeCode,
    },
    PipeFail {
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    },
}

impl ControlMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            ControlMessage::Identify(_) => OP_IDENTIFY,
            ControlMessage::Accepted(_) => OP_ACCEPTED,
            ControlMessage::Rejected(_) => OP_REJECTED,
            ControlMessage::Ping => OP_PING,
            ControlMessage::Pong => OP_PONG,
            ControlMessage::FoundCut(_) => OP_FOUND_CUT,
            ControlMessage::MakePipe { .. } => OP_MAKE_PIPE,
            ControlMessage::PipeMade { .. } => OP_PIPE_MADE,
            ControlMessage::PipeFail { .. } => OP_PIPE_FAIL,
        }
    }

    /// Short opcode name for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Identify(_) => "IDENTIFY",
            ControlMessage::Accepted(_) => "ACCEPTED",
            ControlMessage::Rejected(_) => "REJECTED",
            ControlMessage::Ping => "PING",
            ControlMessage::Pong => "PONG",
            ControlMessage::FoundCut(FoundCut::Terminus(_)) => "FOUND_CUT_TERMINUS",
            ControlMessage::FoundCut(FoundCut::Node(_)) => "FOUND_CUT_NODE",
            ControlMessage::MakePipe { .. } => "MAKE_PIPE",
            ControlMessage::PipeMade { .. } => "PIPE_MADE",
            ControlMessage::PipeFail { .. } => "PIPE_FAIL",
        }
    }

    /// Appends the message body (opcode and fields) to `buf`.
    pub fn encode_body(&self, buf: &mut BytesMut) -> Result<(), WriteError> {
        buf.put_u8(self.opcode());
        match self {
            ControlMessage::Identify(identify) => {
                buf.put_i8(identify.kind.as_byte());
                put_str(buf, &identify.identifier)?;
                put_str(buf, &identify.password)?;
                if let Some(port) = identify.port {
                    buf.put_i32(i32::from(port));
                }
            }
            ControlMessage::Accepted(accepted) => {
                buf.put_i16(accepted.code);
                if let Some(entry) = accepted.entry {
                    buf.put_i32(i32::from(entry.port));
                    buf.put_i16(entry.exit_code);
                }
            }
            ControlMessage::Rejected(reason) => buf.put_u8(reason.as_byte()),
            ControlMessage::Ping | ControlMessage::Pong => {}
            ControlMessage::FoundCut(cut) => match cut {
                FoundCut::Terminus(code) => {
                    buf.put_u8(FOUND_CUT_TERMINUS);
                    buf.put_i16(*code);
                }
                FoundCut::Node(code) => {
                    buf.put_u8(FOUND_CUT_NODE);
                    buf.put_i16(*code);
                }
            },
            ControlMessage::MakePipe {
                entry_node,
                entry_terminus,
            }
            | ControlMessage::PipeFail {
                entry_node,
                entry_terminus,
            } => {
                buf.put_i16(*entry_node);
                buf.put_i16(*entry_terminus);
            }
            ControlMessage::PipeMade {
                entry_terminus,
                exit_node,
                exit_terminus,
            } => {
                buf.put_i16(*entry_terminus);
                buf.put_i16(*exit_node);
                buf.put_i16(*exit_terminus);
            }
        }
        Ok(())
    }

    /// Encodes a complete frame addressed through `chain`.
    pub fn to_frame(&self, chain: &[NodeCode]) -> Result<Bytes, WriteError> {
        let mut body = BytesMut::with_capacity(32);
        self.encode_body(&mut body)?;
        let mut buf = BytesMut::with_capacity(crate::HEADER_LEN + chain.len() * 2 + body.len());
        write_frame(&mut buf, chain, &body)?;
        Ok(buf.freeze())
    }

    /// Decodes a control message body (the bytes following control code `0`).
    pub fn decode(body: &[u8]) -> Result<Self, ParseError> {
        let mut r = Reader::new(body);
        let opcode = r.u8()?;
        let msg = match opcode {
            OP_IDENTIFY => {
                let raw_kind = r.i8()?;
                let kind = LinkKind::from_byte(raw_kind)
                    .ok_or(ParseError::InvalidLinkKind(raw_kind as u8))?;
                let identifier = r.string()?;
                let password = r.string()?;
                let port = if kind == LinkKind::DownwardsRelay {
                    Some(r.port()?)
                } else {
                    None
                };
                ControlMessage::Identify(Identify {
                    kind,
                    identifier,
                    password,
                    port,
                })
            }
            OP_ACCEPTED => {
                let code = r.i16()?;
                // Entry acceptance carries port and exit code; exit acceptance ends here.
                let entry = if r.remaining() == 0 {
                    None
                } else {
                    Some(EntryLink {
                        port: r.port()?,
                        exit_code: r.i16()?,
                    })
                };
                ControlMessage::Accepted(Accepted { code, entry })
            }
            OP_REJECTED => {
                let raw = r.u8()?;
                ControlMessage::Rejected(
                    RejectReason::from_byte(raw).ok_or(ParseError::InvalidRejectReason(raw))?,
                )
            }
            OP_PING => ControlMessage::Ping,
            OP_PONG => ControlMessage::Pong,
            OP_FOUND_CUT => {
                let sub = r.u8()?;
                let code = r.i16()?;
                ControlMessage::FoundCut(match sub {
                    FOUND_CUT_TERMINUS => FoundCut::Terminus(code),
                    FOUND_CUT_NODE => FoundCut::Node(code),
                    other => return Err(ParseError::InvalidCutKind(other)),
                })
            }
            OP_MAKE_PIPE => ControlMessage::MakePipe {
                entry_node: r.i16()?,
                entry_terminus: r.i16()?,
            },
            OP_PIPE_MADE => ControlMessage::PipeMade {
                entry_terminus: r.i16()?,
                exit_node: r.i16()?,
                exit_terminus: r.i16()?,
            },
            OP_PIPE_FAIL => ControlMessage::PipeFail {
                entry_node: r.i16()?,
                entry_terminus: r.i16()?,
            },
            other => return Err(ParseError::UnknownOpcode(other)),
        };
        if r.remaining() != 0 {
            return Err(ParseError::TrailingBytes);
        }
        Ok(msg)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), WriteError> {
    if s.len() > u16::MAX as usize {
        return Err(WriteError::StringTooLong);
    }
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, ParseError> {
        Ok(self.u8()? as i8)
    }

    fn i16(&mut self) -> Result<i16, ParseError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, ParseError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn port(&mut self) -> Result<u16, ParseError> {
        let raw = self.i32()?;
        u16::try_from(raw).map_err(|_| ParseError::InvalidPort(raw))
    }

    fn string(&mut self) -> Result<String, ParseError> {
        let b = self.take(2)?;
        let len = u16::from_be_bytes([b[0], b[1]]) as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ParseError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CONTROL_CODE, FrameDecoder};

    fn body(msg: &ControlMessage) -> Vec<u8> {
        let mut buf = BytesMut::new();
        msg.encode_body(&mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn identify_exit_layout() {
        let msg = ControlMessage::Identify(Identify {
            kind: LinkKind::DownwardsRelay,
            identifier: "svc".into(),
            password: "pw".into(),
            port: Some(8080),
        });
        let bytes = body(&msg);
        let mut expected = vec![OP_IDENTIFY, 0xFF, 0, 3, b's', b'v', b'c', 0, 2, b'p', b'w'];
        expected.extend_from_slice(&8080i32.to_be_bytes());
        assert_eq!(bytes, expected);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn identify_entry_has_no_port() {
        let msg = ControlMessage::Identify(Identify {
            kind: LinkKind::UpwardsRelay,
            identifier: "svc".into(),
            password: "pw".into(),
            port: None,
        });
        let bytes = body(&msg);
        assert_eq!(bytes.len(), 1 + 1 + 5 + 4);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn accepted_variants_decode_by_length() {
        let exit = ControlMessage::Accepted(Accepted {
            code: -1,
            entry: None,
        });
        assert_eq!(body(&exit), vec![OP_ACCEPTED, 0xFF, 0xFF]);
        assert_eq!(ControlMessage::decode(&body(&exit)).unwrap(), exit);

        let entry = ControlMessage::Accepted(Accepted {
            code: 1,
            entry: Some(EntryLink {
                port: 8080,
                exit_code: -1,
            }),
        });
        assert_eq!(body(&entry).len(), 1 + 2 + 4 + 2);
        assert_eq!(ControlMessage::decode(&body(&entry)).unwrap(), entry);
    }

    #[test]
    fn found_cut_sub_types() {
        let t = ControlMessage::FoundCut(FoundCut::Terminus(7));
        assert_eq!(body(&t), vec![OP_FOUND_CUT, FOUND_CUT_TERMINUS, 0, 7]);
        let n = ControlMessage::FoundCut(FoundCut::Node(-2));
        assert_eq!(ControlMessage::decode(&body(&n)).unwrap(), n);
        assert_eq!(
            ControlMessage::decode(&[OP_FOUND_CUT, 9, 0, 1]),
            Err(ParseError::InvalidCutKind(9))
        );
    }

    #[test]
    fn pipe_messages() {
        let made = ControlMessage::PipeMade {
            entry_terminus: 1,
            exit_node: -1,
            exit_terminus: -1,
        };
        assert_eq!(
            body(&made),
            vec![OP_PIPE_MADE, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        let fail = ControlMessage::PipeFail {
            entry_node: 1,
            entry_terminus: 4,
        };
        assert_eq!(ControlMessage::decode(&body(&fail)).unwrap(), fail);
    }

    #[test]
    fn decode_errors() {
        assert_eq!(ControlMessage::decode(&[]), Err(ParseError::Truncated));
        assert_eq!(ControlMessage::decode(&[0x42]), Err(ParseError::UnknownOpcode(0x42)));
        assert_eq!(
            ControlMessage::decode(&[OP_PING, 0]),
            Err(ParseError::TrailingBytes)
        );
        assert_eq!(
            ControlMessage::decode(&[OP_REJECTED, 0]),
            Err(ParseError::InvalidRejectReason(0))
        );
        assert_eq!(
            ControlMessage::decode(&[OP_IDENTIFY, 5]),
            Err(ParseError::InvalidLinkKind(5))
        );
        assert_eq!(
            ControlMessage::decode(&[OP_MAKE_PIPE, 0, 1]),
            Err(ParseError::Truncated)
        );
        assert_eq!(
            ControlMessage::decode(&[OP_IDENTIFY, 0, 0, 1, 0xFF, 0, 0]),
            Err(ParseError::InvalidUtf8)
        );
    }

    #[test]
    fn negative_port_is_rejected() {
        let mut bytes = vec![OP_ACCEPTED, 0, 1];
        bytes.extend_from_slice(&(-5i32).to_be_bytes());
        bytes.extend_from_slice(&(-1i16).to_be_bytes());
        assert_eq!(ControlMessage::decode(&bytes), Err(ParseError::InvalidPort(-5)));
    }

    #[test]
    fn control_frame_through_central() {
        let msg = ControlMessage::MakePipe {
            entry_node: 1,
            entry_terminus: 1,
        };
        let frame = msg.to_frame(&[-1, CONTROL_CODE]).unwrap();

        let mut at_central = FrameDecoder::new();
        at_central.extend(&frame);
        let hop = at_central.next_frame().unwrap().unwrap();
        assert_eq!(hop.dest, -1);

        let mut at_exit = FrameDecoder::new();
        at_exit.extend(&hop.forwarded().unwrap());
        let arrived = at_exit.next_frame().unwrap().unwrap();
        assert!(arrived.is_control());
        assert_eq!(ControlMessage::decode(&arrived.rest).unwrap(), msg);
    }

    #[test]
    fn oversized_string_is_refused() {
        let msg = ControlMessage::Identify(Identify {
            kind: LinkKind::UpwardsRelay,
            identifier: "x".repeat(u16::MAX as usize + 1),
            password: String::new(),
            port: None,
        });
        let mut buf = BytesMut::new();
        assert_eq!(msg.encode_body(&mut buf), Err(WriteError::StringTooLong));
    }
}
