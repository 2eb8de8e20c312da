//! Ladder relay wire codec.
//!
//! Every message on a relay-to-relay link is a frame:
//!
//! ```text
//! +-----------+--------------------+----------------------------------+
//! |  length   |  destination chain |  body (control message or raw)   |
//! +-----------+--------------------+----------------------------------+
//! | i32 BE    |  i16 BE x hops     |  Variable                        |
//! +-----------+--------------------+----------------------------------+
//! ```
//!
//! `length` counts every byte after the *first* destination code. A hop
//! reads the 6-byte header (`length` + first code); code `0` means the
//! frame is a control message for the hop itself, anything else is the
//! node code of the next link. Forwarding strips the consumed code and
//! shrinks `length` by two, which leaves the next code in header position.
//!
//! Terminus links carry no framing at all: raw payload is wrapped into a
//! frame only when it crosses onto a relay link.

mod control;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use control::{Accepted, ControlMessage, EntryLink, FoundCut, Identify};

/// Signed 16-bit node code. Positive codes are "upstream", negative codes
/// are "downstream", zero is reserved for control.
pub type NodeCode = i16;

/// Destination code for messages addressed to the receiving hop itself.
pub const CONTROL_CODE: NodeCode = 0;
/// Code under which boundary nodes register their central relay link.
pub const CENTRAL_RELAY_NODE_CODE: NodeCode = 0;

/// Bytes in the `length` field.
pub const LENGTH_LEN: usize = 4;
/// Bytes per node code.
pub const CODE_LEN: usize = 2;
/// Fixed header read by every hop: `length` + first destination code.
pub const HEADER_LEN: usize = LENGTH_LEN + CODE_LEN;
/// Maximum frame size on the wire, header included.
pub const MAX_PACKET_LENGTH: usize = ladder_core::MAX_PACKET_LENGTH;

pub const OP_IDENTIFY: u8 = 0x01;
pub const OP_ACCEPTED: u8 = 0x02;
pub const OP_REJECTED: u8 = 0x03;
pub const OP_PING: u8 = 0x04;
pub const OP_PONG: u8 = 0x05;
pub const OP_FOUND_CUT: u8 = 0x06;
pub const OP_MAKE_PIPE: u8 = 0x07;
pub const OP_PIPE_MADE: u8 = 0x08;
pub const OP_PIPE_FAIL: u8 = 0x09;

pub const REJECTED_ID_IN_USE: u8 = 0x01;
pub const REJECTED_ID_NOT_IN_USE: u8 = 0x02;
pub const REJECTED_WRONG_PASSWORD: u8 = 0x03;

pub const FOUND_CUT_TERMINUS: u8 = 0x01;
pub const FOUND_CUT_NODE: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Length field is zero, negative or above the packet ceiling.
    InvalidLength,
    /// Message body ended before a field was complete.
    Truncated,
    /// Bytes left over after a complete control message.
    TrailingBytes,
    UnknownOpcode(u8),
    InvalidLinkKind(u8),
    InvalidRejectReason(u8),
    InvalidCutKind(u8),
    InvalidPort(i32),
    InvalidUtf8,
}

/// Errors that can occur when writing protocol data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Frame would exceed [`MAX_PACKET_LENGTH`].
    PacketTooLarge,
    /// String does not fit a 16-bit length prefix.
    StringTooLong,
    /// A frame needs at least one destination code.
    EmptyChain,
    /// A frame must carry at least one byte after its first code.
    EmptyBody,
    /// Forwarding needs a next destination code plus payload.
    NoNextHop,
}

/// Parse result for incremental parsing.
///
/// - `Complete(T)` - parsing succeeded, contains the parsed value.
/// - `Incomplete(n)` - buffer too small; `n` is the **minimum total bytes** needed.
/// - `Invalid(e)` - protocol violation, the link should be closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult<T> {
    Complete(T),
    Incomplete(usize),
    Invalid(ParseError),
}

/// Role of a process in the relay topology. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    EntryNode,
    CentralRelay,
    ExitNode,
}

impl NodeRole {
    pub fn as_byte(self) -> i8 {
        match self {
            NodeRole::EntryNode => -1,
            NodeRole::CentralRelay => 0,
            NodeRole::ExitNode => 1,
        }
    }

    pub fn from_byte(code: i8) -> Option<Self> {
        match code {
            -1 => Some(NodeRole::EntryNode),
            0 => Some(NodeRole::CentralRelay),
            1 => Some(NodeRole::ExitNode),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeRole::EntryNode => "entry node",
            NodeRole::CentralRelay => "central relay",
            NodeRole::ExitNode => "exit node",
        })
    }
}

/// What a connected link represents relative to the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Relay link whose peer lives in the negative-code namespace.
    DownwardsRelay,
    /// Opaque byte stream to one external endpoint.
    Terminus,
    /// Relay link whose peer lives in the positive-code namespace.
    UpwardsRelay,
}

impl LinkKind {
    pub fn as_byte(self) -> i8 {
        match self {
            LinkKind::DownwardsRelay => -1,
            LinkKind::Terminus => 0,
            LinkKind::UpwardsRelay => 1,
        }
    }

    pub fn from_byte(code: i8) -> Option<Self> {
        match code {
            -1 => Some(LinkKind::DownwardsRelay),
            0 => Some(LinkKind::Terminus),
            1 => Some(LinkKind::UpwardsRelay),
            _ => None,
        }
    }

    /// The same link as seen from the other end.
    pub fn invert(self) -> Self {
        match self {
            LinkKind::DownwardsRelay => LinkKind::UpwardsRelay,
            LinkKind::Terminus => LinkKind::Terminus,
            LinkKind::UpwardsRelay => LinkKind::DownwardsRelay,
        }
    }

    pub fn is_relay(self) -> bool {
        self != LinkKind::Terminus
    }
}

/// Why the central relay refused an `IDENTIFY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// An exit node already holds the identifier.
    IdInUse,
    /// No exit node holds the identifier.
    IdNotInUse,
    WrongPassword,
}

impl RejectReason {
    pub fn as_byte(self) -> u8 {
        match self {
            RejectReason::IdInUse => REJECTED_ID_IN_USE,
            RejectReason::IdNotInUse => REJECTED_ID_NOT_IN_USE,
            RejectReason::WrongPassword => REJECTED_WRONG_PASSWORD,
        }
    }

    pub fn from_byte(code: u8) -> Option<Self> {
        match code {
            REJECTED_ID_IN_USE => Some(RejectReason::IdInUse),
            REJECTED_ID_NOT_IN_USE => Some(RejectReason::IdNotInUse),
            REJECTED_WRONG_PASSWORD => Some(RejectReason::WrongPassword),
            _ => None,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RejectReason::IdInUse => "identifier in use",
            RejectReason::IdNotInUse => "identifier not in use",
            RejectReason::WrongPassword => "wrong password",
        })
    }
}

/// A frame header parsed in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRef<'a> {
    /// First destination code.
    pub dest: NodeCode,
    /// Everything after `dest`: remaining chain codes followed by the body.
    pub rest: &'a [u8],
    /// Total bytes this frame occupies in the buffer.
    pub frame_len: usize,
}

#[inline]
pub fn parse_frame(buf: &[u8]) -> ParseResult<FrameRef<'_>> {
    if buf.len() < HEADER_LEN {
        return ParseResult::Incomplete(HEADER_LEN);
    }
    let length = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length <= 0 || length as usize > MAX_PACKET_LENGTH - HEADER_LEN {
        return ParseResult::Invalid(ParseError::InvalidLength);
    }
    let frame_len = HEADER_LEN + length as usize;
    if buf.len() < frame_len {
        return ParseResult::Incomplete(frame_len);
    }
    ParseResult::Complete(FrameRef {
        dest: read_code(&buf[LENGTH_LEN..HEADER_LEN]),
        rest: &buf[HEADER_LEN..frame_len],
        frame_len,
    })
}

/// Writes a frame addressed through `chain` carrying `body`.
///
/// # Errors
/// - `EmptyChain` if `chain` is empty.
/// - `EmptyBody` if nothing follows the first destination code.
/// - `PacketTooLarge` if the frame would exceed [`MAX_PACKET_LENGTH`].
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn write_frame(buf: &mut BytesMut, chain: &[NodeCode], body: &[u8]) -> Result<(), WriteError> {
    let (first, others) = chain.split_first().ok_or(WriteError::EmptyChain)?;
    let length = others.len() * CODE_LEN + body.len();
    if length == 0 {
        return Err(WriteError::EmptyBody);
    }
    if HEADER_LEN + length > MAX_PACKET_LENGTH {
        return Err(WriteError::PacketTooLarge);
    }
    buf.reserve(HEADER_LEN + length);
    buf.put_i32(length as i32);
    buf.put_i16(*first);
    for code in others {
        buf.put_i16(*code);
    }
    buf.extend_from_slice(body);
    Ok(())
}

/// Re-frames `rest` (as produced by [`parse_frame`]) for the next relay hop.
///
/// The consumed destination code is already gone; the next code in `rest`
/// becomes the header code and the length shrinks by one code.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn write_forward(buf: &mut BytesMut, rest: &[u8]) -> Result<(), WriteError> {
    if rest.len() <= CODE_LEN {
        return Err(WriteError::NoNextHop);
    }
    buf.reserve(LENGTH_LEN + rest.len());
    buf.put_i32((rest.len() - CODE_LEN) as i32);
    buf.extend_from_slice(rest);
    Ok(())
}

/// Wraps raw terminus bytes into frames along `chain`, at most
/// `max_chunk` payload bytes per frame.
pub fn write_raw(
    buf: &mut BytesMut,
    chain: &[NodeCode],
    payload: &[u8],
    max_chunk: usize,
) -> Result<(), WriteError> {
    if max_chunk == 0 {
        return Err(WriteError::EmptyBody);
    }
    for chunk in payload.chunks(max_chunk) {
        write_frame(buf, chain, chunk)?;
    }
    Ok(())
}

/// An owned frame split off a [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dest: NodeCode,
    pub rest: Bytes,
}

impl Frame {
    /// Whether this frame is addressed to the receiving hop.
    pub fn is_control(&self) -> bool {
        self.dest == CONTROL_CODE
    }

    /// The frame as it must be written to the next relay hop.
    pub fn forwarded(&self) -> Result<Bytes, WriteError> {
        let mut buf = BytesMut::with_capacity(LENGTH_LEN + self.rest.len());
        write_forward(&mut buf, &self.rest)?;
        Ok(buf.freeze())
    }
}

/// Accumulates bytes from a relay link and splits off complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ParseError> {
        let (dest, frame_len) = match parse_frame(&self.buf) {
            ParseResult::Complete(frame) => (frame.dest, frame.frame_len),
            ParseResult::Incomplete(_) => return Ok(None),
            ParseResult::Invalid(e) => return Err(e),
        };
        let mut frame = self.buf.split_to(frame_len);
        frame.advance(HEADER_LEN);
        Ok(Some(Frame {
            dest,
            rest: frame.freeze(),
        }))
    }
}

#[inline]
fn read_code(buf: &[u8]) -> NodeCode {
    debug_assert!(buf.len() >= CODE_LEN, "read_code requires at least 2 bytes");
    i16::from_be_bytes([buf[0], buf[1]])
}
